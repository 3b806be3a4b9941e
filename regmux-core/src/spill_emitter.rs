//! Spill Emitter (§4.2): emits the store/load idiom pairs that move values
//! between registers and slots. Stateless with respect to reservation - it
//! only knows how to lay down the bit-identical shapes the Fault
//! Reconstructor later recognizes (§4.6).

use log::trace;
use regmux_common::RegmuxError;
use regmux_isa::emit::{Anchor, InstId};
use regmux_isa::tls::TlsLayout;
use regmux_isa::{CodeEmitter, GprId, SimdId, SimdWidth};

use crate::slot_pool::AFLAGS_SLOT;

/// `[tls_base + slot*stride] = reg` (§4.2 `spill_direct`). The caller
/// (Reservation Manager) is responsible for the slot-use bookkeeping; this
/// function only emits.
pub fn spill_direct(
    emitter: &mut dyn CodeEmitter,
    layout: &TlsLayout,
    stride: u32,
    reg: GprId,
    slot: u32,
    where_: InstId,
    anchor: Anchor,
) {
    let offset = layout.slot_offset(slot, stride);
    emitter.emit_store_tls(where_, anchor, reg, offset);
    trace!("spill_direct gpr{} -> slot {slot}", reg.0);
}

/// `reg = [tls_base + slot*stride]` (§4.2 `restore_direct`).
pub fn restore_direct(
    emitter: &mut dyn CodeEmitter,
    layout: &TlsLayout,
    stride: u32,
    reg: GprId,
    slot: u32,
    where_: InstId,
    anchor: Anchor,
) {
    let offset = layout.slot_offset(slot, stride);
    emitter.emit_load_tls(where_, anchor, reg, offset);
    trace!("restore_direct gpr{} <- slot {slot}", reg.0);
}

/// Spills `reg` through the indirect SIMD block: load the block's base
/// pointer into `temp` (already reserved by the caller, §4.4), then store
/// `reg` through `[temp + slot*stride]`. These two emissions must be
/// adjacent with nothing interleaved - the Fault Reconstructor pattern-
/// matches on that adjacency (§4.2, §4.6).
pub fn spill_indirect(
    emitter: &mut dyn CodeEmitter,
    temp: GprId,
    reg: SimdId,
    slot: u32,
    width: SimdWidth,
    where_: InstId,
    anchor: Anchor,
) {
    emitter.emit_load_simd_block_base(where_, anchor, temp);
    emitter.emit_simd_store_base_disp(where_, anchor, temp, slot as u16, width, reg);
    trace!("spill_indirect simd{} -> slot {slot} via gpr{}", reg.0, temp.0);
}

pub fn restore_indirect(
    emitter: &mut dyn CodeEmitter,
    temp: GprId,
    reg: SimdId,
    slot: u32,
    width: SimdWidth,
    where_: InstId,
    anchor: Anchor,
) {
    emitter.emit_load_simd_block_base(where_, anchor, temp);
    emitter.emit_simd_load_base_disp(where_, anchor, temp, slot as u16, width, reg);
    trace!("restore_indirect simd{} <- slot {slot} via gpr{}", reg.0, temp.0);
}

/// Captures architectural flags into `accumulator` (`lahf` + `seto`) and
/// stores it to the fixed aflags slot. Returns `false` if the host's
/// `Arch`/`CodeEmitter` pair doesn't support the idiom on this target, in
/// which case the caller should surface `FeatureNotAvailable`.
pub fn spill_aflags(
    emitter: &mut dyn CodeEmitter,
    layout: &TlsLayout,
    stride: u32,
    accumulator: GprId,
    where_: InstId,
    anchor: Anchor,
) -> Result<(), RegmuxError> {
    let lahf_ok = emitter.emit_lahf(where_, anchor);
    let seto_ok = emitter.emit_seto(where_, anchor);
    if !(lahf_ok && seto_ok) {
        return Err(RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        });
    }
    let offset = layout.slot_offset(AFLAGS_SLOT, stride);
    emitter.emit_store_tls(where_, anchor, accumulator, offset);
    trace!("spill_aflags via gpr{}", accumulator.0);
    Ok(())
}

/// Captures flags into `accumulator` (`lahf` + `seto`) without committing
/// them to the aflags slot - the accumulator-parking optimization (§4.4
/// step 4): as long as nothing else needs `accumulator`, the captured value
/// can ride there until it is either read again or evicted by
/// [`commit_parked_aflags`].
pub fn park_aflags(emitter: &mut dyn CodeEmitter, where_: InstId, anchor: Anchor) -> Result<(), RegmuxError> {
    let lahf_ok = emitter.emit_lahf(where_, anchor);
    let seto_ok = emitter.emit_seto(where_, anchor);
    if !(lahf_ok && seto_ok) {
        return Err(RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        });
    }
    trace!("park_aflags (no commit)");
    Ok(())
}

/// Stores an already-parked accumulator value to the aflags slot, without
/// re-capturing flags - the eviction half of the parking optimization.
pub fn commit_parked_aflags(emitter: &mut dyn CodeEmitter, layout: &TlsLayout, stride: u32, accumulator: GprId, where_: InstId, anchor: Anchor) {
    let offset = layout.slot_offset(AFLAGS_SLOT, stride);
    emitter.emit_store_tls(where_, anchor, accumulator, offset);
    trace!("commit_parked_aflags via gpr{}", accumulator.0);
}

/// Restores flags straight from the accumulator register (`cmp`/`sahf`),
/// skipping the TLS load a parked value never needed.
pub fn restore_parked_aflags(emitter: &mut dyn CodeEmitter, where_: InstId, anchor: Anchor) -> Result<(), RegmuxError> {
    let cmp_ok = emitter.emit_cmp_al_restore_overflow(where_, anchor);
    let sahf_ok = emitter.emit_sahf(where_, anchor);
    if !(cmp_ok && sahf_ok) {
        return Err(RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        });
    }
    trace!("restore_parked_aflags (no tls load)");
    Ok(())
}

/// Symmetric restore: loads the aflags slot into `accumulator`, then
/// `cmp`/`sahf` to rebuild the flags register.
pub fn restore_aflags(
    emitter: &mut dyn CodeEmitter,
    layout: &TlsLayout,
    stride: u32,
    accumulator: GprId,
    where_: InstId,
    anchor: Anchor,
) -> Result<(), RegmuxError> {
    let offset = layout.slot_offset(AFLAGS_SLOT, stride);
    emitter.emit_load_tls(where_, anchor, accumulator, offset);
    let cmp_ok = emitter.emit_cmp_al_restore_overflow(where_, anchor);
    let sahf_ok = emitter.emit_sahf(where_, anchor);
    if !(cmp_ok && sahf_ok) {
        return Err(RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        });
    }
    trace!("restore_aflags via gpr{}", accumulator.0);
    Ok(())
}
