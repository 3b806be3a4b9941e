//! Fault-Time State Reconstructor (§4.6): on an application fault inside
//! instrumented code, decode the emitted fragment up to the faulting PC,
//! recognize our own spill/restore idioms, and rewrite the machine context
//! so the application sees its own values.
//!
//! This never touches the live instruction list or `ThreadState` - by the
//! time a fault is reported the faulting thread's in-flight block is gone.
//! It works purely from decoded bytes and the [`crate::idiom`] catalog the
//! [`crate::spill_emitter`] is built to only ever produce.

use std::collections::HashMap;

use log::{trace, warn};
use regmux_isa::decode::{DecodedShape, Decoder, MachineContext, TlsSnapshot};
use regmux_isa::reg::SimdWidth;
use regmux_isa::tls::TlsLayout;
use regmux_isa::{GprId, SimdId};

use crate::idiom::{classify, SpillIdiom};

/// `lahf` captures AH = SF:ZF:0:AF:0:PF:1:CF and `seto al` sets AL's low bit
/// to OF; [`spill_emitter::spill_aflags`] packs both into one accumulator
/// value before storing it. This unpacks that encoding: the SAHF-restorable
/// byte in bits 8..16, OF as bit 0.
fn aflags_from_accumulator(raw_native: u64, accumulator_value: u64) -> u64 {
    let sahf_byte = (accumulator_value & 0xff00) >> 8;
    const ARITH_MASK: u64 = 0xff; // CF,PF,AF,ZF,SF,OF as the low byte of flags
    let mut newval = raw_native & !ARITH_MASK;
    newval |= sahf_byte;
    if accumulator_value & 1 != 0 {
        newval |= 1 << 11; // OF bit position in the flags register
    }
    newval
}

/// Direct-spill tracking for the reconstruction walk: which slot (if any)
/// each GPR is currently tracked spilled to.
struct GprTracker {
    spilled_to: HashMap<GprId, u32>,
    aflags_slot: Option<u32>,
    /// Set by [`GprTracker::on_lahf`], cleared by a committing store to the
    /// aflags slot or by [`GprTracker::on_sahf`]: true while the captured
    /// flags value lives only in the accumulator register, not yet (or no
    /// longer) mirrored to TLS.
    aflags_in_accumulator: bool,
}

impl GprTracker {
    fn new() -> Self {
        Self {
            spilled_to: HashMap::new(),
            aflags_slot: None,
            aflags_in_accumulator: false,
        }
    }

    /// §4.6 step 2, direct idiom: "a spill observed for a register already
    /// tracked spilled to a *different* slot is ignored (a tool temp-slot
    /// preservation, not the app-value spill)". Slot 0 is always the aflags
    /// slot (`AFLAGS_SLOT`), tracked separately from per-register slots.
    fn on_direct(&mut self, reg: GprId, offset: u32, base: u32, stride: u32, is_store: bool) {
        let slot = offset.saturating_sub(base) / stride.max(1);
        let is_aflags = slot == 0;

        if is_store {
            if is_aflags {
                self.aflags_slot = Some(slot);
                self.aflags_in_accumulator = false;
            } else if let Some(&existing) = self.spilled_to.get(&reg) {
                if existing != slot {
                    trace!("ignoring tool spill of gpr{} (already tracked at slot {existing})", reg.0);
                } else {
                    self.spilled_to.insert(reg, slot);
                }
            } else {
                self.spilled_to.insert(reg, slot);
            }
        } else if is_aflags {
            if self.aflags_slot == Some(slot) {
                self.aflags_slot = None;
            }
        } else if self.spilled_to.get(&reg) == Some(&slot) {
            self.spilled_to.remove(&reg);
        } else {
            trace!("ignoring restore of gpr{} at slot {slot} (not currently tracked there)", reg.0);
        }
    }

    fn on_lahf(&mut self) {
        self.aflags_in_accumulator = true;
    }

    fn on_sahf(&mut self) {
        self.aflags_in_accumulator = false;
    }
}

/// Same shape of tracking for indirect SIMD spills: slot -> occupant and the
/// reverse `spilled_to`/`slot_use` pair described in §3.
struct SimdTracker {
    spilled_to: HashMap<SimdId, u32>,
}

impl SimdTracker {
    fn new() -> Self {
        Self {
            spilled_to: HashMap::new(),
        }
    }

    fn on_indirect(&mut self, reg: SimdId, slot: u16, is_store: bool) {
        let slot = slot as u32;
        if is_store {
            if let Some(&existing) = self.spilled_to.get(&reg) {
                if existing != slot {
                    trace!("ignoring tool spill of simd{} (already tracked at slot {existing})", reg.0);
                } else {
                    self.spilled_to.insert(reg, slot);
                }
            } else {
                self.spilled_to.insert(reg, slot);
            }
        } else if self.spilled_to.get(&reg) == Some(&slot) {
            self.spilled_to.remove(&reg);
        } else {
            trace!("ignoring restore of simd{} at slot {slot} (not currently tracked there)", reg.0);
        }
    }
}

/// Decodes the fragment from `fragment_start` up to (but not including)
/// `faulting_pc`, then rewrites `native_ctx` so every register the walk
/// still considers spilled is patched from `tls`/`simd_block` (§4.6 steps
/// 2-3). `raw_ctx` supplies the flags value to patch around when only a
/// subset of the arithmetic flags is being reconstructed.
///
/// `accumulator` comes from the target's [`regmux_isa::Arch::accumulator`];
/// a target without the idiom (`accumulator = None`) simply never produces
/// the `Lahf`/`Sahf`/`DecodedShape` variants x86 alone emits, so the walk
/// degrades to pure direct/indirect tracking.
#[allow(clippy::too_many_arguments)]
pub fn reconstruct(
    decoder: &dyn Decoder,
    raw_ctx: &dyn MachineContext,
    native_ctx: &mut dyn MachineContext,
    tls: &dyn TlsSnapshot,
    layout: &TlsLayout,
    gpr_slot_stride: u32,
    simd_slot_stride: u32,
    accumulator: Option<GprId>,
    fragment_start: u64,
    faulting_pc: u64,
) {
    let mut gprs = GprTracker::new();
    let mut simds = SimdTracker::new();
    let slots_base = layout.primitive_slots_base.0;

    let mut pc = fragment_start;
    while pc < faulting_pc {
        let Some((shape, len)) = decoder.decode_one(pc) else {
            warn!("fault reconstruction: decode failed at pc {pc:#x}, aborting walk");
            break;
        };
        let next_pc = pc + len as u64;
        let next = if next_pc < faulting_pc { decoder.decode_one(next_pc) } else { None };
        let next_shape = next.map(|(s, _)| s);

        match classify(shape, next_shape) {
            Some((SpillIdiom::DirectGpr { reg, offset, is_store }, _consumed)) => {
                gprs.on_direct(reg, offset.0, slots_base, gpr_slot_stride, is_store);
                pc = next_pc;
            }
            Some((SpillIdiom::IndirectSimd { reg, slot, is_store, .. }, _consumed)) => {
                simds.on_indirect(reg, slot, is_store);
                // Consumes the base-load and the base+disp move together.
                pc = next_pc + next.map(|(_, l)| l as u64).unwrap_or(0);
            }
            Some((SpillIdiom::LahfAccumulator, _)) => {
                gprs.on_lahf();
                pc = next_pc;
            }
            Some((SpillIdiom::SahfAccumulator, _)) => {
                gprs.on_sahf();
                pc = next_pc;
            }
            None => pc = next_pc,
        }
    }

    if let Some(slot) = gprs.aflags_slot {
        let offset = layout.slot_offset(slot, gpr_slot_stride);
        let val = tls.read_u64(offset.0);
        native_ctx.write_aflags(aflags_from_accumulator(raw_ctx.read_aflags(), val));
        trace!("reconstructed aflags from tls slot {slot}");
    } else if gprs.aflags_in_accumulator {
        if let Some(acc) = accumulator {
            let val = native_ctx.read_gpr(acc);
            native_ctx.write_aflags(aflags_from_accumulator(raw_ctx.read_aflags(), val));
            trace!("reconstructed aflags from accumulator gpr{}", acc.0);
        }
    }

    for (reg, slot) in gprs.spilled_to {
        let offset = layout.slot_offset(slot, gpr_slot_stride);
        let val = tls.read_u64(offset.0);
        native_ctx.write_gpr(reg, val);
        trace!("reconstructed gpr{} from tls slot {slot}", reg.0);
    }

    for (reg, slot) in simds.spilled_to {
        let bytes = tls.read_simd_slot(slot, simd_slot_stride as usize);
        native_ctx.write_simd(reg, SimdWidth::Xmm, &bytes);
        trace!("reconstructed simd{} from indirect slot {slot}", reg.0);
    }
}
