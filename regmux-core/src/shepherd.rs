//! Cross-App-Instruction Shepherd (§4.5): runs around every application
//! instruction during insertion, restoring spilled application values
//! before reads and re-spilling tool values after writes.
//!
//! §9's "temp-slot trick interleaving" redesign note models the
//! before/after/next scheduling as a queue keyed by anchor; in this
//! implementation that queue is implicit rather than literal - every
//! emission already carries the [`Anchor`] it belongs at
//! (`BeforeInst`/`AfterInst`/`BeforeNext`, all relative to the current
//! `inst`), and the host's instruction list is what imposes the final
//! order, not the order these functions call `emitter` in. That is what
//! lets (e)'s app-slot re-spill (`AfterInst`) and (b)'s tool-value restore
//! (`BeforeNext`) be emitted in either call order and still land correctly
//! sequenced (§4.5 "Ordering guarantee").

use regmux_common::error::ErrorRegClass;
use regmux_common::RegmuxError;
use regmux_isa::emit::{Anchor, InstId};
use regmux_isa::host::BlockProperties;
use regmux_isa::liveness::AflagsMask;
use regmux_isa::reg::SimdWidth;
use regmux_isa::{Arch, CodeEmitter, GprId, InstQuery, SimdId};

use crate::reservation::{self, ReservationClass};
use crate::spill_emitter;
use crate::thread_state::ThreadState;

/// Runs both the aflags and GPR/SIMD shepherd rules for one application
/// instruction. Call once per app instruction, in program order, during
/// insertion (§4.5's "early/late callbacks" collapse to this single late
/// pass - nothing in this corpus's style needs a separate no-op early
/// hook).
pub fn shepherd_instruction(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    host: &dyn InstQuery,
    inst: InstId,
    block_props: BlockProperties,
    conservative: bool,
) -> Result<(), RegmuxError> {
    let is_last = host.is_last_in_block(inst);

    aflags_restore_before(state, arch, emitter, host, inst, is_last)?;

    for g in 0..arch.gpr_count() {
        gpr_shepherd_one(state, arch, emitter, host, GprId(g), inst, is_last, block_props, conservative)?;
    }

    for s in 0..arch.simd_count() {
        simd_shepherd_one(state, arch, emitter, host, SimdId(s), inst, is_last, block_props, conservative)?;
    }

    aflags_respill_after(state, arch, emitter, host, inst)?;

    Ok(())
}

/// (a) Aflags restoration.
fn aflags_restore_before(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    host: &dyn InstQuery,
    inst: InstId,
    is_last: bool,
) -> Result<(), RegmuxError> {
    if !state.aflags.native {
        let reads = host.reads_flags(inst);
        let writes = host.writes_flags(inst);
        let live_after = state
            .live
            .as_ref()
            .map(|l| l.aflags_live_at(inst))
            .unwrap_or(AflagsMask::ALL);
        let runtime_slot = state
            .aflags
            .slot
            .map(|s| state.gpr_slots.is_runtime_slot(s))
            .unwrap_or(false);

        let restore_needed = is_last || !reads.is_empty() || (!writes.is_empty() && !live_after.is_empty()) || runtime_slot;

        if restore_needed {
            if state.aflags.parked_in_accumulator {
                spill_emitter::restore_parked_aflags(emitter, inst, Anchor::BeforeInst)?;
                state.aflags.parked_in_accumulator = false;
            } else {
                let accumulator = arch.accumulator().ok_or_else(|| RegmuxError::FeatureNotAvailable {
                    feature: "aflags accumulator idiom".into(),
                })?;
                spill_emitter::restore_aflags(emitter, &state.layout, state.gpr_slot_stride, accumulator, inst, Anchor::BeforeInst)?;
            }
            state.aflags.native = true;
        }
    }

    if !state.aflags.in_use {
        state.aflags.native = true;
        if let Some(slot) = state.aflags.slot.take() {
            state.gpr_slots.release(slot);
        }
        state.aflags.parked_in_accumulator = false;
    }

    Ok(())
}

/// (d) Aflags re-spill after writes.
fn aflags_respill_after(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    host: &dyn InstQuery,
    inst: InstId,
) -> Result<(), RegmuxError> {
    let writes = host.writes_flags(inst);
    if writes.is_empty() {
        return Ok(());
    }
    let live_after = state
        .live
        .as_ref()
        .map(|l| l.aflags_live_at(inst))
        .unwrap_or(AflagsMask::ALL);
    if live_after.is_empty() {
        return Ok(());
    }

    if state.aflags.in_use {
        let accumulator = arch.accumulator().ok_or_else(|| RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        })?;
        let slot = state.gpr_slots.claim_aflags_slot();
        spill_emitter::spill_aflags(emitter, &state.layout, state.gpr_slot_stride, accumulator, inst, Anchor::AfterInst)?;
        state.aflags.native = false;
        state.aflags.slot = Some(slot);
    } else {
        state.aflags.native = true;
        state.aflags.slot = None;
    }
    Ok(())
}

fn gpr_is_forced_restore(
    state: &ThreadState,
    host: &dyn InstQuery,
    reg: GprId,
    inst: InstId,
    is_last: bool,
    block_props: BlockProperties,
) -> bool {
    let rec = state.gpr[reg.0 as usize];
    is_last
        || host.reads_gpr_inclusive(inst, reg)
        || host.writes_gpr_partial(inst, reg)
        || host.writes_gpr_conditional(inst, reg)
        || (!rec.in_use && block_props.forces_conservative_restore(state.bb_has_internal_flow()))
        || rec.slot.map(|s| state.gpr_slots.is_runtime_slot(s)).unwrap_or(false)
}

/// Emits: spill tool value (`BeforeInst`), restore app value from `reg`'s
/// own slot (`BeforeInst`), restore tool value back from a fresh temp slot
/// (`BeforeNext`). Leaves the app re-spill (if any) to the caller.
fn gpr_bracket_restore(state: &mut ThreadState, emitter: &mut dyn CodeEmitter, reg: GprId, inst: InstId) -> Result<(), RegmuxError> {
    let temp_slot = state
        .gpr_slots
        .reserve_for(reg)
        .map_err(|_| RegmuxError::OutOfSlots { class: ErrorRegClass::Gpr })?;
    spill_emitter::spill_direct(emitter, &state.layout, state.gpr_slot_stride, reg, temp_slot, inst, Anchor::BeforeInst);
    if let Some(app_slot) = state.gpr[reg.0 as usize].slot {
        spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, reg, app_slot, inst, Anchor::BeforeInst);
    }
    spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, reg, temp_slot, inst, Anchor::BeforeNext);
    state.gpr_slots.release(temp_slot);
    Ok(())
}

/// Emits: spill tool value (`BeforeInst`), app re-spill to `reg`'s own slot
/// (`AfterInst`), restore tool value from a fresh temp slot (`BeforeNext`).
/// Used when the register wasn't read this instruction but is written and
/// must still be preserved around the write.
fn gpr_bracket_write_only(state: &mut ThreadState, emitter: &mut dyn CodeEmitter, reg: GprId, inst: InstId) -> Result<(), RegmuxError> {
    let temp_slot = state
        .gpr_slots
        .reserve_for(reg)
        .map_err(|_| RegmuxError::OutOfSlots { class: ErrorRegClass::Gpr })?;
    spill_emitter::spill_direct(emitter, &state.layout, state.gpr_slot_stride, reg, temp_slot, inst, Anchor::BeforeInst);
    if let Some(app_slot) = state.gpr[reg.0 as usize].slot {
        spill_emitter::spill_direct(emitter, &state.layout, state.gpr_slot_stride, reg, app_slot, inst, Anchor::AfterInst);
    }
    spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, reg, temp_slot, inst, Anchor::BeforeNext);
    state.gpr_slots.release(temp_slot);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn gpr_shepherd_one(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    host: &dyn InstQuery,
    reg: GprId,
    inst: InstId,
    is_last: bool,
    block_props: BlockProperties,
    conservative: bool,
) -> Result<(), RegmuxError> {
    let rec = state.gpr[reg.0 as usize];
    if rec.native {
        return Ok(());
    }

    let writes_exact = host.writes_gpr_exact(inst, reg);
    let forced_restore = gpr_is_forced_restore(state, host, reg, inst, is_last, block_props);

    // A pending-unreserved register outright overwritten, with no read
    // forcing preservation: discard tracking, no restore emitted.
    if !rec.in_use && writes_exact && !forced_restore {
        let r = &mut state.gpr[reg.0 as usize];
        if let Some(slot) = r.slot.take() {
            state.gpr_slots.release(slot);
        }
        r.native = true;
        r.ever_spilled = false;
        state.pending_gpr = state.pending_gpr.saturating_sub(1);
        return Ok(());
    }

    let mut restored_for_read = false;
    let accumulator_holds_aflags = state.aflags.parked_in_accumulator && arch.accumulator() == Some(reg);

    if forced_restore {
        if !rec.in_use {
            if rec.ever_spilled {
                if let Some(slot) = rec.slot {
                    spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, reg, slot, inst, Anchor::BeforeInst);
                    state.gpr_slots.release(slot);
                }
            }
            state.pending_gpr = state.pending_gpr.saturating_sub(1);
            let r = &mut state.gpr[reg.0 as usize];
            r.native = true;
            r.slot = None;
            r.ever_spilled = false;
        } else {
            if accumulator_holds_aflags {
                let slot = state.gpr_slots.claim_aflags_slot();
                spill_emitter::spill_aflags(emitter, &state.layout, state.gpr_slot_stride, reg, inst, Anchor::BeforeInst)?;
                state.aflags.parked_in_accumulator = false;
                state.aflags.native = false;
                state.aflags.slot = Some(slot);
            }
            gpr_bracket_restore(state, emitter, reg, inst)?;
            restored_for_read = true;
        }
    }

    // (e) GPR re-spill after writes.
    let rec = state.gpr[reg.0 as usize];
    if rec.in_use && writes_exact && !accumulator_holds_aflags {
        let live_past_write = match host.next(inst) {
            Some(next) => state
                .live
                .as_ref()
                .map(|l| !l.gpr_liveness_at(reg, next).is_dead())
                .unwrap_or(true),
            None => true,
        };
        if live_past_write || conservative {
            if restored_for_read {
                if let Some(slot) = rec.slot {
                    spill_emitter::spill_direct(emitter, &state.layout, state.gpr_slot_stride, reg, slot, inst, Anchor::AfterInst);
                }
            } else {
                gpr_bracket_write_only(state, emitter, reg, inst)?;
            }
            state.gpr[reg.0 as usize].ever_spilled = true;
        }
    }

    Ok(())
}

/// Reserve-emit-unreserve a scratch GPR for one indirect spill/restore
/// emission. The nested reservation happens fully outside the adjacent
/// base-load/move pair it wraps, so the pair's adjacency invariant holds
/// regardless of what the scratch reservation itself needs to spill
/// (mirrors [`reservation::spill_indirect_with_temp`]).
fn with_scratch_gpr(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    inst: InstId,
    anchor: Anchor,
    emit: impl FnOnce(&mut ThreadState, &mut dyn CodeEmitter, GprId),
) -> Result<(), RegmuxError> {
    let allowed = |r: regmux_isa::reg::PhysReg| r.as_gpr().is_some();
    let temp = reservation::reserve(state, arch, emitter, ReservationClass::Gpr, &allowed, false, inst, anchor)?;
    let temp_gpr = temp.as_gpr().expect("gpr class reservation returns a gpr");
    emit(state, emitter, temp_gpr);
    reservation::unreserve(state, arch, emitter, temp, inst, anchor, false)
}

/// (c) SIMD restoration before reads: spill tool value, restore app value,
/// before `inst`; restore tool value back at `next`. Symmetric to
/// [`gpr_bracket_restore`] but always indirect.
fn simd_bracket_restore(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    reg: SimdId,
    width: SimdWidth,
    inst: InstId,
) -> Result<(), RegmuxError> {
    let temp_slot = state
        .simd_slots
        .reserve_for(reg)
        .map_err(|_| RegmuxError::OutOfSlots { class: ErrorRegClass::Simd })?;
    let app_slot = state.simd[reg.0 as usize].slot;

    with_scratch_gpr(state, arch, emitter, inst, Anchor::BeforeInst, |state, emitter, temp_gpr| {
        spill_emitter::spill_indirect(emitter, temp_gpr, reg, temp_slot, width, inst, Anchor::BeforeInst);
        if let Some(app_slot) = app_slot {
            spill_emitter::restore_indirect(emitter, temp_gpr, reg, app_slot, width, inst, Anchor::BeforeInst);
        }
        let _ = state;
    })?;

    with_scratch_gpr(state, arch, emitter, inst, Anchor::BeforeNext, |_state, emitter, temp_gpr| {
        spill_emitter::restore_indirect(emitter, temp_gpr, reg, temp_slot, width, inst, Anchor::BeforeNext);
    })?;

    state.simd_slots.release(temp_slot);
    Ok(())
}

/// (e)'s SIMD analog: spill tool value before `inst`, app re-spill after,
/// tool value restored at `next`. Used when the register is written but was
/// not already bracketed for a read this instruction.
fn simd_bracket_write_only(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    reg: SimdId,
    width: SimdWidth,
    inst: InstId,
) -> Result<(), RegmuxError> {
    let temp_slot = state
        .simd_slots
        .reserve_for(reg)
        .map_err(|_| RegmuxError::OutOfSlots { class: ErrorRegClass::Simd })?;
    let app_slot = state.simd[reg.0 as usize].slot;

    with_scratch_gpr(state, arch, emitter, inst, Anchor::BeforeInst, |_state, emitter, temp_gpr| {
        spill_emitter::spill_indirect(emitter, temp_gpr, reg, temp_slot, width, inst, Anchor::BeforeInst);
    })?;
    if let Some(app_slot) = app_slot {
        with_scratch_gpr(state, arch, emitter, inst, Anchor::AfterInst, |_state, emitter, temp_gpr| {
            spill_emitter::spill_indirect(emitter, temp_gpr, reg, app_slot, width, inst, Anchor::AfterInst);
        })?;
    }
    with_scratch_gpr(state, arch, emitter, inst, Anchor::BeforeNext, |_state, emitter, temp_gpr| {
        spill_emitter::restore_indirect(emitter, temp_gpr, reg, temp_slot, width, inst, Anchor::BeforeNext);
    })?;

    state.simd_slots.release(temp_slot);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn simd_shepherd_one(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    host: &dyn InstQuery,
    reg: SimdId,
    inst: InstId,
    is_last: bool,
    block_props: BlockProperties,
    conservative: bool,
) -> Result<(), RegmuxError> {
    let rec = state.simd[reg.0 as usize];
    if rec.native {
        return Ok(());
    }

    let width = rec.simd_width.unwrap_or(SimdWidth::Xmm);
    let reads = host.reads_simd(inst, reg, width);
    let writes = host.writes_simd_exact(inst, reg, width);
    let forced_restore = is_last
        || reads
        || (!rec.in_use && block_props.forces_conservative_restore(state.bb_has_internal_flow()))
        || rec.slot.map(|s| s >= state.simd_slots.capacity()).unwrap_or(false);

    // An unreserved-but-not-yet-restored SIMD register outright overwritten,
    // with nothing forcing preservation: discard tracking (§4.5 "same rule
    // for SIMD").
    if !rec.in_use && writes && !forced_restore {
        let r = &mut state.simd[reg.0 as usize];
        if let Some(slot) = r.slot.take() {
            state.simd_slots.release(slot);
        }
        r.native = true;
        r.ever_spilled = false;
        r.simd_width = None;
        state.pending_simd = state.pending_simd.saturating_sub(1);
        return Ok(());
    }

    let mut restored_for_read = false;

    if forced_restore {
        if !rec.in_use {
            if rec.ever_spilled {
                if let Some(slot) = rec.slot {
                    with_scratch_gpr(state, arch, emitter, inst, Anchor::BeforeInst, |_state, emitter, temp_gpr| {
                        spill_emitter::restore_indirect(emitter, temp_gpr, reg, slot, width, inst, Anchor::BeforeInst);
                    })?;
                    state.simd_slots.release(slot);
                }
            }
            state.pending_simd = state.pending_simd.saturating_sub(1);
            let r = &mut state.simd[reg.0 as usize];
            r.native = true;
            r.slot = None;
            r.ever_spilled = false;
            r.simd_width = None;
        } else {
            simd_bracket_restore(state, arch, emitter, reg, width, inst)?;
            restored_for_read = true;
        }
    }

    // (e)'s SIMD analog: re-spill after writes.
    let rec = state.simd[reg.0 as usize];
    if rec.in_use && writes {
        let live_past_write = match host.next(inst) {
            Some(next) => !state
                .live
                .as_ref()
                .map(|l| l.simd_liveness_at(reg, next).is_dead_at(width))
                .unwrap_or(false),
            None => true,
        };
        if live_past_write || conservative {
            if restored_for_read {
                if let Some(slot) = rec.slot {
                    with_scratch_gpr(state, arch, emitter, inst, Anchor::AfterInst, |_state, emitter, temp_gpr| {
                        spill_emitter::spill_indirect(emitter, temp_gpr, reg, slot, width, inst, Anchor::AfterInst);
                    })?;
                }
            } else {
                simd_bracket_write_only(state, arch, emitter, reg, width, inst)?;
            }
            state.simd[reg.0 as usize].ever_spilled = true;
        }
    }

    Ok(())
}
