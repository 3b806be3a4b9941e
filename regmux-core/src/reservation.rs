//! Reservation Manager (§4.4): the allocator proper. Every operation is a
//! free function taking the pieces of state it needs explicitly
//! (`ThreadState`, `Arch`, `CodeEmitter`) rather than a struct that owns
//! them, since a single reservation can recursively need a second one (the
//! indirect-SIMD temp GPR) and Rust's borrow checker is much happier
//! threading `&mut` through call arguments than through nested `&mut self`
//! borrows of overlapping fields.

use log::debug;
use regmux_common::error::ErrorRegClass;
use regmux_common::RegmuxError;
use regmux_isa::emit::{Anchor, InstId};
use regmux_isa::host::OperandRegs;
use regmux_isa::liveness::AflagsMask;
use regmux_isa::reg::{PhysReg, SimdWidth};
use regmux_isa::{Arch, CodeEmitter, GprId, SimdId};

use crate::spill_emitter;
use crate::thread_state::ThreadState;

/// What to reserve: a GPR, or a SIMD register at a given width (the width
/// only matters for liveness/spill purposes - the physical register is
/// always addressed at its widest name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationClass {
    Gpr,
    Simd(SimdWidth),
}

impl ReservationClass {
    fn error_class(self) -> ErrorRegClass {
        match self {
            ReservationClass::Gpr => ErrorRegClass::Gpr,
            ReservationClass::Simd(_) => ErrorRegClass::Simd,
        }
    }
}

/// Read-only snapshot of a register's reservation state, returned by
/// [`reservation_info`] (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationInfo {
    pub in_use: bool,
    pub native: bool,
    pub ever_spilled: bool,
    pub slot: Option<u32>,
}

fn record_of<'a>(state: &'a ThreadState, reg: PhysReg) -> &'a crate::thread_state::RegisterRecord {
    match reg {
        PhysReg::Gpr(g) => &state.gpr[g.0 as usize],
        PhysReg::Simd(s) => &state.simd[s.0 as usize],
    }
}

fn record_mut<'a>(state: &'a mut ThreadState, reg: PhysReg) -> &'a mut crate::thread_state::RegisterRecord {
    match reg {
        PhysReg::Gpr(g) => &mut state.gpr[g.0 as usize],
        PhysReg::Simd(s) => &mut state.simd[s.0 as usize],
    }
}

pub fn reservation_info(state: &ThreadState, reg: PhysReg) -> ReservationInfo {
    let r = record_of(state, reg);
    ReservationInfo {
        in_use: r.in_use,
        native: r.native,
        ever_spilled: r.ever_spilled,
        slot: r.slot,
    }
}

/// Is `reg` dead at instruction `at`, per the current block's live vectors
/// (§4.4 step 2, §8 property 4)? A register outside the analyzed block (no
/// liveness recorded) is conservatively treated as not dead.
pub fn is_register_dead(state: &ThreadState, reg: PhysReg, width: Option<SimdWidth>, at: InstId) -> bool {
    let Some(live) = &state.live else { return false };
    match reg {
        PhysReg::Gpr(g) => live.gpr_liveness_at(g, at).is_dead(),
        PhysReg::Simd(s) => {
            let w = width.unwrap_or(SimdWidth::Xmm);
            live.simd_liveness_at(s, at).is_dead_at(w)
        }
    }
}

fn candidates(class: ReservationClass, arch: &dyn Arch) -> Vec<PhysReg> {
    match class {
        ReservationClass::Gpr => (0..arch.gpr_count()).map(|i| PhysReg::Gpr(GprId(i))).collect(),
        ReservationClass::Simd(_) => (0..arch.simd_count()).map(|i| PhysReg::Simd(SimdId(i))).collect(),
    }
}

fn is_host_excluded(arch: &dyn Arch, reg: PhysReg) -> bool {
    match reg {
        PhysReg::Gpr(g) => arch.is_reserved_for_host(g),
        PhysReg::Simd(_) => false,
    }
}

/// The accumulator register holds a parked-but-uncommitted aflags capture
/// (§4.4 step 4's optimization): ordinary candidate selection must leave it
/// alone, the same way it leaves a host-reserved register alone, since
/// handing it out here would silently clobber the captured flags instead of
/// going through [`try_aflags_rescue`]'s explicit eviction.
fn holds_parked_aflags(state: &ThreadState, arch: &dyn Arch, reg: PhysReg) -> bool {
    state.aflags.parked_in_accumulator && arch.accumulator() == reg.as_gpr()
}

fn find_pending_reuse(
    state: &ThreadState,
    arch: &dyn Arch,
    class: ReservationClass,
    allowed: &dyn Fn(PhysReg) -> bool,
    only_if_dead: bool,
    where_: InstId,
) -> Option<PhysReg> {
    candidates(class, arch).into_iter().find(|&reg| {
        if is_host_excluded(arch, reg) || holds_parked_aflags(state, arch, reg) || !allowed(reg) {
            return false;
        }
        let rec = record_of(state, reg);
        if !rec.is_pending_unreserved() {
            return false;
        }
        if only_if_dead {
            let width = match class {
                ReservationClass::Simd(w) => Some(w),
                ReservationClass::Gpr => None,
            };
            rec.ever_spilled || is_register_dead(state, reg, width, where_)
        } else {
            true
        }
    })
}

fn find_dead(
    state: &ThreadState,
    arch: &dyn Arch,
    class: ReservationClass,
    allowed: &dyn Fn(PhysReg) -> bool,
    where_: InstId,
) -> Option<PhysReg> {
    let width = match class {
        ReservationClass::Simd(w) => Some(w),
        ReservationClass::Gpr => None,
    };
    candidates(class, arch).into_iter().find(|&reg| {
        if is_host_excluded(arch, reg) || holds_parked_aflags(state, arch, reg) || !allowed(reg) {
            return false;
        }
        let rec = record_of(state, reg);
        !rec.in_use && is_register_dead(state, reg, width, where_)
    })
}

fn find_least_used(
    state: &ThreadState,
    arch: &dyn Arch,
    class: ReservationClass,
    allowed: &dyn Fn(PhysReg) -> bool,
) -> Option<PhysReg> {
    candidates(class, arch)
        .into_iter()
        .filter(|&reg| !is_host_excluded(arch, reg) && !holds_parked_aflags(state, arch, reg) && allowed(reg) && !record_of(state, reg).in_use)
        .min_by_key(|&reg| record_of(state, reg).app_uses)
}

/// Step 4 (x86-only): aflags are parked in the accumulator, nothing else is
/// a candidate, so evict aflags to their TLS slot and hand back the
/// accumulator.
fn try_aflags_rescue(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    allowed: &dyn Fn(PhysReg) -> bool,
    where_: InstId,
    anchor: Anchor,
) -> Option<PhysReg> {
    let accumulator = arch.accumulator()?;
    if !allowed(PhysReg::Gpr(accumulator)) {
        return None;
    }
    if state.aflags.in_use || !state.aflags.parked_in_accumulator {
        return None;
    }
    let slot = state.gpr_slots.claim_aflags_slot();
    spill_emitter::commit_parked_aflags(emitter, &state.layout, state.gpr_slot_stride, accumulator, where_, anchor);
    state.aflags.parked_in_accumulator = false;
    state.aflags.native = false;
    state.aflags.slot = Some(slot);

    let rec = record_mut(state, PhysReg::Gpr(accumulator));
    rec.in_use = true;
    rec.native = true;
    rec.slot = None;
    rec.xchg = None;
    debug!("aflags rescued out of accumulator gpr{}", accumulator.0);
    Some(PhysReg::Gpr(accumulator))
}

fn claim_pending(state: &mut ThreadState, class: ReservationClass, reg: PhysReg) {
    match class {
        ReservationClass::Gpr => state.pending_gpr = state.pending_gpr.saturating_sub(1),
        ReservationClass::Simd(_) => state.pending_simd = state.pending_simd.saturating_sub(1),
    }
    record_mut(state, reg).in_use = true;
}

/// Assigns a fresh slot to `reg` (steps 2/3): live registers get a real
/// spill store, dead registers just claim the slot.
fn assign_fresh(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    class: ReservationClass,
    reg: PhysReg,
    currently_live: bool,
    where_: InstId,
    anchor: Anchor,
) -> Result<(), RegmuxError> {
    match reg {
        PhysReg::Gpr(g) => {
            let slot = state
                .gpr_slots
                .reserve_for(g)
                .map_err(|_| RegmuxError::OutOfSlots { class: class.error_class() })?;
            if currently_live {
                spill_emitter::spill_direct(emitter, &state.layout, state.gpr_slot_stride, g, slot, where_, anchor);
            }
            let rec = &mut state.gpr[g.0 as usize];
            rec.in_use = true;
            rec.native = false;
            rec.slot = Some(slot);
            rec.xchg = None;
            rec.ever_spilled = currently_live;
        }
        PhysReg::Simd(s) => {
            let ReservationClass::Simd(width) = class else {
                unreachable!("simd reg with non-simd class")
            };
            if currently_live && !arch.supports_wide_simd_spill() && width != SimdWidth::Xmm {
                return Err(RegmuxError::FeatureNotAvailable {
                    feature: format!("{width:?} spill"),
                });
            }
            let slot = state
                .simd_slots
                .reserve_for(s)
                .map_err(|_| RegmuxError::OutOfSlots { class: class.error_class() })?;
            if currently_live {
                let allowed_temp = |r: PhysReg| r.as_gpr().is_some();
                spill_indirect_with_temp(state, arch, emitter, s, slot, width, where_, anchor, &allowed_temp)?;
            }
            let rec = &mut state.simd[s.0 as usize];
            rec.in_use = true;
            rec.native = false;
            rec.slot = Some(slot);
            rec.xchg = None;
            rec.ever_spilled = currently_live;
            rec.simd_width = Some(width);
        }
    }
    Ok(())
}

/// §4.2 `spill_indirect`: reserve a scratch GPR, emit the adjacent
/// load-base/store pair, then immediately unreserve the scratch. Both
/// nested calls happen fully outside the pair's emission window, so the
/// adjacency invariant holds regardless of what the scratch reservation
/// itself has to spill.
fn spill_indirect_with_temp(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    reg: SimdId,
    slot: u32,
    width: SimdWidth,
    where_: InstId,
    anchor: Anchor,
    allowed_temp: &dyn Fn(PhysReg) -> bool,
) -> Result<(), RegmuxError> {
    let temp = reserve(state, arch, emitter, ReservationClass::Gpr, allowed_temp, false, where_, anchor)?;
    let temp_gpr = temp.as_gpr().expect("gpr class reservation returns a gpr");
    spill_emitter::spill_indirect(emitter, temp_gpr, reg, slot, width, where_, anchor);
    unreserve(state, arch, emitter, temp, where_, anchor, false)?;
    Ok(())
}

/// `reserve(class, allowed, only_if_dead, where) -> Result<PhysReg, Status>`
/// (§4.4). Runs the five-step selection algorithm in order.
pub fn reserve(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    class: ReservationClass,
    allowed: &dyn Fn(PhysReg) -> bool,
    only_if_dead: bool,
    where_: InstId,
    anchor: Anchor,
) -> Result<PhysReg, RegmuxError> {
    if let Some(reg) = find_pending_reuse(state, arch, class, allowed, only_if_dead, where_) {
        claim_pending(state, class, reg);
        debug!("reservation reused pending-unreserved {reg}");
        return Ok(reg);
    }

    if let Some(reg) = find_dead(state, arch, class, allowed, where_) {
        assign_fresh(state, arch, emitter, class, reg, false, where_, anchor)?;
        debug!("reservation claimed dead register {reg}");
        return Ok(reg);
    }

    if !only_if_dead {
        if let Some(reg) = find_least_used(state, arch, class, allowed) {
            assign_fresh(state, arch, emitter, class, reg, true, where_, anchor)?;
            debug!("reservation fell back to least-used live register {reg}");
            return Ok(reg);
        }
    }

    if matches!(class, ReservationClass::Gpr) {
        if let Some(reg) = try_aflags_rescue(state, arch, emitter, allowed, where_, anchor) {
            return Ok(reg);
        }
    }

    Err(RegmuxError::RegConflict { class: class.error_class() })
}

pub fn reserve_dead(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    class: ReservationClass,
    allowed: &dyn Fn(PhysReg) -> bool,
    where_: InstId,
    anchor: Anchor,
) -> Result<PhysReg, RegmuxError> {
    reserve(state, arch, emitter, class, allowed, true, where_, anchor)
}

/// `unreserve(reg, where)` (§4.4). `defer` selects insertion-phase
/// (pending, lazy restore) vs. outside-insertion (immediate restore)
/// behavior.
pub fn unreserve(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    reg: PhysReg,
    where_: InstId,
    anchor: Anchor,
    defer: bool,
) -> Result<(), RegmuxError> {
    if !record_of(state, reg).in_use {
        return Err(RegmuxError::NotReserved);
    }

    if defer {
        record_mut(state, reg).in_use = false;
        match reg {
            PhysReg::Gpr(_) => state.pending_gpr += 1,
            PhysReg::Simd(_) => state.pending_simd += 1,
        }
        debug!("unreserve deferred (pending-unreserved) for {reg}");
        return Ok(());
    }

    let rec = record_of(state, reg);
    let ever_spilled = rec.ever_spilled;
    let slot = rec.slot;
    let simd_width = rec.simd_width;

    match reg {
        PhysReg::Gpr(g) => {
            if ever_spilled {
                if let Some(slot) = slot {
                    spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, g, slot, where_, anchor);
                }
            }
            if let Some(slot) = slot {
                state.gpr_slots.release(slot);
            }
        }
        PhysReg::Simd(s) => {
            let width = simd_width.unwrap_or(SimdWidth::Xmm);
            if ever_spilled {
                if let Some(slot) = slot {
                    let allowed_temp = |r: PhysReg| r.as_gpr().is_some();
                    let temp = reserve(state, arch, emitter, ReservationClass::Gpr, &allowed_temp, false, where_, anchor)?;
                    let temp_gpr = temp.as_gpr().expect("gpr class reservation returns a gpr");
                    spill_emitter::restore_indirect(emitter, temp_gpr, s, slot, width, where_, anchor);
                    unreserve(state, arch, emitter, temp, where_, anchor, false)?;
                }
            }
            if let Some(slot) = slot {
                state.simd_slots.release(slot);
            }
        }
    }

    let rec = record_mut(state, reg);
    rec.in_use = false;
    rec.native = true;
    rec.slot = None;
    rec.xchg = None;
    rec.ever_spilled = false;
    rec.simd_width = None;
    debug!("unreserve restored {reg} to native immediately");
    Ok(())
}

/// `reserve_aflags(where)` (§4.4): a client's exclusive hold on the
/// arithmetic flags, mirroring register reservation even though aflags have
/// no physical index of their own - only the one record. Already in use is
/// a hard error, the same as reserving an already-reserved register.
///
/// If the flags are dead at `where_`, nothing is captured - the client gets
/// custody of whatever garbage is there and is free to clobber it. If they
/// are live but already non-native (spilled or parked from an earlier
/// point), the existing tracking is taken over as-is. Otherwise they are
/// live and still native: captured into the accumulator via the parking
/// idiom (`lahf`/`seto`, no committing store), leaving `reserve`'s
/// candidate selection to route around it via `holds_parked_aflags` until
/// [`unreserve_aflags`] or [`try_aflags_rescue`] evicts it.
pub fn reserve_aflags(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    where_: InstId,
    anchor: Anchor,
) -> Result<(), RegmuxError> {
    if state.aflags.in_use {
        return Err(RegmuxError::AlreadyReserved);
    }

    let live = state.live.as_ref().map(|l| l.aflags_live_at(where_)).unwrap_or(AflagsMask::ALL);

    if live.is_empty() {
        if !state.aflags.native {
            if let Some(slot) = state.aflags.slot.take() {
                state.gpr_slots.release(slot);
            }
        }
        state.aflags.in_use = true;
        state.aflags.native = true;
        state.aflags.parked_in_accumulator = false;
        debug!("aflags reserved while dead, nothing captured");
        return Ok(());
    }

    if !state.aflags.native {
        state.aflags.in_use = true;
        debug!("aflags reserved over an already-tracked value");
        return Ok(());
    }

    let accumulator = arch.accumulator().ok_or_else(|| RegmuxError::FeatureNotAvailable {
        feature: "aflags accumulator idiom".into(),
    })?;
    if !allowed_for_parking(state, accumulator) {
        return Err(RegmuxError::RegConflict { class: ErrorRegClass::Gpr });
    }
    spill_emitter::park_aflags(emitter, where_, anchor)?;
    state.aflags.in_use = true;
    state.aflags.native = false;
    state.aflags.parked_in_accumulator = true;
    state.aflags.slot = None;
    debug!("aflags captured into gpr{} for client reservation", accumulator.0);
    Ok(())
}

/// The accumulator is a legal parking spot only if nothing else is already
/// sitting in it - a native register can be clobbered freely, but anything
/// reserved or pending-unreserved has an application or tool value riding
/// there that parking would silently destroy.
fn allowed_for_parking(state: &ThreadState, accumulator: GprId) -> bool {
    let rec = state.gpr[accumulator.0 as usize];
    rec.native
}

/// `unreserve_aflags(where, defer)` (§4.4): releases a client's exclusive
/// hold. Mirrors register unreserve's insertion-phase laziness: a deferred
/// call just clears `in_use` and leaves the flags exactly as they are -
/// parked in the accumulator or spilled to their slot - for the Shepherd's
/// restore-before pass or [`try_aflags_rescue`] to deal with later. A
/// non-deferred call (there being nowhere left to defer to) restores
/// immediately and frees the slot.
pub fn unreserve_aflags(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    where_: InstId,
    anchor: Anchor,
    defer: bool,
) -> Result<(), RegmuxError> {
    if !state.aflags.in_use {
        return Err(RegmuxError::NotReserved);
    }
    state.aflags.in_use = false;

    if defer {
        debug!("aflags unreserve deferred (left parked/spilled)");
        return Ok(());
    }

    if state.aflags.parked_in_accumulator {
        spill_emitter::restore_parked_aflags(emitter, where_, anchor)?;
        state.aflags.parked_in_accumulator = false;
        state.aflags.native = true;
    } else if !state.aflags.native {
        let accumulator = arch.accumulator().ok_or_else(|| RegmuxError::FeatureNotAvailable {
            feature: "aflags accumulator idiom".into(),
        })?;
        spill_emitter::restore_aflags(emitter, &state.layout, state.gpr_slot_stride, accumulator, where_, anchor)?;
        state.aflags.native = true;
    }

    if let Some(slot) = state.aflags.slot.take() {
        state.gpr_slots.release(slot);
    }
    debug!("aflags unreserved, restored to native");
    Ok(())
}

/// `get_app_value(reg, dst, where, stateful)` (§4.4): copy the application
/// value currently held by `reg` into `dst` without disturbing the
/// reservation's own bookkeeping, unless `stateful` asks us to also mark it
/// read for `app_uses` accounting.
pub fn get_app_value(
    state: &mut ThreadState,
    emitter: &mut dyn CodeEmitter,
    reg: GprId,
    dst: GprId,
    where_: InstId,
    anchor: Anchor,
    stateful: bool,
) -> Result<(), RegmuxError> {
    let rec = state.gpr[reg.0 as usize];
    if rec.native {
        emitter.emit_move_gpr(where_, anchor, dst, reg);
        return Ok(());
    }
    let slot = rec.slot.ok_or(RegmuxError::NoAppValue)?;
    if !rec.ever_spilled {
        return Err(RegmuxError::NoAppValue);
    }
    spill_emitter::restore_direct(emitter, &state.layout, state.gpr_slot_stride, dst, slot, where_, anchor);
    if stateful {
        state.gpr[reg.0 as usize].app_uses += 1;
    }
    Ok(())
}

/// SIMD counterpart of [`get_app_value`], restoring in place (`dst == reg`)
/// since the caller only ever wants `reg` itself holding its app value, not
/// a copy elsewhere - used by [`restore_app_values_for`].
fn get_simd_app_value(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    reg: SimdId,
    where_: InstId,
    anchor: Anchor,
    stateful: bool,
) -> Result<(), RegmuxError> {
    let rec = state.simd[reg.0 as usize];
    if rec.native {
        return Ok(());
    }
    let slot = rec.slot.ok_or(RegmuxError::NoAppValue)?;
    if !rec.ever_spilled {
        return Err(RegmuxError::NoAppValue);
    }
    if rec.xchg.is_some() {
        // NYI (§4.4): xchg-held SIMD app values aren't produced by this
        // allocator yet, so there is nothing to restore through.
        return Err(RegmuxError::FeatureNotAvailable {
            feature: "restoring an xchg-held simd app value".into(),
        });
    }
    let width = rec.simd_width.unwrap_or(SimdWidth::Xmm);
    let allowed_temp = |r: PhysReg| r.as_gpr().is_some();
    let temp = reserve(state, arch, emitter, ReservationClass::Gpr, &allowed_temp, false, where_, anchor)?;
    let temp_gpr = temp.as_gpr().expect("gpr class reservation returns a gpr");
    spill_emitter::restore_indirect(emitter, temp_gpr, reg, slot, width, where_, anchor);
    unreserve(state, arch, emitter, temp, where_, anchor, false)?;
    if stateful {
        state.simd[reg.0 as usize].app_uses += 1;
    }
    Ok(())
}

/// `restore_app_values_for(operand, swap, where)` (§4.4): restore every
/// register an operand references to hold its application value, in place.
///
/// SIMD registers restore first, then GPRs (mirrors the host's own operand
/// enumeration order). A GPR that is the host's stolen register can't be
/// written with its app value directly - the host still owns it - so the
/// first such GPR encountered gets redirected through `swap`: reserved
/// fresh if `swap` is `None`, reused otherwise. The caller is responsible
/// for rewriting the operand itself to reference `*swap` in place of the
/// stolen register once this returns.
///
/// A `NoAppValue` on any individual register doesn't short-circuit the
/// rest - every register in the operand still gets a restore attempt - but
/// it is remembered and returned once the whole operand has been processed,
/// unless a harder error interrupts first.
pub fn restore_app_values_for(
    state: &mut ThreadState,
    arch: &dyn Arch,
    emitter: &mut dyn CodeEmitter,
    operand: &OperandRegs,
    swap: &mut Option<GprId>,
    where_: InstId,
    anchor: Anchor,
) -> Result<(), RegmuxError> {
    let mut no_app_value = false;

    for &(reg, _width) in &operand.simd {
        match get_simd_app_value(state, arch, emitter, reg, where_, anchor, true) {
            Ok(()) => {}
            Err(RegmuxError::NoAppValue) => no_app_value = true,
            Err(e) => return Err(e),
        }
    }

    for &gpr in &operand.gprs {
        let dst = if arch.stolen_gpr() == Some(gpr) {
            let temp = match swap {
                Some(t) => *t,
                None => {
                    let allowed = |r: PhysReg| r.as_gpr().is_some();
                    let reserved = reserve(state, arch, emitter, ReservationClass::Gpr, &allowed, false, where_, anchor)?;
                    let t = reserved.as_gpr().expect("gpr class reservation returns a gpr");
                    *swap = Some(t);
                    t
                }
            };
            temp
        } else {
            gpr
        };

        match get_app_value(state, emitter, gpr, dst, where_, anchor, true) {
            Ok(()) => {}
            Err(RegmuxError::NoAppValue) => no_app_value = true,
            Err(e) => return Err(e),
        }
    }

    if no_app_value {
        Err(RegmuxError::NoAppValue)
    } else {
        Ok(())
    }
}
