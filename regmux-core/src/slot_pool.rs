//! Slot Pool (§4.1): pure find-free/mark-used/mark-free allocator over the
//! two backing stores - direct GPR/aflags slots in TLS, indirect SIMD slots
//! in the aligned side buffer.

use regmux_common::error::ErrorRegClass;
use regmux_common::{RegmuxError, Status};
use regmux_isa::{GprId, SimdId};

/// GPR slot index 0 is permanently reserved for aflags (§3 invariant).
pub const AFLAGS_SLOT: u32 = 0;

/// A GPR-direct slot pool. Indices below `tls_slot_count` map to TLS
/// writes; indices at or above it map to host-runtime-provided spill slots,
/// which are not guaranteed to survive across application instructions
/// (§4.1) - [`GprSlotPool::is_runtime_slot`] tells the Shepherd which is
/// which.
pub struct GprSlotPool {
    slot_use: Vec<Option<GprId>>,
    tls_slot_count: u32,
}

impl GprSlotPool {
    /// `tls_slot_count` is the client-configured primitive-TLS budget;
    /// `runtime_slot_count` is the host runtime's general-purpose spill
    /// slot budget, appended after it so both are addressed uniformly by
    /// index.
    pub fn new(tls_slot_count: u32, runtime_slot_count: u32) -> Self {
        let total = tls_slot_count + runtime_slot_count;
        let slot_use = vec![None; total.max(1) as usize];
        // Slot 0 is reserved for aflags: `reserve_for` skips index 0, and
        // `peek`/`release` still work on it via `claim_aflags_slot`, so
        // no sentinel occupant is needed to keep it out of the free list.
        Self {
            slot_use,
            tls_slot_count,
        }
    }

    pub fn is_runtime_slot(&self, index: u32) -> bool {
        index >= self.tls_slot_count
    }

    /// Find the first free slot at index >= 1 (slot 0 is aflags-only,
    /// claimed directly via [`GprSlotPool::claim_aflags_slot`]) and mark it
    /// used by `reg`.
    pub fn reserve_for(&mut self, reg: GprId) -> Result<u32, RegmuxError> {
        for (i, occupant) in self.slot_use.iter_mut().enumerate().skip(1) {
            if occupant.is_none() {
                *occupant = Some(reg);
                return Ok(i as u32);
            }
        }
        Err(RegmuxError::OutOfSlots {
            class: ErrorRegClass::Gpr,
        })
    }

    /// Claim the fixed aflags slot (index [`AFLAGS_SLOT`]). Idempotent in
    /// the sense that it always returns `AFLAGS_SLOT`; callers track
    /// whether aflags currently hold it.
    pub fn claim_aflags_slot(&mut self) -> u32 {
        AFLAGS_SLOT
    }

    pub fn release(&mut self, index: u32) {
        if let Some(slot) = self.slot_use.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn peek(&self, index: u32) -> Option<GprId> {
        self.slot_use.get(index as usize).copied().flatten()
    }

    /// §3 "After block end": no slot above the reserved aflags slot is
    /// occupied.
    pub fn all_released(&self) -> bool {
        self.slot_use.iter().skip(1).all(Option::is_none)
    }

    /// Debug-mode end-of-block invariant; see [`Self::all_released`] for the
    /// release-mode counterpart the mediator checks unconditionally.
    pub fn assert_all_released(&self) {
        debug_assert!(self.all_released(), "gpr slot pool has occupied slots at block end");
    }
}

/// A SIMD-indirect slot pool; every slot lives in the 64-byte-aligned
/// indirect block.
pub struct SimdSlotPool {
    slot_use: Vec<Option<SimdId>>,
}

impl SimdSlotPool {
    pub fn new(slot_count: u32) -> Self {
        Self {
            slot_use: vec![None; slot_count as usize],
        }
    }

    pub fn reserve_for(&mut self, reg: SimdId) -> Result<u32, RegmuxError> {
        for (i, occupant) in self.slot_use.iter_mut().enumerate() {
            if occupant.is_none() {
                *occupant = Some(reg);
                return Ok(i as u32);
            }
        }
        Err(RegmuxError::OutOfSlots {
            class: ErrorRegClass::Simd,
        })
    }

    pub fn release(&mut self, index: u32) {
        if let Some(slot) = self.slot_use.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn peek(&self, index: u32) -> Option<SimdId> {
        self.slot_use.get(index as usize).copied().flatten()
    }

    /// Total number of indirect slots backing this pool, for the Shepherd's
    /// stale-slot check (a record referencing an index at or beyond this
    /// was assigned against a larger pool and needs forced restoration).
    pub fn capacity(&self) -> u32 {
        self.slot_use.len() as u32
    }

    pub fn all_released(&self) -> bool {
        self.slot_use.iter().all(Option::is_none)
    }

    pub fn assert_all_released(&self) {
        debug_assert!(self.all_released(), "simd slot pool has occupied slots at block end");
    }
}
