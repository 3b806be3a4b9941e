//! Per-thread register records, slot pools and live-block bookkeeping
//! (§3 "Per-thread state" / "Register record").
//!
//! One [`ThreadState`] exists per application thread the host instruments;
//! nothing in it is shared across threads, so none of it needs locking (§5).

use regmux_isa::reg::SimdWidth;
use regmux_isa::tls::TlsLayout;
use regmux_isa::Arch;

use crate::liveness::BlockLiveness;
use crate::slot_pool::{GprSlotPool, SimdSlotPool};

/// Register record: in-use flag, app-uses counter, ever-spilled flag,
/// native flag, xchg partner, slot index (§3).
///
/// `xchg` holds the index (within the same class's record array) of
/// another dead register currently holding this one's application value;
/// it is mutually exclusive with `slot` by construction (assign one site
/// clears the other). `simd_width` is meaningless for GPR records; it
/// records the width a SIMD reservation was spilled at, so unreserve can
/// restore through the same width it spilled through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterRecord {
    pub in_use: bool,
    pub app_uses: u32,
    pub ever_spilled: bool,
    pub native: bool,
    pub xchg: Option<u8>,
    pub slot: Option<u32>,
    pub simd_width: Option<SimdWidth>,
}

impl RegisterRecord {
    /// A register record is born native (§3 "Lifecycle").
    pub fn native() -> Self {
        Self {
            native: true,
            ..Default::default()
        }
    }

    /// §3 invariant: `native ⇒ xchg is None ∧ slot is invalid`.
    pub fn respects_native_invariant(&self) -> bool {
        !self.native || (self.xchg.is_none() && self.slot.is_none())
    }

    /// §8 property 1: clean at block end.
    pub fn is_block_clean(&self) -> bool {
        !self.in_use && self.native && self.slot.is_none() && self.xchg.is_none()
    }

    /// Non-native, not currently reserved: a pending-unreserved candidate
    /// for reuse (§4.4 step 1). The pending state needs no extra flag -
    /// it is exactly "has a slot, nobody owns it right now".
    pub fn is_pending_unreserved(&self) -> bool {
        !self.native && !self.in_use
    }
}

/// Aflags are tracked separately from the GPR file: they have no register
/// index of their own, only an in-use flag, a native flag, a slot, and
/// whether they are currently parked in the accumulator (§4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AflagsRecord {
    pub in_use: bool,
    pub native: bool,
    pub slot: Option<u32>,
    pub parked_in_accumulator: bool,
}

impl AflagsRecord {
    pub fn native() -> Self {
        Self {
            native: true,
            ..Default::default()
        }
    }

    pub fn is_block_clean(&self) -> bool {
        !self.in_use && self.native && self.slot.is_none() && !self.parked_in_accumulator
    }
}

/// All per-thread mediator state: register records for both classes, the
/// aflags record, the two slot pools, the TLS layout handed back at init,
/// and the current block's live vectors once analysis has run.
pub struct ThreadState {
    pub gpr: Vec<RegisterRecord>,
    pub simd: Vec<RegisterRecord>,
    pub aflags: AflagsRecord,
    pub pending_gpr: u32,
    pub pending_simd: u32,
    pub gpr_slots: GprSlotPool,
    pub simd_slots: SimdSlotPool,
    pub layout: TlsLayout,
    /// Byte stride between consecutive primitive TLS slots; GPR-sized (the
    /// aflags slot shares this stride since it is stored the same way).
    pub gpr_slot_stride: u32,
    /// SIMD indirect-block stride in bytes; `arch.simd_widest_bytes()` at
    /// thread init.
    pub simd_slot_stride: u32,
    pub live: Option<BlockLiveness>,
}

impl ThreadState {
    pub fn new(
        arch: &dyn Arch,
        layout: TlsLayout,
        gpr_slot_stride: u32,
        runtime_gpr_slots: u32,
        simd_slot_count: u32,
    ) -> Self {
        Self {
            gpr: (0..arch.gpr_count()).map(|_| RegisterRecord::native()).collect(),
            simd: (0..arch.simd_count()).map(|_| RegisterRecord::native()).collect(),
            aflags: AflagsRecord::native(),
            pending_gpr: 0,
            pending_simd: 0,
            gpr_slots: GprSlotPool::new(layout.primitive_slot_count, runtime_gpr_slots),
            simd_slots: SimdSlotPool::new(simd_slot_count),
            layout,
            gpr_slot_stride,
            simd_slot_stride: arch.simd_widest_bytes() as u32,
            live: None,
        }
    }

    pub fn begin_block(&mut self, live: BlockLiveness) {
        self.live = Some(live);
    }

    /// Whether the current block's reverse scan observed an internal
    /// control transfer (§4.5b's conservative-restore trigger). `false`
    /// outside block-mode insertion, where no live vectors are loaded.
    pub fn bb_has_internal_flow(&self) -> bool {
        self.live.as_ref().map(BlockLiveness::bb_has_internal_flow).unwrap_or(false)
    }

    pub fn end_block(&mut self) {
        self.assert_clean();
        self.live = None;
    }

    /// §8 property 1 and §3 "After block end": every register native and
    /// unreserved, every slot free. Cheap enough to assert unconditionally
    /// in debug builds; [`ThreadState::clean_violation`] is the release-mode
    /// counterpart the mediator routes through the error callback (§7
    /// "Internal invariant failure").
    pub fn assert_clean(&self) {
        debug_assert!(
            self.gpr.iter().all(RegisterRecord::is_block_clean),
            "gpr record dirty at block end"
        );
        debug_assert!(
            self.simd.iter().all(RegisterRecord::is_block_clean),
            "simd record dirty at block end"
        );
        debug_assert!(self.aflags.is_block_clean(), "aflags record dirty at block end");
        self.gpr_slots.assert_all_released();
        self.simd_slots.assert_all_released();
    }

    /// Returns a description of the first block-end invariant violation
    /// found, or `None` if the thread is clean. Unlike [`Self::assert_clean`]
    /// this runs in release builds too, so the mediator can route a real
    /// violation through the configured error callback instead of silently
    /// shipping corrupted bookkeeping into the next block.
    pub fn clean_violation(&self) -> Option<String> {
        if let Some((i, _)) = self.gpr.iter().enumerate().find(|(_, r)| !r.is_block_clean()) {
            return Some(format!("gpr{i} record dirty at block end"));
        }
        if let Some((i, _)) = self.simd.iter().enumerate().find(|(_, r)| !r.is_block_clean()) {
            return Some(format!("simd{i} record dirty at block end"));
        }
        if !self.aflags.is_block_clean() {
            return Some("aflags record dirty at block end".into());
        }
        if !self.gpr_slots.all_released() {
            return Some("gpr slot pool has occupied slots at block end".into());
        }
        if !self.simd_slots.all_released() {
            return Some("simd slot pool has occupied slots at block end".into());
        }
        None
    }
}
