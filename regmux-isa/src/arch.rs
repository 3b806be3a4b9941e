//! The per-architecture trait the allocator is generic over.
//!
//! Everything that used to be an `#ifdef` in the source lives behind this
//! trait instead: register counts, which registers are off-limits to the
//! mediator, and the x86-only "aflags parked in the accumulator" idiom.
//! Non-x86 architectures implement [`Arch::accumulator`] as `None` and the
//! reservation manager simply never attempts the rescue step (§4.4 step 4).

use crate::liveness::AflagsBit;
use crate::reg::{GprId, SimdId};

/// Architectural description the mediator needs. One implementation per
/// target ISA, supplied by the host.
pub trait Arch {
    /// Number of addressable GPRs.
    fn gpr_count(&self) -> u8;

    /// Number of addressable SIMD registers (at their widest name).
    fn simd_count(&self) -> u8;

    /// The stack pointer register; never a reservation candidate.
    fn sp(&self) -> GprId;

    /// The host's "stolen" register, claimed for its own bookkeeping and
    /// unavailable to the mediator. `None` if the host doesn't steal one.
    fn stolen_gpr(&self) -> Option<GprId>;

    /// The architectural program counter, when it is itself a GPR index in
    /// this register file (and thus would otherwise be a reservation
    /// candidate). `None` when the PC is not GPR-addressable.
    fn pc(&self) -> Option<GprId>;

    /// The accumulator register used for the x86 aflags-in-accumulator
    /// rescue (§4.4 step 4). `None` on architectures without the idiom.
    fn accumulator(&self) -> Option<GprId> {
        None
    }

    /// Architectural arithmetic-flag bits this target exposes, e.g. on x86:
    /// CF, PF, AF, ZF, SF, OF.
    fn aflags_bits(&self) -> &'static [AflagsBit];

    /// Is `reg` ineligible for any reservation regardless of class/allowed
    /// set - the stack pointer, the stolen register, or (if GPR-addressable)
    /// the program counter?
    fn is_reserved_for_host(&self, reg: GprId) -> bool {
        reg == self.sp() || self.stolen_gpr() == Some(reg) || self.pc() == Some(reg)
    }

    /// Width in bytes of the widest SIMD register this target supports.
    fn simd_widest_bytes(&self) -> u16;

    /// Does this target support spilling SIMD registers wider than XMM
    /// (YMM/ZMM)? When `false`, `spill_indirect`/`restore_indirect` for
    /// those widths return `FeatureNotAvailable` (§9 open question: the
    /// ladder models YMM/ZMM liveness regardless, but the spill path for
    /// them is reserved for future extension).
    fn supports_wide_simd_spill(&self) -> bool {
        false
    }
}

/// A minimal, always-available GPR id list helper: every id in `0..count`
/// that [`Arch::is_reserved_for_host`] doesn't exclude.
pub fn allocatable_gprs(arch: &dyn Arch) -> Vec<GprId> {
    (0..arch.gpr_count())
        .map(GprId)
        .filter(|r| !arch.is_reserved_for_host(*r))
        .collect()
}

pub fn allocatable_simd(arch: &dyn Arch) -> Vec<SimdId> {
    (0..arch.simd_count()).map(SimdId).collect()
}
