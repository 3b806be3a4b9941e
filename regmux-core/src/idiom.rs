//! The spill/restore idiom catalog shared between the Spill Emitter and the
//! Fault Reconstructor (§9 "Pattern-matching on raw instruction byte
//! sequences for fault recovery").
//!
//! The emitter only ever produces sequences that classify as one of these
//! variants; [`classify`] is the same pure function the reconstructor walks
//! decoded code with, so a test can assert every idiom the emitter produces
//! round-trips through decode -> classify.

use regmux_isa::decode::DecodedShape;
use regmux_isa::emit::TlsOffset;
use regmux_isa::reg::SimdWidth;
use regmux_isa::{GprId, SimdId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillIdiom {
    /// A GPR or aflags direct TLS access.
    DirectGpr { reg: GprId, offset: TlsOffset, is_store: bool },
    /// A SIMD indirect access: the base-load and the base+disp move it
    /// immediately precedes, taken together.
    IndirectSimd {
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
        is_store: bool,
    },
    /// x86 `lahf`/`seto`: flags captured into the accumulator.
    LahfAccumulator,
    /// x86 `sahf`/`cmp`: flags restored from the accumulator.
    SahfAccumulator,
}

/// Classify one decoded instruction, given the instruction immediately
/// following it (needed to recognize the indirect-SIMD pair). Returns the
/// idiom together with how many decoded instructions it consumed (1, or 2
/// for the indirect pair) so the caller can advance its cursor correctly.
pub fn classify(shape: DecodedShape, next: Option<DecodedShape>) -> Option<(SpillIdiom, usize)> {
    match shape {
        DecodedShape::DirectTlsAccess { reg, offset, is_store } => Some((
            SpillIdiom::DirectGpr {
                reg,
                offset: TlsOffset(offset),
                is_store,
            },
            1,
        )),
        DecodedShape::LoadSimdBlockBase { dst } => match next {
            Some(DecodedShape::SimdBaseDispAccess {
                base,
                slot,
                width,
                reg,
                is_store,
            }) if base == dst => Some((
                SpillIdiom::IndirectSimd {
                    base,
                    slot,
                    width,
                    reg,
                    is_store,
                },
                2,
            )),
            _ => None,
        },
        DecodedShape::Lahf => Some((SpillIdiom::LahfAccumulator, 1)),
        DecodedShape::Sahf => Some((SpillIdiom::SahfAccumulator, 1)),
        DecodedShape::SimdBaseDispAccess { .. } | DecodedShape::Other => None,
    }
}
