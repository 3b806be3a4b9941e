//! Code-emission primitives the host provides and the core invokes.
//!
//! These are deliberately thin: the mediator never encodes an instruction
//! itself, it only asks the host to emit one of a fixed set of move/load/
//! store idioms at a fixed anchor relative to the instruction currently
//! being instrumented.

use crate::reg::{GprId, SimdId, SimdWidth};

/// Opaque handle to an instruction in the host's instruction list. The
/// mediator never interprets this value; it only passes it back to the
/// host alongside an [`Anchor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u64);

/// Where, relative to the application instruction currently being
/// instrumented, an emission should land. The Shepherd's scheduled-edit
/// queue (§9, "temp-slot trick") is keyed by exactly these three anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    BeforeInst,
    AfterInst,
    BeforeNext,
}

/// A TLS location a direct spill/restore addresses: a byte offset from the
/// thread's TLS segment base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsOffset(pub u32);

/// Code-emission primitives the host must provide. Every method inserts
/// exactly one (or, for the documented indirect-SIMD pair, exactly two
/// adjacent) meta instructions at `where_`, unpredicated regardless of the
/// host's auto-predication of app instructions (§4.5 "Predication").
pub trait CodeEmitter {
    /// `dst = src` (GPR to GPR).
    fn emit_move_gpr(&mut self, where_: InstId, anchor: Anchor, dst: GprId, src: GprId);

    /// Exchange the contents of two GPRs without a temporary.
    fn emit_xchg_gpr(&mut self, where_: InstId, anchor: Anchor, a: GprId, b: GprId);

    /// Direct store: `[tls_base + offset] = reg`. Used for GPR and aflags
    /// spill (§4.2 `spill_direct`).
    fn emit_store_tls(&mut self, where_: InstId, anchor: Anchor, reg: GprId, offset: TlsOffset);

    /// Direct load: `reg = [tls_base + offset]` (§4.2 `restore_direct`).
    fn emit_load_tls(&mut self, where_: InstId, anchor: Anchor, reg: GprId, offset: TlsOffset);

    /// Load the SIMD indirect block's base pointer from its dedicated TLS
    /// cell into `dst`. Must be followed immediately (no other emission in
    /// between) by [`CodeEmitter::emit_simd_store_base_disp`] or
    /// [`CodeEmitter::emit_simd_load_base_disp`] - the Fault Reconstructor
    /// pattern-matches on that adjacency (§4.2, §4.6).
    fn emit_load_simd_block_base(&mut self, where_: InstId, anchor: Anchor, dst: GprId);

    /// SIMD store through `[base + slot * stride]`.
    fn emit_simd_store_base_disp(
        &mut self,
        where_: InstId,
        anchor: Anchor,
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
    );

    /// SIMD load through `[base + slot * stride]`.
    fn emit_simd_load_base_disp(
        &mut self,
        where_: InstId,
        anchor: Anchor,
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
    );

    /// x86 `lahf`: load flags into AH. No-op (return `false`) on targets
    /// without the idiom.
    fn emit_lahf(&mut self, where_: InstId, anchor: Anchor) -> bool;

    /// x86 `sahf`: store AH into flags.
    fn emit_sahf(&mut self, where_: InstId, anchor: Anchor) -> bool;

    /// x86 `seto al`: capture the overflow flag into AL (lahf doesn't cover
    /// OF, so the accumulator idiom needs this companion).
    fn emit_seto(&mut self, where_: InstId, anchor: Anchor) -> bool;

    /// x86 `cmp al, -127`/`sahf` restoration companion: compares AL against
    /// the sentinel the matching `seto` produced, to restore OF alongside
    /// the SAHF-restorable byte.
    fn emit_cmp_al_restore_overflow(&mut self, where_: InstId, anchor: Anchor) -> bool;
}
