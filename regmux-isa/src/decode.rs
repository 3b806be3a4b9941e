//! Instruction decoding and machine-context access for fault-time recovery.
//!
//! The Fault Reconstructor (§4.6) never works from the live instruction
//! list - by the time a fault is reported, the faulting thread may be any
//! thread, and the code cache is read-only. It decodes raw bytes from the
//! fragment's start up to the faulting PC and classifies each decoded
//! instruction against the same idiom shapes [`crate::emit::CodeEmitter`]
//! emits.

use crate::reg::{GprId, SimdId, SimdWidth};

/// One decoded instruction, reduced to exactly the fields the idiom
/// classifier needs - never a full disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedShape {
    /// A direct TLS-offset access: `reg` moved to/from `[tls_base +
    /// offset]`. `is_store` distinguishes spill (store) from restore
    /// (load).
    DirectTlsAccess {
        reg: GprId,
        offset: u32,
        is_store: bool,
    },
    /// Load of the dedicated SIMD-block-base TLS cell into `dst`.
    LoadSimdBlockBase { dst: GprId },
    /// A SIMD move through `[base + slot*stride]`.
    SimdBaseDispAccess {
        base: GprId,
        slot: u16,
        width: SimdWidth,
        reg: SimdId,
        is_store: bool,
    },
    /// x86 `lahf`.
    Lahf,
    /// x86 `sahf`.
    Sahf,
    /// Any instruction not recognized as one of our idioms.
    Other,
}

/// Decodes raw code for the Fault Reconstructor.
pub trait Decoder {
    /// Decode one instruction at `pc`, returning its shape and its length
    /// in bytes (so the caller can advance to the next one).
    fn decode_one(&self, pc: u64) -> Option<(DecodedShape, u32)>;
}

/// Read/write access to a faulted thread's machine context, both the raw
/// (as-interrupted) context and the context the host will ultimately
/// restore the application to.
pub trait MachineContext {
    fn read_gpr(&self, reg: GprId) -> u64;
    fn write_gpr(&mut self, reg: GprId, value: u64);

    fn read_simd(&self, reg: SimdId, width: SimdWidth) -> Vec<u8>;
    fn write_simd(&mut self, reg: SimdId, width: SimdWidth, bytes: &[u8]);

    /// Raw architectural flags register value.
    fn read_aflags(&self) -> u64;
    fn write_aflags(&mut self, value: u64);
}

/// Access to a thread's TLS contents at fault time (read-only: the
/// reconstructor only ever reads a spilled value back out, it never writes
/// TLS).
pub trait TlsSnapshot {
    fn read_u64(&self, offset: u32) -> u64;
    fn read_bytes(&self, offset: u32, len: usize) -> Vec<u8>;

    /// Read `len` bytes out of indirect SIMD slot `slot`. The indirect block
    /// lives behind a pointer this same TLS segment holds (see
    /// [`crate::tls::TlsLayout::simd_block_ptr_cell`]) - resolving that
    /// pointer is a host concern, so the reconstructor never dereferences it
    /// itself.
    fn read_simd_slot(&self, slot: u32, len: usize) -> Vec<u8>;
}
