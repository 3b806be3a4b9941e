//! Physical register identities and classes.
//!
//! The mediator never hardcodes a register count or name: it addresses
//! registers by a small index within a class, and the [`crate::arch::Arch`]
//! implementation the host provides supplies the actual count, naming, and
//! exclusions (stolen register, program counter, stack pointer) for the
//! target it is running on.

use std::fmt;

/// Which physical register file a [`PhysReg`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    /// SIMD register, addressed by its widest name regardless of the width
    /// a particular reservation asked for; subwidths alias the same index.
    Simd,
}

/// A general-purpose register, identified by its index into the host's GPR
/// file (e.g. 0..16 on x86-64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GprId(pub u8);

/// A SIMD register, identified by its index into the host's vector register
/// file. Always addressed at its widest supported name (XMM/YMM/ZMM alias
/// the same `SimdId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimdId(pub u8);

/// A physical register the mediator can reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysReg {
    Gpr(GprId),
    Simd(SimdId),
}

impl PhysReg {
    pub fn class(&self) -> RegClass {
        match self {
            PhysReg::Gpr(_) => RegClass::Gpr,
            PhysReg::Simd(_) => RegClass::Simd,
        }
    }

    pub fn as_gpr(&self) -> Option<GprId> {
        match self {
            PhysReg::Gpr(id) => Some(*id),
            PhysReg::Simd(_) => None,
        }
    }

    pub fn as_simd(&self) -> Option<SimdId> {
        match self {
            PhysReg::Simd(id) => Some(*id),
            PhysReg::Gpr(_) => None,
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysReg::Gpr(GprId(n)) => write!(f, "gpr{n}"),
            PhysReg::Simd(SimdId(n)) => write!(f, "simd{n}"),
        }
    }
}

/// SIMD subwidth a reservation or a read/write can refer to; the widest
/// name addresses the physical register, narrower ones alias it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimdWidth {
    Xmm,
    Ymm,
    Zmm,
}
