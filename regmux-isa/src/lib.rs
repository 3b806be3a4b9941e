//! Register-management mediator - register/liveness data model and the
//! traits the host runtime implements.
//!
//! This crate is the seam between the mediator core (`regmux-core`) and a
//! concrete DBI host and target ISA: it defines *what* a register is, *what*
//! liveness means, and the primitive operations ([`emit::CodeEmitter`],
//! [`host::InstQuery`], [`tls::ThreadLocalStorage`], [`decode::Decoder`],
//! [`decode::MachineContext`]) the core invokes without knowing how any of
//! them are actually implemented for a given architecture.

pub mod arch;
pub mod decode;
pub mod emit;
pub mod host;
pub mod liveness;
pub mod reg;
pub mod tls;

pub use arch::Arch;
pub use emit::{Anchor, CodeEmitter, InstId, TlsOffset};
pub use host::{BlockProperties, InstQuery, OperandRegs};
pub use liveness::{AflagsMask, GprLiveness, SimdLiveness};
pub use reg::{GprId, PhysReg, RegClass, SimdId, SimdWidth};
