//! Register-management mediator core: Slot Pool, Spill Emitter, Liveness
//! Analyzer, Reservation Manager, Cross-App-Instruction Shepherd and
//! Fault-Time State Reconstructor - plus the [`mediator::Mediator`] entry
//! point that wires them together behind one public surface a DBI host
//! embeds against.
//!
//! This crate depends only on `regmux-common` (status/error vocabulary,
//! init/exit bookkeeping) and `regmux-isa` (the register/liveness data model
//! and the `Arch`/`CodeEmitter`/`InstQuery` traits a host implements). It
//! never talks to a real DBI host or a real instruction encoder; those are
//! reached only through `regmux-isa`'s traits.

pub mod idiom;
pub mod liveness;
pub mod mediator;
pub mod reconstructor;
pub mod reservation;
pub mod shepherd;
pub mod slot_pool;
pub mod spill_emitter;
pub mod thread_state;

#[cfg(test)]
pub(crate) mod test_support;

pub use mediator::{Mediator, ThreadId};
pub use reservation::{ReservationClass, ReservationInfo};
pub use thread_state::{AflagsRecord, RegisterRecord, ThreadState};
