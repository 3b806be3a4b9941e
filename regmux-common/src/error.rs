//! Error type returned from mediator APIs.
//!
//! Every variant corresponds to exactly one [`Status`]; [`RegmuxError::status`]
//! recovers it. The extra fields are what a caller or a test actually wants
//! to inspect - which class, which feature - that `Status` alone can't carry.

use crate::status::Status;
use thiserror::Error;

/// Repeated here (rather than depending on `regmux-isa`) so this crate stays
/// free of the register/ISA data model; `regmux-isa` and `regmux-core`
/// convert their own `RegClass` into this one at the error boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorRegClass {
    Gpr,
    Simd,
    Aflags,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegmuxError {
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("register already reserved")]
    AlreadyReserved,

    #[error("register is not reserved")]
    NotReserved,

    #[error("no allowed {class:?} register satisfies the reservation request")]
    RegConflict { class: ErrorRegClass },

    #[error("no free slot available for class {class:?}")]
    OutOfSlots { class: ErrorRegClass },

    #[error("register holds no recorded application value")]
    NoAppValue,

    #[error("{feature} is not available in this build")]
    FeatureNotAvailable { feature: String },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl RegmuxError {
    /// The [`Status`] a caller checking only the coarse outcome should see.
    pub fn status(&self) -> Status {
        match self {
            RegmuxError::InvalidParameter { .. } => Status::InvalidParameter,
            RegmuxError::AlreadyReserved | RegmuxError::NotReserved => Status::InUse,
            RegmuxError::RegConflict { .. } => Status::RegConflict,
            RegmuxError::OutOfSlots { .. } => Status::OutOfSlots,
            RegmuxError::NoAppValue => Status::NoAppValue,
            RegmuxError::FeatureNotAvailable { .. } => Status::FeatureNotAvailable,
            RegmuxError::Internal { .. } => Status::Error,
        }
    }
}

/// Callback a client may register at init; see [`crate::init::init`].
///
/// Invoked for [`RegmuxError::Internal`] failures only - the client-contract
/// and resource-exhaustion variants are always returned to the caller
/// directly and never reach this callback. Returning `true` suppresses the
/// failure; returning `false` aborts the process, matching the source
/// behavior for unhandled internal invariant violations.
pub type ErrorCallback = Box<dyn Fn(Status) -> bool + Send + Sync>;
