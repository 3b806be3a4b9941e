//! Mediator-wide configuration, supplied once at init and read-only after.

use crate::error::ErrorCallback;

/// Options a client passes to [`crate::init::init`].
///
/// `error_callback` can't derive `Debug`/`Clone`/`PartialEq`, so those impls
/// are written by hand below rather than derived, same as the rest of the
/// struct's fields would suggest.
pub struct Options {
    /// GPR direct slots to reserve in TLS.
    pub num_spill_slots: u32,
    /// SIMD indirect slots to reserve in the aligned side buffer.
    pub num_spill_simd_slots: u32,
    /// Always emit a real spill store even when the register is Dead at
    /// reservation time.
    pub conservative: bool,
    /// When multiple clients init, take the max of requested slot counts
    /// instead of summing them.
    pub do_not_sum_slots: bool,
    /// Invoked on internal failure; if it returns `true`, the failure is
    /// suppressed instead of aborting the process.
    pub error_callback: Option<ErrorCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_spill_slots: 0,
            num_spill_simd_slots: 0,
            conservative: false,
            do_not_sum_slots: false,
            error_callback: None,
        }
    }
}

impl Options {
    pub fn new(num_spill_slots: u32, num_spill_simd_slots: u32) -> Self {
        Self {
            num_spill_slots,
            num_spill_simd_slots,
            ..Self::default()
        }
    }

    pub fn with_conservative(mut self, conservative: bool) -> Self {
        self.conservative = conservative;
        self
    }

    pub fn with_do_not_sum_slots(mut self, do_not_sum_slots: bool) -> Self {
        self.do_not_sum_slots = do_not_sum_slots;
        self
    }

    pub fn with_error_callback(mut self, cb: ErrorCallback) -> Self {
        self.error_callback = Some(cb);
        self
    }

    /// Fold another client's request into this one, per `do_not_sum_slots`.
    fn merge_slot_counts(&mut self, other: &Options) {
        if self.do_not_sum_slots || other.do_not_sum_slots {
            self.num_spill_slots = self.num_spill_slots.max(other.num_spill_slots);
            self.num_spill_simd_slots = self.num_spill_simd_slots.max(other.num_spill_simd_slots);
        } else {
            self.num_spill_slots += other.num_spill_slots;
            self.num_spill_simd_slots += other.num_spill_simd_slots;
        }
        self.conservative |= other.conservative;
    }
}

/// Reference-counted process-wide configuration.
///
/// The first [`Config::init`] call constructs the effective [`Options`];
/// later calls while the refcount is non-zero fold their request into the
/// existing one via [`Options::merge_slot_counts`] and bump the refcount.
/// [`Config::exit`] decrements it and only tears down once it reaches zero.
pub struct Config {
    refcount: u32,
    effective: Options,
}

impl Config {
    pub fn new(first: Options) -> Self {
        Self {
            refcount: 1,
            effective: first,
        }
    }

    /// Register another client's init request against this config.
    pub fn init(&mut self, requested: Options) {
        self.effective.merge_slot_counts(&requested);
        self.refcount += 1;
    }

    /// Unregister a client. Returns `true` once the refcount reaches zero,
    /// meaning the caller should tear down the TLS layout.
    pub fn exit(&mut self) -> bool {
        debug_assert!(self.refcount > 0, "exit() called more times than init()");
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn options(&self) -> &Options {
        &self.effective
    }

    /// Routes an internal invariant failure through the configured error
    /// callback (§7 "Internal invariant failure"). Returns `true` if the
    /// callback is present and asked to suppress the failure; `false` if
    /// there is no callback or it declined, in which case the caller is
    /// expected to abort the process.
    pub fn report_internal_failure(&self, status: crate::status::Status) -> bool {
        match &self.effective.error_callback {
            Some(cb) => cb(status),
            None => false,
        }
    }
}
