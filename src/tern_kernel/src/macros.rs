//! Assertion macros backing the `api_check` and `self_check` features.
//!
//! The kernel has no recoverable failure modes: a failed check stops the
//! system through the port's halt primitive.

/// Check a precondition that can be violated by invalid API usage.
macro_rules! api_assert {
    ($Traits:ty, $cond:expr) => {
        if cfg!(feature = "api_check") && !$cond {
            $crate::halt::<$Traits>();
        }
    };
}

/// Check an internal invariant that does not directly depend on API
/// parameters.
macro_rules! self_check_assert {
    ($Traits:ty, $cond:expr) => {
        if cfg!(feature = "self_check") && !$cond {
            $crate::halt::<$Traits>();
        }
    };
}

pub(crate) use {api_assert, self_check_assert};
