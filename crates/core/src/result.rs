//! Result type definition and extension traits.
//!
//! Provides a combinator for paths where a failure is logged and the caller
//! carries on without the value instead of propagating.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for volpop core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing log-and-continue handling for any Result.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "Operation failed");
                None
            }
        }
    }
}
