//! Core types, errors and configuration shared by the volpop crates.
//!
//! - [`Error`] / [`Result`]: the error type for configuration loading.
//! - [`ResultExt`]: log-and-continue combinator for best-effort paths.
//! - [`PopulatorConfig`]: controller settings loaded from file and environment.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::PopulatorConfig;
pub use error::Error;
pub use result::{Result, ResultExt};
