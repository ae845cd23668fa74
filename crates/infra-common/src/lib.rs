//! Infrastructure shared by the rtcsig binaries and tests
//!
//! - [`logging`]: `tracing` subscriber setup from a [`LoggingConfig`]
//! - [`errors`]: the error type for setup failures

pub mod errors;
pub mod logging;

pub use errors::{Error, Result};
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
