//! Crate-level error type and the fatal-violation path.
//!
//! Recoverable failures (configuration, wire decoding, transport, thread
//! spawning) are reported through [`Error`]. Broken runtime invariants, such
//! as a second reader on a stream or an unknown record kind reaching an
//! entity, cannot be recovered from and go through [`fatal`].

use crate::config::ConfigError;
use crate::distrib::DistribError;
use crate::entity::SchedulerError;
use crate::record::codec::CodecError;

/// Result type for streamnet-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for streamnet-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Wire encoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Distribution layer errors
    #[error("Distribution error: {0}")]
    Distrib(#[from] DistribError),

    /// Entity scheduling errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Logs a broken runtime invariant and aborts the calling entity.
///
/// # Panics
///
/// Always.
#[cold]
#[track_caller]
pub fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!("fatal runtime violation: {message}");
    panic!("fatal runtime violation: {message}");
}
