//! Error types for the sampling core.

use thiserror::Error;

/// Errors surfaced by the core library.
///
/// Numerical domain failures inside a log-density evaluation are recoverable
/// (the leapfrog wrapper turns them into a `-inf` log-probability and the
/// draw is rejected); caller-ordering violations are not.
#[derive(Error, Debug)]
pub enum Error {
    /// The log-density evaluated to NaN — e.g. `log` or `sqrt` of a
    /// negative argument somewhere in the user's model.
    #[error("domain error: log-density evaluated to NaN")]
    Domain,

    /// The sampler was used before its contract was satisfied (missing
    /// log-density callback, no variable values, mismatched lengths).
    #[error("invalid sampler state: {0}")]
    InvalidState(&'static str),
}

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;
