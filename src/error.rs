//! Error taxonomy for the Nightlight engine.
//!
//! One variant per error kind named in the job-level error handling design:
//! configuration, path-safety, io, shape, reference, and capacity. `filter`
//! is deliberately absent — `(nil, nil)` is not an error, it is `Ok(None)`
//! from `Operator::apply`.

use thiserror::Error;

/// A Nightlight engine error, tagged by kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NightlightError {
    /// Unknown operator type, invalid enum value, missing required field,
    /// or an out-of-range numeric parameter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Absolute path, or a path containing a `..` segment.
    #[error("path safety violation: {0}")]
    PathSafety(String),

    /// File read/write failure.
    #[error("io error: {0}")]
    Io(String),

    /// Inconsistent dimensions between frames, or a bad channel count.
    #[error("shape error: {0}")]
    Shape(String),

    /// Reference-frame selection failed; sticky for concurrent waiters.
    #[error("reference selection failed: {0}")]
    Reference(String),

    /// The batch scheduler found no feasible (batch_size, max_threads).
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Two or more distinct errors observed at a join, concatenated.
    #[error("{0}")]
    Many(String),
}

pub type Result<T> = std::result::Result<T, NightlightError>;

impl From<std::io::Error> for NightlightError {
    fn from(e: std::io::Error) -> Self {
        NightlightError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for NightlightError {
    fn from(e: serde_json::Error) -> Self {
        NightlightError::Configuration(e.to_string())
    }
}

impl NightlightError {
    /// Join-time aggregation rule from the error handling design: the
    /// first error observed wins, with distinct follow-on messages appended.
    pub fn join(first: Option<Self>, next: Self) -> Self {
        match first {
            None => next,
            Some(existing) => {
                let existing_msg = existing.to_string();
                let next_msg = next.to_string();
                if existing_msg == next_msg {
                    existing
                } else {
                    NightlightError::Many(format!("{existing_msg}; {next_msg}"))
                }
            }
        }
    }
}
