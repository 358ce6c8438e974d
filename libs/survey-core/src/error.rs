//! Error types for survey-core.

use thiserror::Error;

/// Input that cannot be stored as given.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("geolocation must be \"<lat>|<lon>\", got {0:?}")]
    MalformedGeolocation(String),

    #[error("invalid coordinate {value:?}")]
    InvalidCoordinate { value: String },

    #[error("unknown {kind} status code {code}")]
    UnknownStatus { kind: &'static str, code: i32 },
}
