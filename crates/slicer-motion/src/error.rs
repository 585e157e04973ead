//! Error types for the motion planner.

use thiserror::Error;

use crate::config::ConfigId;

/// Errors raised while configuring the planner.
///
/// Planning itself never fails: routing problems degrade into retractions
/// and degenerate geometry is skipped.
#[derive(Error, Debug)]
pub enum PlannerError {
    /// Invalid planner settings.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Settings document could not be parsed.
    #[error("failed to parse settings: {0}")]
    Toml(#[from] toml::de::Error),

    /// A path config id that was never registered.
    #[error("unknown path config {0:?}")]
    UnknownConfig(ConfigId),
}

/// Result type for planner operations.
pub type Result<T> = std::result::Result<T, PlannerError>;
