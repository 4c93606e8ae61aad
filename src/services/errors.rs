// Egress Errors
// Typed failure taxonomy for the config pipeline and the process controller

use thiserror::Error;

/// Errors from loading, rendering, persisting, or validating the egress
/// configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Ingest key is not configured")]
    MissingIngestKey,

    #[error("Egress template not found")]
    TemplateNotFound,

    #[error("Desired state unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration rejected by nginx: {diagnostics}")]
    InvalidSyntax { diagnostics: String },

    #[error("Config validator unavailable: {reason}")]
    ValidatorUnavailable { reason: String },

    #[error("Failed to write configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the egress process controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Egress process is not running")]
    NotRunning,

    #[error("Reload signal delivery failed: {reason}")]
    SignalFailed { reason: String },

    #[error("Failed to spawn egress process: {reason}")]
    SpawnFailed { reason: String },
}

/// Unified error surface for the supervisor's apply sequence
#[derive(Error, Debug)]
pub enum EgressError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}
