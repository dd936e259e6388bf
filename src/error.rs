//! Error types for PDF signing sessions.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SignError>;

#[derive(Debug, Error)]
pub enum SignError {
    /// Invalid or missing intent/config fields. Raised before any subprocess launch.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Signing failed (exit code {exit_code}): {message}")]
    SigningFailed { exit_code: i32, message: String },

    #[error("Certificate query failed (exit code {exit_code}): {message}")]
    CertificateQuery { exit_code: i32, message: String },

    #[error("Signing tool did not finish within {limit:?} and was terminated")]
    Timeout { limit: Duration },

    #[error("Output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("Another signing session is already in progress")]
    Busy,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SignError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Short category label used in notifications and the audit log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::OutputExists(_) | Self::Toml(_) => "configuration",
            Self::Launch { .. } | Self::MissingDependency(_) => "launch",
            Self::SigningFailed { .. } => "signing_failed",
            Self::CertificateQuery { .. } => "certificate_query",
            Self::Timeout { .. } => "timeout",
            Self::Busy => "busy",
            Self::UnsupportedPlatform(_) => "unsupported_platform",
            Self::Io(_) | Self::Json(_) => "io",
        }
    }
}
