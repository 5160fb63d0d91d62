//! Error types for the send-to-kindle bot.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to download file on channel {name}: {reason}")]
    DownloadFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Failures of the external conversion capability.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to spawn converter {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Converter exited with status {code:?}")]
    ExitStatus { code: Option<i32> },

    #[error("Converter timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Converter reported success but {path} was not created")]
    OutputMissing { path: PathBuf },
}

/// Mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid {field} address: {reason}")]
    InvalidAddress { field: &'static str, reason: String },

    #[error("Could not attach {path}: {reason}")]
    Attachment { path: PathBuf, reason: String },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),
}

/// Per-request failures of the ingest and delivery pipeline.
///
/// Every variant is recovered locally and reported to the single affected
/// user through [`PipelineError::user_message`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Download(#[from] ChannelError),

    #[error("Conversion failed: {0}")]
    ConversionFailed(#[from] ConversionError),

    #[error("No destination devices configured")]
    NoDevices,

    #[error("No pending file for this user")]
    NoPendingFile,

    #[error("Unknown device: {label}")]
    UnknownDevice { label: String },

    #[error("Delivery to {device} failed: {source}")]
    DeliveryFailed {
        device: String,
        #[source]
        source: MailError,
    },
}

impl PipelineError {
    /// Message shown to the end user. Never carries transport detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(_) => {
                "❌ Invalid filename. Please check the file and try again.".to_string()
            }
            Self::Storage(_) => "❌ System error: could not prepare file storage".to_string(),
            Self::Download(_) => "❌ Could not download file".to_string(),
            Self::ConversionFailed(_) => "❌ Could not convert file".to_string(),
            Self::NoDevices => "❌ No Kindle devices configured".to_string(),
            Self::NoPendingFile => "❌ File not found. Please send it again.".to_string(),
            Self::UnknownDevice { .. } => "❌ Device not found".to_string(),
            Self::DeliveryFailed { device, .. } => {
                format!("❌ Could not send to {device}. Please send the file again.")
            }
        }
    }
}
