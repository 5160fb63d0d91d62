//! Ingest pipeline — upload → sanitize → stage → convert → cache → route.
//!
//! Flow for an inbound document:
//! 1. Sanitize the declared name and pick a fresh staging directory
//! 2. Fetch the bytes and write them under the sanitized name
//! 3. Convert when the format policy requires it
//! 4. Cache the session, cleaning up any upload it supersedes
//! 5. Deliver directly (one destination) or ask which device (several)
//!
//! Every failure after staging removes the staged files before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::convert::{ConversionOrchestrator, Converter};
use crate::delivery::selector::parse_choice_token;
use crate::delivery::{Delivered, DeliveryDispatcher, DeviceChoice, DeviceSelector, MailTransport};
use crate::devices::{Destinations, DeviceRegistry, route};
use crate::error::{ChannelError, PipelineError};
use crate::format::{converted_name, extension_of, needs_conversion};
use crate::pipeline::sanitize::sanitize_file_name;
use crate::session::store::{remove_silently, remove_staging_dir};
use crate::session::{PendingSession, SessionStore, UserId};

/// Where the raw bytes of an upload come from.
///
/// Fetched only after the declared name has been accepted.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError>;
}

#[async_trait]
impl ByteSource for Vec<u8> {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError> {
        Ok(self.clone())
    }
}

/// Result of handling an inbound document.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Sent straight to the only configured destination.
    Delivered { delivered: Delivered, converted: bool },
    /// Session cached; the user must pick a device.
    AwaitingChoice(DeviceChoice),
    Failed(PipelineError),
}

impl IngestOutcome {
    /// Human-readable status for the chat user.
    pub fn message(&self) -> String {
        match self {
            Self::Delivered {
                delivered,
                converted: true,
            } => format!(
                "✅ File converted to EPUB and sent to {}!",
                delivered.destination.display_name()
            ),
            Self::Delivered { delivered, .. } => match &delivered.destination.label {
                Some(label) => format!("✅ Book sent to {label}!"),
                None => "✅ File sent successfully to your Kindle!".to_string(),
            },
            Self::AwaitingChoice(choice) => choice.prompt(),
            Self::Failed(e) => e.user_message(),
        }
    }
}

/// Result of handling a device-choice event.
#[derive(Debug)]
pub enum ChoiceOutcome {
    /// Token did not carry the bot's prefix.
    Ignored,
    Delivered(Delivered),
    Failed(PipelineError),
}

impl ChoiceOutcome {
    /// Status for the chat user; `None` when the event is not ours.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Ignored => None,
            Self::Delivered(d) => Some(format!("✅ Book sent to {}!", d.destination.display_name())),
            Self::Failed(e) => Some(e.user_message()),
        }
    }
}

/// Collaborators for [`IngestPipeline`].
pub struct PipelineDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub converter: Arc<dyn Converter>,
    pub transport: Arc<dyn MailTransport>,
    pub registry: Arc<DeviceRegistry>,
    /// Single-device destination used when the registry is empty.
    pub fallback: Option<String>,
    /// Root under which each upload gets its own directory.
    pub staging_root: PathBuf,
}

/// Composes staging, conversion, session caching and delivery.
pub struct IngestPipeline {
    sessions: Arc<dyn SessionStore>,
    converter: ConversionOrchestrator,
    selector: DeviceSelector,
    dispatcher: DeliveryDispatcher,
    destinations: Destinations,
    staging_root: PathBuf,
}

impl IngestPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let destinations = route(&deps.registry, deps.fallback.as_deref());
        Self {
            converter: ConversionOrchestrator::new(deps.converter),
            selector: DeviceSelector::new(Arc::clone(&deps.registry), Arc::clone(&deps.sessions)),
            dispatcher: DeliveryDispatcher::new(Arc::clone(&deps.sessions), deps.transport),
            sessions: deps.sessions,
            destinations,
            staging_root: deps.staging_root,
        }
    }

    /// Handle an uploaded document from `user_id`.
    pub async fn handle_document(
        &self,
        user_id: UserId,
        declared_name: &str,
        source: &dyn ByteSource,
    ) -> IngestOutcome {
        debug!(user_id = %user_id, file = declared_name, "Received document");
        match self.ingest(user_id, declared_name, source).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Upload failed");
                IngestOutcome::Failed(e)
            }
        }
    }

    async fn ingest(
        &self,
        user_id: UserId,
        declared_name: &str,
        source: &dyn ByteSource,
    ) -> Result<IngestOutcome, PipelineError> {
        let display_name = sanitize_file_name(declared_name)?;

        if self.destinations == Destinations::None {
            return Err(PipelineError::NoDevices);
        }

        let session = self.stage(user_id, &display_name, source).await?;

        if let Some(previous) = self.sessions.put(session.clone()).await {
            info!(user_id = %user_id, file = %previous.display_name, "Replacing pending upload");
            previous.cleanup_except(Some(&session)).await;
        }

        match &self.destinations {
            Destinations::Single(destination) => {
                let converted = session.staged_file != session.original_file;
                let delivered = self.dispatcher.deliver(user_id, destination).await?;
                Ok(IngestOutcome::Delivered {
                    delivered,
                    converted,
                })
            }
            Destinations::Multiple => {
                let choice = self.selector.build_choice(user_id).await?;
                Ok(IngestOutcome::AwaitingChoice(choice))
            }
            Destinations::None => Err(PipelineError::NoDevices),
        }
    }

    /// Write the upload into a fresh directory and convert it if needed.
    ///
    /// On error nothing is left behind.
    async fn stage(
        &self,
        user_id: UserId,
        display_name: &str,
        source: &dyn ByteSource,
    ) -> Result<PendingSession, PipelineError> {
        let dir = self
            .staging_root
            .join(user_id.to_string())
            .join(Uuid::new_v4().to_string());
        if let Err(e) = create_staging_dir(&dir).await {
            error!(dir = %dir.display(), error = %e, "Could not create directory");
            return Err(PipelineError::Storage(e));
        }

        let original = dir.join(display_name);
        let staged = match self.stage_in(&dir, &original, display_name, source).await {
            Ok(staged) => staged,
            Err(e) => {
                let converted = dir.join(converted_name(display_name));
                discard(&dir, &[original.as_path(), converted.as_path()]).await;
                return Err(e);
            }
        };

        Ok(PendingSession::new(user_id, staged, original, display_name).with_staging_dir(dir))
    }

    async fn stage_in(
        &self,
        dir: &Path,
        original: &Path,
        display_name: &str,
        source: &dyn ByteSource,
    ) -> Result<PathBuf, PipelineError> {
        let bytes = source.fetch().await.map_err(|e| {
            error!(error = %e, "Could not download file");
            PipelineError::Download(e)
        })?;
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput("empty payload".into()));
        }
        tokio::fs::write(original, &bytes).await?;

        let extension = extension_of(display_name);
        if !needs_conversion(&extension) {
            return Ok(original.to_path_buf());
        }

        debug!(from = %extension, "Converting to EPUB format");
        let output = dir.join(converted_name(display_name));
        self.converter.convert(original, &output).await?;
        Ok(output)
    }

    /// Handle a device-choice event carrying `token`.
    pub async fn handle_choice(&self, user_id: UserId, token: &str) -> ChoiceOutcome {
        let Some(label) = parse_choice_token(token) else {
            debug!(user_id = %user_id, token, "Unknown callback");
            return ChoiceOutcome::Ignored;
        };

        let destination = match self.selector.resolve(label) {
            Ok(d) => d,
            Err(e) => return ChoiceOutcome::Failed(e),
        };

        match self.dispatcher.deliver(user_id, &destination).await {
            Ok(delivered) => ChoiceOutcome::Delivered(delivered),
            Err(e) => {
                if matches!(e, PipelineError::NoPendingFile) {
                    warn!(user_id = %user_id, "No file in cache for user");
                }
                ChoiceOutcome::Failed(e)
            }
        }
    }
}

/// Create `<root>/<user>/<uuid>`. A cleanup of the same user's previous upload
/// may remove the empty user directory mid-way, so one retry is allowed.
async fn create_staging_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::create_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(dir).await,
        other => other,
    }
}

/// Remove whichever of `files` exist, then the staging directory.
async fn discard(dir: &Path, files: &[&Path]) {
    for file in files {
        if tokio::fs::try_exists(file).await.unwrap_or(false) {
            remove_silently(file).await;
        }
    }
    remove_staging_dir(dir).await;
}
