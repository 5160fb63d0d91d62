//! Delivery dispatcher: sends a pending upload and removes its files.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::devices::{Destination, mask_email};
use crate::error::{MailError, PipelineError};
use crate::session::{SessionStore, UserId};

/// A single outbound attachment mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub attachment: PathBuf,
}

impl OutgoingMail {
    pub fn for_book(to: &str, display_name: &str, attachment: PathBuf) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Book: {display_name}"),
            attachment,
        }
    }
}

/// The mail-delivery capability. Every error is final; nothing is retried.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// A completed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub destination: Destination,
    pub display_name: String,
}

/// Sends a user's pending file and removes it, whatever the transport says.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    sessions: Arc<dyn SessionStore>,
    transport: Arc<dyn MailTransport>,
}

impl DeliveryDispatcher {
    pub fn new(sessions: Arc<dyn SessionStore>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            sessions,
            transport,
        }
    }

    /// Deliver the user's pending file to `destination`.
    ///
    /// The session is taken atomically, so concurrent calls for one user send
    /// at most once; losers get [`PipelineError::NoPendingFile`].
    pub async fn deliver(
        &self,
        user_id: UserId,
        destination: &Destination,
    ) -> Result<Delivered, PipelineError> {
        let session = self
            .sessions
            .take_and_clear(user_id)
            .await
            .ok_or(PipelineError::NoPendingFile)?;

        info!(
            user_id = %user_id,
            file = %session.display_name,
            device = destination.display_name(),
            to = %mask_email(&destination.address),
            "Sending file via email"
        );

        let mail = OutgoingMail::for_book(
            &destination.address,
            &session.display_name,
            session.staged_file.clone(),
        );
        let result = self.transport.send(&mail).await;
        session.cleanup().await;

        match result {
            Ok(()) => {
                info!(
                    user_id = %user_id,
                    file = %session.display_name,
                    to = %mask_email(&destination.address),
                    "Successfully sent file"
                );
                Ok(Delivered {
                    destination: destination.clone(),
                    display_name: session.display_name,
                })
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Could not send file");
                Err(PipelineError::DeliveryFailed {
                    device: destination.display_name().to_string(),
                    source: e,
                })
            }
        }
    }
}
