//! Device selector — renders the device picker and resolves the user's pick.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::devices::{Destination, DeviceRegistry, mask_email};
use crate::error::PipelineError;
use crate::session::{SessionStore, UserId};

/// Prefix of every choice token issued by the bot.
pub const CALLBACK_DATA_PREFIX: &str = "send_kindle:";

/// Buttons per keyboard row.
pub const BUTTONS_PER_ROW: usize = 2;

/// Encode a device label as a choice token.
pub fn choice_token(label: &str) -> String {
    format!("{CALLBACK_DATA_PREFIX}{label}")
}

/// Extract the device label from a choice token. Foreign tokens yield `None`.
pub fn parse_choice_token(token: &str) -> Option<&str> {
    token.strip_prefix(CALLBACK_DATA_PREFIX)
}

/// One selectable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceButton {
    pub label: String,
    pub token: String,
}

/// Device picker for a pending upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChoice {
    pub display_name: String,
    pub rows: Vec<Vec<ChoiceButton>>,
}

impl DeviceChoice {
    /// Prompt text shown above the buttons.
    pub fn prompt(&self) -> String {
        format!(
            "📱 Which Kindle device would you like to send '{}' to?\n\nSelect one:",
            self.display_name
        )
    }

    /// Labels in presentation order.
    pub fn labels(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .map(|b| b.label.as_str())
            .collect()
    }
}

/// Builds device pickers and resolves selections against the registry.
///
/// Resolving never consumes the session; only the dispatcher does.
#[derive(Clone)]
pub struct DeviceSelector {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<dyn SessionStore>,
}

impl DeviceSelector {
    pub fn new(registry: Arc<DeviceRegistry>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { registry, sessions }
    }

    /// Picker for the user's pending upload.
    pub async fn build_choice(&self, user_id: UserId) -> Result<DeviceChoice, PipelineError> {
        let session = self
            .sessions
            .get(user_id)
            .await
            .ok_or(PipelineError::NoPendingFile)?;

        let buttons: Vec<ChoiceButton> = self
            .registry
            .iter()
            .map(|(label, address)| {
                debug!(label, address = %mask_email(address), "Device button");
                ChoiceButton {
                    label: label.to_string(),
                    token: choice_token(label),
                }
            })
            .collect();

        Ok(DeviceChoice {
            display_name: session.display_name,
            rows: buttons
                .chunks(BUTTONS_PER_ROW)
                .map(<[ChoiceButton]>::to_vec)
                .collect(),
        })
    }

    /// Look up the address for a chosen label.
    pub fn resolve(&self, label: &str) -> Result<Destination, PipelineError> {
        match self.registry.get(label) {
            Some(address) => Ok(Destination {
                label: Some(label.to_string()),
                address: address.to_string(),
            }),
            None => {
                warn!(label, "Device not found");
                Err(PipelineError::UnknownDevice {
                    label: label.to_string(),
                })
            }
        }
    }
}
