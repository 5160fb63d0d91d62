//! Telegram channel: long-polls the Bot API for documents and button presses.
//!
//! Every update is turned into a [`BotEvent`] and handled on its own task, so
//! one slow conversion never holds up other users.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::delivery::DeviceChoice;
use crate::error::ChannelError;
use crate::pipeline::{ByteSource, IngestOutcome, IngestPipeline};
use crate::session::UserId;

const API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll before trying again.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

const HELP_TEXT: &str = "📚 Send me a document and I'll deliver it to your Kindle.";

const CHOICE_FAILED_TEXT: &str = "❌ Could not show device selection. Please try again.";

// ── Bot API wire types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub document: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

// ── Events ─────────────────────────────────────────────────────────

/// Who sent an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
}

impl Sender {
    fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

/// An update the bot acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    Document {
        sender: Sender,
        chat_id: i64,
        file_id: String,
        file_name: String,
    },
    Choice {
        sender: Sender,
        chat_id: i64,
        callback_id: String,
        data: String,
    },
    Text {
        sender: Sender,
        chat_id: i64,
    },
}

impl BotEvent {
    pub fn sender(&self) -> &Sender {
        match self {
            Self::Document { sender, .. } | Self::Choice { sender, .. } | Self::Text { sender, .. } => {
                sender
            }
        }
    }
}

/// Map a raw update to an event. Updates without a sender are dropped.
pub fn parse_update(update: &Update) -> Option<BotEvent> {
    if let Some(query) = &update.callback_query {
        let chat_id = query
            .message
            .as_ref()
            .map_or(query.from.id, |m| m.chat.id);
        return Some(BotEvent::Choice {
            sender: Sender::from_user(&query.from),
            chat_id,
            callback_id: query.id.clone(),
            data: query.data.clone().unwrap_or_default(),
        });
    }

    let message = update.message.as_ref()?;
    let sender = Sender::from_user(message.from.as_ref()?);
    let chat_id = message.chat.id;

    match &message.document {
        Some(doc) => Some(BotEvent::Document {
            sender,
            chat_id,
            file_id: doc.file_id.clone(),
            file_name: doc.file_name.clone().unwrap_or_default(),
        }),
        None if message.text.is_some() => Some(BotEvent::Text { sender, chat_id }),
        None => None,
    }
}

/// Decode a `getUpdates` batch one update at a time, advancing `offset` past
/// every update that carries an id. Malformed updates are logged and skipped.
pub fn decode_batch(batch: Vec<serde_json::Value>, offset: &mut i64) -> Vec<Update> {
    let mut updates = Vec::with_capacity(batch.len());
    for raw in batch {
        if let Some(id) = raw.get("update_id").and_then(serde_json::Value::as_i64) {
            *offset = (*offset).max(id + 1);
        }
        match serde_json::from_value::<Update>(raw) {
            Ok(update) => updates.push(update),
            Err(e) => tracing::warn!("Telegram: skipping malformed update: {e}"),
        }
    }
    updates
}

/// `reply_markup` payload for a device picker.
pub fn keyboard_markup(choice: &DeviceChoice) -> serde_json::Value {
    let rows: Vec<Vec<serde_json::Value>> = choice
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.token }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

// ── Channel ────────────────────────────────────────────────────────

/// Telegram channel, connected to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.bot_token.expose_secret())
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{API_BASE}/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    /// Check a sender against the allowlist by username and numeric id.
    pub fn is_sender_allowed(&self, sender: &Sender) -> bool {
        let id = sender.id.to_string();
        let mut identities = vec![id.as_str()];
        if let Some(name) = sender.username.as_deref() {
            identities.push(name);
        }
        check_user_allowed(&self.allowed_users, identities)
    }

    /// POST a Bot API method and unwrap its `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        let status = resp.status();
        let data: ApiResponse<T> = resp.json().await.map_err(http_error)?;
        match data {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(ChannelError::Http(format!(
                "{method} returned {status}: {}",
                description.unwrap_or_default()
            ))),
        }
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.call::<serde_json::Value>("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await
            .map(drop)
            .map_err(|e| send_failed(e.to_string()))
    }

    /// Send the device picker as an inline keyboard.
    pub async fn send_choice(&self, chat_id: i64, choice: &DeviceChoice) -> Result<(), ChannelError> {
        let body = json!({
            "chat_id": chat_id,
            "text": choice.prompt(),
            "reply_markup": keyboard_markup(choice),
        });
        self.call::<serde_json::Value>("sendMessage", body)
            .await
            .map(drop)
            .map_err(|e| send_failed(e.to_string()))
    }

    /// Acknowledge a button press so the client stops its spinner.
    pub async fn answer_callback(&self, callback_id: &str) -> Result<(), ChannelError> {
        self.call::<bool>(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_id }),
        )
        .await
        .map(drop)
    }

    /// Download a file by its Bot API file id.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        let file: File = self
            .call("getFile", json!({ "file_id": file_id }))
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        let path = file
            .file_path
            .ok_or_else(|| download_failed("getFile returned no file_path".into()))?;

        let resp = self
            .client
            .get(self.file_url(&path))
            .send()
            .await
            .map_err(|e| download_failed(http_error(e).to_string()))?;
        if !resp.status().is_success() {
            return Err(download_failed(format!(
                "file download returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_failed(http_error(e).to_string()))?;
        Ok(bytes.to_vec())
    }

    pub async fn health_check(&self) -> Result<(), ChannelError> {
        self.call::<serde_json::Value>("getMe", json!({}))
            .await
            .map(drop)
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })
    }

    /// Fetch the next raw batch of updates after `offset`.
    async fn poll(&self, offset: i64) -> Result<Vec<serde_json::Value>, ChannelError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    /// Poll forever, handing each event to `pipeline` on its own task.
    pub async fn run(self: Arc<Self>, pipeline: Arc<IngestPipeline>) {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let batch = match self.poll(offset).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                }
            };

            for update in decode_batch(batch, &mut offset) {
                let Some(event) = parse_update(&update) else {
                    continue;
                };

                let channel = Arc::clone(&self);
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    channel.handle_event(&pipeline, event).await;
                });
            }
        }
    }

    async fn handle_event(&self, pipeline: &IngestPipeline, event: BotEvent) {
        let sender = event.sender().clone();
        if !self.is_sender_allowed(&sender) {
            tracing::warn!(
                "Telegram: ignoring update from unauthorized user: username={}, user_id={}",
                sender.username.as_deref().unwrap_or("unknown"),
                sender.id
            );
            if let BotEvent::Choice { callback_id, .. } = &event {
                self.answer_quietly(callback_id).await;
            }
            return;
        }

        let user_id = UserId(sender.id);
        match event {
            BotEvent::Document {
                chat_id,
                file_id,
                file_name,
                ..
            } => {
                tracing::info!(user_id = %user_id, file = %file_name, "Received document");
                let source = TelegramFile {
                    channel: self,
                    file_id,
                };
                let outcome = pipeline
                    .handle_document(user_id, &file_name, &source)
                    .await;
                self.reply_ingest(chat_id, &outcome).await;
            }
            BotEvent::Choice {
                chat_id,
                callback_id,
                data,
                ..
            } => {
                self.answer_quietly(&callback_id).await;
                let outcome = pipeline.handle_choice(user_id, &data).await;
                if let Some(text) = outcome.message() {
                    self.reply(chat_id, &text).await;
                }
            }
            BotEvent::Text { chat_id, .. } => self.reply(chat_id, HELP_TEXT).await,
        }
    }

    async fn reply_ingest(&self, chat_id: i64, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::AwaitingChoice(choice) => {
                if let Err(e) = self.send_choice(chat_id, choice).await {
                    tracing::error!(chat_id, error = %e, "Could not send device selection");
                    self.reply(chat_id, CHOICE_FAILED_TEXT).await;
                }
            }
            other => self.reply(chat_id, &other.message()).await,
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.send_message(chat_id, text).await {
            tracing::error!(chat_id, error = %e, "Could not send message");
        }
    }

    async fn answer_quietly(&self, callback_id: &str) {
        if let Err(e) = self.answer_callback(callback_id).await {
            tracing::warn!(error = %e, "Could not answer callback query");
        }
    }
}

/// A document on Telegram's servers, fetched on demand.
pub struct TelegramFile<'a> {
    channel: &'a TelegramChannel,
    file_id: String,
}

#[async_trait]
impl ByteSource for TelegramFile<'_> {
    async fn fetch(&self) -> Result<Vec<u8>, ChannelError> {
        self.channel.download(&self.file_id).await
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// reqwest errors carry the request URL, which embeds the bot token.
fn http_error(e: reqwest::Error) -> ChannelError {
    ChannelError::Http(e.without_url().to_string())
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

fn download_failed(reason: String) -> ChannelError {
    ChannelError::DownloadFailed {
        name: "telegram".into(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::ChoiceButton;

    fn channel(allowed: &[&str]) -> TelegramChannel {
        TelegramChannel::new(
            SecretString::from("123:ABC"),
            allowed.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn sender(id: i64, username: Option<&str>) -> Sender {
        Sender {
            id,
            username: username.map(String::from),
        }
    }

    fn update(value: serde_json::Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn telegram_api_url() {
        let ch = channel(&[]);
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_file_url() {
        let ch = channel(&[]);
        assert_eq!(
            ch.file_url("documents/file_1.fb2"),
            "https://api.telegram.org/file/bot123:ABC/documents/file_1.fb2"
        );
    }

    #[test]
    fn telegram_sender_allowed_wildcard() {
        let ch = channel(&["*"]);
        assert!(ch.is_sender_allowed(&sender(1, Some("anyone"))));
        assert!(ch.is_sender_allowed(&sender(2, None)));
    }

    #[test]
    fn telegram_sender_exact_match_not_substring() {
        let ch = channel(&["alice"]);
        assert!(ch.is_sender_allowed(&sender(1, Some("alice"))));
        assert!(!ch.is_sender_allowed(&sender(1, Some("alice_bot"))));
        assert!(!ch.is_sender_allowed(&sender(1, Some("malice"))));
        assert!(!ch.is_sender_allowed(&sender(1, Some(""))));
    }

    #[test]
    fn telegram_user_denied_empty() {
        assert!(!channel(&[]).is_sender_allowed(&sender(1, Some("alice"))));
    }

    #[test]
    fn telegram_sender_allowed_by_numeric_id() {
        let ch = channel(&["123456789"]);
        assert!(ch.is_sender_allowed(&sender(123456789, None)));
        assert!(!ch.is_sender_allowed(&sender(42, Some("eve"))));
    }

    #[test]
    fn telegram_sender_allowed_by_username() {
        let ch = channel(&["alice", "987654321"]);
        assert!(ch.is_sender_allowed(&sender(1, Some("alice"))));
        assert!(!ch.is_sender_allowed(&sender(123456789, Some("Alice"))));
    }

    #[test]
    fn parse_document_update() {
        let up = update(json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "chat": { "id": 555, "type": "private" },
                "from": { "id": 7, "is_bot": false, "username": "alice" },
                "document": { "file_id": "F1", "file_name": "book.fb2", "file_size": 1024 }
            }
        }));
        assert_eq!(
            parse_update(&up),
            Some(BotEvent::Document {
                sender: sender(7, Some("alice")),
                chat_id: 555,
                file_id: "F1".into(),
                file_name: "book.fb2".into(),
            })
        );
    }

    #[test]
    fn parse_document_without_name_yields_empty_name() {
        let up = update(json!({
            "update_id": 11,
            "message": {
                "chat": { "id": 1 },
                "from": { "id": 1 },
                "document": { "file_id": "F2" }
            }
        }));
        assert!(matches!(
            parse_update(&up),
            Some(BotEvent::Document { ref file_name, .. }) if file_name.is_empty()
        ));
    }

    #[test]
    fn parse_callback_update() {
        let up = update(json!({
            "update_id": 12,
            "callback_query": {
                "id": "cb1",
                "from": { "id": 7, "username": "alice" },
                "message": { "chat": { "id": 555 } },
                "data": "send_kindle:Oasis"
            }
        }));
        assert_eq!(
            parse_update(&up),
            Some(BotEvent::Choice {
                sender: sender(7, Some("alice")),
                chat_id: 555,
                callback_id: "cb1".into(),
                data: "send_kindle:Oasis".into(),
            })
        );
    }

    #[test]
    fn parse_callback_without_message_replies_to_sender() {
        let up = update(json!({
            "update_id": 13,
            "callback_query": { "id": "cb2", "from": { "id": 9 } }
        }));
        assert!(matches!(
            parse_update(&up),
            Some(BotEvent::Choice { chat_id: 9, ref data, .. }) if data.is_empty()
        ));
    }

    #[test]
    fn parse_text_and_ignored_updates() {
        let text = update(json!({
            "update_id": 14,
            "message": { "chat": { "id": 3 }, "from": { "id": 3 }, "text": "/start" }
        }));
        assert!(matches!(parse_update(&text), Some(BotEvent::Text { chat_id: 3, .. })));

        let sticker = update(json!({
            "update_id": 15,
            "message": { "chat": { "id": 3 }, "from": { "id": 3 } }
        }));
        assert_eq!(parse_update(&sticker), None);

        let channel_post = update(json!({
            "update_id": 16,
            "message": { "chat": { "id": 3 }, "text": "hi" }
        }));
        assert_eq!(parse_update(&channel_post), None);

        assert_eq!(parse_update(&update(json!({ "update_id": 17 }))), None);
    }

    #[test]
    fn decode_batch_skips_malformed_updates() {
        let batch = vec![
            json!({ "update_id": 20, "message": { "chat": { "id": 1 }, "from": { "id": 1 }, "text": "hi" } }),
            json!({ "update_id": 21, "message": { "from": { "id": 1 } } }),
            json!({ "update_id": 22, "callback_query": { "id": "cb", "from": { "id": 2 } } }),
            json!({ "no_id": true }),
        ];
        let mut offset = 0;

        let updates = decode_batch(batch, &mut offset);
        let ids: Vec<i64> = updates.iter().map(|u| u.update_id).collect();
        assert_eq!(ids, vec![20, 22]);
        assert_eq!(offset, 23);
    }

    #[test]
    fn decode_batch_advances_past_trailing_malformed_update() {
        let batch = vec![json!({ "update_id": 40, "callback_query": { "id": 5 } })];
        let mut offset = 10;

        assert!(decode_batch(batch, &mut offset).is_empty());
        assert_eq!(offset, 41);
    }

    #[test]
    fn keyboard_markup_keeps_rows() {
        let button = |label: &str| ChoiceButton {
            label: label.into(),
            token: format!("send_kindle:{label}"),
        };
        let choice = DeviceChoice {
            display_name: "book.fb2".into(),
            rows: vec![vec![button("Oasis"), button("Paperwhite")], vec![button("Scribe")]],
        };

        let markup = keyboard_markup(&choice);
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1]["text"], "Paperwhite");
        assert_eq!(rows[1][0]["callback_data"], "send_kindle:Scribe");
    }

    // ── Network error tests (expected to fail with a fake token) ───

    #[tokio::test]
    async fn telegram_download_with_fake_token_fails() {
        let ch = TelegramChannel::new(SecretString::from("fake-token"), vec!["*".into()]);
        let err = ch.download("F1").await.unwrap_err();
        assert!(matches!(err, ChannelError::DownloadFailed { .. }));
        assert!(!err.to_string().contains("fake-token"));
    }

    #[tokio::test]
    async fn telegram_health_check_with_fake_token_fails() {
        let ch = TelegramChannel::new(SecretString::from("fake-token"), vec![]);
        assert!(matches!(
            ch.health_check().await,
            Err(ChannelError::StartupFailed { .. })
        ));
    }
}
