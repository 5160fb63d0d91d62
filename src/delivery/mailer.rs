//! SMTP mail transport via lettre.
//!
//! STARTTLS is required (implicit TLS on port 465) and the sender address
//! doubles as the SMTP username.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::delivery::dispatcher::{MailTransport, OutgoingMail};
use crate::error::MailError;

/// Display name on the `From:` header.
const SENDER_NAME: &str = "Send-to-Kindle Bot";

/// Port that speaks TLS from the first byte instead of upgrading via STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// SMTP connection settings.
#[derive(Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub password: SecretString,
    pub insecure_skip_verify: bool,
}

impl SmtpSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            from: config.email_from.clone(),
            password: SecretString::from(config.password.expose_secret().to_owned()),
            insecure_skip_verify: config.smtp_insecure,
        }
    }
}

/// Sends attachment mails through an SMTP relay.
#[derive(Debug)]
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        if settings.insecure_skip_verify {
            warn!("SMTP insecure mode is enabled - TLS certificate verification is disabled!");
        }
        Self { settings }
    }

    fn transport(&self) -> Result<SmtpTransport, MailError> {
        let host = &self.settings.host;
        let params = TlsParameters::builder(host.clone())
            .dangerous_accept_invalid_certs(self.settings.insecure_skip_verify)
            .build()
            .map_err(|e| MailError::Transport(format!("TLS setup failed: {e}")))?;

        let tls = if self.settings.port == IMPLICIT_TLS_PORT {
            Tls::Wrapper(params)
        } else {
            Tls::Required(params)
        };

        let creds = Credentials::new(
            self.settings.from.clone(),
            self.settings.password.expose_secret().to_owned(),
        );

        Ok(SmtpTransport::builder_dangerous(host)
            .port(self.settings.port)
            .tls(tls)
            .credentials(creds)
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }

    /// Build the MIME message: empty text body plus the file as attachment.
    pub fn build_message(&self, mail: &OutgoingMail, body: Vec<u8>) -> Result<Message, MailError> {
        let from_address: Address = self.settings.from.parse().map_err(|e| {
            MailError::InvalidAddress {
                field: "from",
                reason: format!("{e}"),
            }
        })?;
        let to: Mailbox = mail.to.parse().map_err(|e| MailError::InvalidAddress {
            field: "to",
            reason: format!("{e}"),
        })?;

        let file_name = mail
            .attachment
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("book")
            .to_string();
        let content_type = ContentType::parse(content_type_for(&mail.attachment))
            .map_err(|e| MailError::Build(format!("Invalid content type: {e}")))?;

        Message::builder()
            .from(Mailbox::new(Some(SENDER_NAME.to_string()), from_address))
            .to(to)
            .subject(mail.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(String::new()))
                    .singlepart(Attachment::new(file_name).body(body, content_type)),
            )
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let body = tokio::fs::read(&mail.attachment)
            .await
            .map_err(|e| MailError::Attachment {
                path: mail.attachment.clone(),
                reason: e.to_string(),
            })?;

        let message = self.build_message(mail, body)?;
        let transport = self.transport()?;
        let addr = format!("{}:{}", self.settings.host, self.settings.port);

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::Transport(format!("SMTP task panicked: {e}")))?
            .map_err(|e| MailError::Transport(format!("{addr}: {e}")))?;

        debug!("Email sent successfully");
        Ok(())
    }
}

/// MIME type for an attachment, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "epub" => "application/epub+zip",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "rtf" => "application/rtf",
        "htm" | "html" => "text/html",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
