use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use send_to_kindle::channels::TelegramChannel;
use send_to_kindle::config::BotConfig;
use send_to_kindle::convert::ExternalConverter;
use send_to_kindle::delivery::{SmtpMailer, SmtpSettings};
use send_to_kindle::devices::mask_email;
use send_to_kindle::pipeline::{IngestPipeline, PipelineDeps};
use send_to_kindle::session::{MemorySessionStore, SessionStore, spawn_sweep_task};

const LOG_FILE_PREFIX: &str = "send-to-kindle.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = BotConfig::from_env().context("Could not load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📚 Send-to-Kindle Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   SMTP: {}:{}", config.smtp_host, config.smtp_port);
    eprintln!("   From: {}", mask_email(&config.email_from));
    eprintln!("   Devices: {}", config.devices.len());
    eprintln!("   Staging: {}", config.tmp_files_path.display());

    tokio::fs::create_dir_all(&config.tmp_files_path)
        .await
        .with_context(|| {
            format!(
                "Could not create staging directory {}",
                config.tmp_files_path.display()
            )
        })?;

    // ── Sessions ─────────────────────────────────────────────────────────
    let sessions = MemorySessionStore::new();
    if let Some(ttl) = config.session_ttl {
        let _sweep_handle = spawn_sweep_task(sessions.clone(), ttl);
        tracing::info!(ttl_secs = ttl.as_secs(), "Pending-session sweep enabled");
    }
    let sessions: Arc<dyn SessionStore> = sessions;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let mailer = SmtpMailer::new(SmtpSettings::from_config(&config));
    let converter =
        ExternalConverter::new(config.converter.clone()).with_timeout(config.convert_timeout);

    let pipeline = Arc::new(IngestPipeline::new(PipelineDeps {
        sessions,
        converter: Arc::new(converter),
        transport: Arc::new(mailer),
        registry: Arc::new(config.devices),
        fallback: config.email_to,
        staging_root: config.tmp_files_path,
    }));

    // ── Telegram ─────────────────────────────────────────────────────────
    let channel = Arc::new(TelegramChannel::new(config.token, config.allowed_users));
    channel
        .health_check()
        .await
        .context("Telegram health check failed")?;
    tracing::info!("Telegram bot authorized");

    tokio::select! {
        () = channel.run(pipeline) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Could not listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

/// Console logging filtered by `RUST_LOG`, plus a daily file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
