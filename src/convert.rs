//! Format conversion — drives the external converter and verifies its output.
//!
//! The converter's own exit status is not trusted on its own: a conversion
//! only succeeds when the declared output file exists afterwards.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::config::{DEFAULT_CONVERTER, DEFAULT_CONVERT_TIMEOUT};
use crate::error::ConversionError;

/// Maximum converter stderr kept for the log.
const MAX_STDERR_LOG: usize = 4 * 1024;

/// The external conversion capability: `(input, output) -> exit status`.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn run(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;
}

/// Runs a converter executable as `<program> <input> <output>`.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    program: String,
    timeout: Duration,
}

impl ExternalConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_CONVERT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ExternalConverter {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERTER)
    }
}

#[async_trait]
impl Converter for ExternalConverter {
    async fn run(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        debug!(
            program = %self.program,
            input = %input.display(),
            output = %output.display(),
            "Running converter"
        );

        let mut child = Command::new(&self.program)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConversionError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let mut stderr_pipe = child.stderr.take();
        let result = tokio::time::timeout(self.timeout, async {
            let mut stderr = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stderr))
        })
        .await;

        match result {
            Ok(Ok((status, _))) if status.success() => Ok(()),
            Ok(Ok((status, stderr))) => {
                let tail_start = stderr.len().saturating_sub(MAX_STDERR_LOG);
                error!(
                    code = ?status.code(),
                    stderr = %String::from_utf8_lossy(&stderr[tail_start..]),
                    "Converter failed"
                );
                Err(ConversionError::ExitStatus {
                    code: status.code(),
                })
            }
            Ok(Err(e)) => Err(ConversionError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                let _ = child.kill().await;
                Err(ConversionError::Timeout {
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Runs a [`Converter`] and checks the declared output actually appeared.
///
/// Never deletes the input; on failure the caller discards both the input
/// and whatever partial output may exist.
#[derive(Clone)]
pub struct ConversionOrchestrator {
    converter: Arc<dyn Converter>,
}

impl ConversionOrchestrator {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }

    pub async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        if let Err(e) = self.converter.run(input, output).await {
            error!(input = %input.display(), error = %e, "Could not convert file");
            return Err(e);
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            error!(output = %output.display(), "Conversion failed: output file not created");
            return Err(ConversionError::OutputMissing {
                path: output.to_path_buf(),
            });
        }

        Ok(())
    }
}
