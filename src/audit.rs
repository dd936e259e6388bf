//! Append-only JSON-lines audit trail of signing sessions.
//!
//! Records carry the redacted argument vector only; PINs and passwords never
//! reach this file.

use crate::error::Result;
use crate::session::{SessionOutcome, SessionReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub session_id: u64,
    pub trigger: String,
    pub states: Vec<&'static str>,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
}

impl AuditRecord {
    /// Summarise a finished session. Hashes the signed output when there is one.
    pub async fn from_report(report: &SessionReport) -> Self {
        let output_sha256 = match &report.outcome {
            SessionOutcome::Signed(result) => sha256_file(&result.output_path).await.ok(),
            _ => None,
        };

        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            session_id: report.id,
            trigger: report.trigger.to_string(),
            states: report.history.iter().map(|s| s.as_str()).collect(),
            outcome: report.state().as_str(),
            input: report.input_path.clone(),
            output: report.output_path.clone(),
            command: report.command.clone(),
            exit_code: report.result().map(|r| r.exit_code),
            error_kind: report.error().map(|e| e.kind()),
            error: report.error().map(ToString::to_string),
            output_sha256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line, creating the file if needed.
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Hex-encoded SHA-256 of a file, streamed in 8KB chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
