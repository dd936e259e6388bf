//! PDF signing through JSignPdf, triggered manually or by USB storage arrival

use std::io::Write;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

/// Attempt to remove a leftover file, logging warnings on failure.
///
/// Used for partially written outputs of failed signing runs:
/// - Succeeds silently when cleanup works or nothing is there
/// - Logs detailed warnings when cleanup fails
/// - Never panics or returns errors (cleanup is best-effort)
pub async fn cleanup_path<P: AsRef<std::path::Path>>(path: P, description: &str) {
    let path = path.as_ref();

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return;
    }

    if let Err(e) = tokio::fs::remove_file(path).await {
        // NotFound is OK - race condition where file was already removed
        if e.kind() != std::io::ErrorKind::NotFound {
            let bufwtr = BufferWriter::stderr(ColorChoice::Auto);
            let mut buffer = bufwtr.buffer();

            let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)));
            let _ = writeln!(&mut buffer, "⚠️  Warning: Failed to cleanup {description}");
            let _ = buffer.reset();
            let _ = writeln!(&mut buffer, "   Path: {}", path.display());
            let _ = writeln!(&mut buffer, "   Error: {e}");

            match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    let _ = writeln!(
                        &mut buffer,
                        "   Suggestion: The file may still be open in a PDF viewer"
                    );
                }
                _ => {
                    let _ = writeln!(&mut buffer, "   Suggestion: Manual cleanup may be needed");
                }
            }

            let _ = bufwtr.print(&buffer);
        }
    }
}

pub mod audit;
pub mod config;
pub mod error;
pub mod intent;
pub mod invocation;
pub mod prompts;
pub mod runner;
pub mod secret;
pub mod session;
pub mod watcher;

// Event parsers are platform independent; only the feeders are gated
pub mod linux;
pub mod windows;

// Re-export common types
pub use config::SignerConfig;
pub use error::{Result, SignError};
pub use intent::{CertificationLevel, KeystoreSource, PermissionFlags, SigningIntent};
pub use invocation::{Invocation, ToolLocation, build};
pub use runner::{InvocationResult, ProcessRunner, Runner};
pub use secret::Secret;
pub use session::{
    BusyPolicy, FilePicker, Notifier, Orchestrator, SessionOutcome, SessionReport, SessionState,
    Trigger,
};
pub use watcher::{DeviceEvent, DeviceEventKind, Subscription, WatchSummary, watch};
