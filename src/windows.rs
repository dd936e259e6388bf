//! Windows integration - volume arrival events and the personal certificate store

use crate::error::{Result, SignError};
use crate::invocation::{Invocation, ToolLocation};
use crate::runner::{Captured, ProcessRunner};
use crate::watcher::{DeviceEvent, DeviceEventKind};
use std::time::Duration;

#[cfg(target_os = "windows")]
use crate::watcher::{EVENT_BUFFER, Subscription};

// ============================================================================
// ERROR HANDLING STRATEGY
// ============================================================================
//
// This module distinguishes between CRITICAL and DECORATIVE failures:
//
// CRITICAL - Errors propagated with `?` operator:
//   • Spawning powershell.exe for the event subscription
//   • Running the certificate query (launch errors, timeout)
//
// TOLERATED - Skipped silently:
//   • Lines from powershell.exe that do not parse as volume events
//   • Certificate subjects without a CN component
//
// When the PowerShell event feed exits, the subscription channel closes and
// the watch loop ends on its own.
// ============================================================================

/// Upper bound for the certificate store query.
pub const CERT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const CERT_QUERY_SCRIPT: &str = "Get-ChildItem Cert:\\CurrentUser\\My | \
     Where-Object { $_.HasPrivateKey } | \
     Select-Object -ExpandProperty Subject";

/// Emits one `EventType|DriveName` line per `Win32_VolumeChangeEvent`.
#[cfg(target_os = "windows")]
const VOLUME_EVENT_SCRIPT: &str = "\
$ErrorActionPreference = 'Stop'
Register-WmiEvent -Class Win32_VolumeChangeEvent -SourceIdentifier KodegenPdfVolume | Out-Null
try {
  while ($true) {
    $e = Wait-Event -SourceIdentifier KodegenPdfVolume
    $n = $e.SourceEventArgs.NewEvent
    [Console]::Out.WriteLine(('{0}|{1}' -f $n.EventType, $n.DriveName))
    [Console]::Out.Flush()
    Remove-Event -EventIdentifier $e.EventIdentifier
  }
} finally {
  Unregister-Event -SourceIdentifier KodegenPdfVolume
}";

fn powershell(script: &str) -> ToolLocation {
    ToolLocation {
        program: "powershell.exe".into(),
        leading_args: vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script.to_string(),
        ],
    }
}

/// Parse one `EventType|DriveName` line.
#[must_use]
pub fn parse_volume_event_line(line: &str) -> Option<DeviceEvent> {
    let (code, drive) = line.trim().split_once('|')?;
    let code: u32 = code.trim().parse().ok()?;
    let drive = drive.trim();
    Some(DeviceEvent {
        kind: DeviceEventKind::from_win32_event_type(code),
        volume: (!drive.is_empty()).then(|| drive.to_string()),
    })
}

/// Start a PowerShell feeder for volume change events.
#[cfg(target_os = "windows")]
pub fn subscribe_volume_events() -> Result<Subscription> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;
    use tokio::sync::mpsc;

    let tool = powershell(VOLUME_EVENT_SCRIPT);
    let mut child = Command::new(&tool.program)
        .args(&tool.leading_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SignError::Launch {
            program: tool.program.to_string_lossy().into_owned(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SignError::Io(std::io::Error::other("powershell stdout not captured")))?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let feeder = tokio::spawn(async move {
        // Owning the child here ties its lifetime to the task
        let _child = child;
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = parse_volume_event_line(&line)
                && tx.send(event).await.is_err()
            {
                break;
            }
        }
    });

    Ok(Subscription::new(rx, feeder))
}

/// The CN of an X.500 subject, or the whole subject when it has none.
#[must_use]
pub fn extract_common_name(subject: &str) -> String {
    subject
        .split(',')
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("CN")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|cn| !cn.is_empty())
        .unwrap_or_else(|| subject.trim().to_string())
}

/// Common names from the query output, in order, without duplicates.
#[must_use]
pub fn parse_cert_subjects(output: &str) -> Vec<String> {
    let mut aliases: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let cn = extract_common_name(line);
        if !aliases.contains(&cn) {
            aliases.push(cn);
        }
    }
    aliases
}

/// Aliases of personal certificates that carry a private key.
pub async fn list_cert_aliases() -> Result<Vec<String>> {
    let runner = ProcessRunner::new(Some(CERT_QUERY_TIMEOUT));
    let captured = runner
        .capture(&Invocation::from_tool(powershell(CERT_QUERY_SCRIPT)))
        .await?;
    aliases_from_query(captured)
}

fn aliases_from_query(captured: Captured) -> Result<Vec<String>> {
    if captured.exit_code != 0 {
        let stderr = captured.stderr.trim();
        return Err(SignError::CertificateQuery {
            exit_code: captured.exit_code,
            message: if stderr.is_empty() {
                "powershell.exe reported no error text".to_string()
            } else {
                stderr.to_string()
            },
        });
    }

    Ok(parse_cert_subjects(&captured.stdout))
}
