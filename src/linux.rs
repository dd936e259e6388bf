//! Linux integration - USB block device events from udev

use crate::watcher::{DeviceEvent, DeviceEventKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(target_os = "linux")]
use crate::error::{Result, SignError};
#[cfg(target_os = "linux")]
use crate::watcher::{EVENT_BUFFER, Subscription};

// ============================================================================
// UDEV CONFIGURATION
// ============================================================================

/// udevadm binary name
const UDEVADM_BINARY: &str = "udevadm";

/// Arguments for a property-level monitor of block devices
const UDEVADM_MONITOR_ARGS: &[&str] = &[
    "monitor",
    "--udev",
    "--subsystem-match=block",
    "--property",
];

/// Installation instructions for missing udevadm
const UDEVADM_INSTALL_INSTRUCTIONS: &str = "\
udevadm not found. It ships with systemd/udev:

Ubuntu/Debian:  sudo apt-get install udev
Fedora/RHEL:    sudo dnf install systemd-udev
Arch Linux:     sudo pacman -S systemd

Alternatively sign files directly with 'kodegen_pdf_sign sign <PDF>'.";

/// Kernel mount table
const MOUNT_TABLE: &str = "/proc/self/mounts";

/// How long to wait for the desktop to mount a newly added partition
pub const MOUNT_WAIT: Duration = Duration::from_secs(15);

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Undo the octal escapes (`\040` for space) used in the mount table.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount point of `device` in a `/proc/self/mounts` style table.
///
/// Sources given as udev symlinks (`/dev/disk/by-uuid/...`) are resolved.
#[must_use]
pub fn mount_point_in(mounts: &str, device: &Path) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = PathBuf::from(unescape_mount_field(fields.next()?));
        let target = PathBuf::from(unescape_mount_field(fields.next()?));
        let matches = source == device
            || (source.starts_with("/dev/")
                && std::fs::canonicalize(&source).is_ok_and(|real| real == device));
        matches.then_some(target)
    })
}

/// Poll the mount table until `device` shows up or `wait` elapses.
pub async fn wait_for_mount(device: &Path, wait: Duration) -> Option<PathBuf> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Ok(mounts) = tokio::fs::read_to_string(MOUNT_TABLE).await
            && let Some(target) = mount_point_in(&mounts, device)
        {
            return Some(target);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
    }
}

/// Collects `KEY=VALUE` lines of one udev event block.
///
/// A block ends at a blank line. Only partitions on the USB bus produce an
/// event; whole disks and internal drives are ignored.
#[derive(Debug, Default)]
pub struct UdevBlockParser {
    properties: HashMap<String, String>,
}

impl UdevBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of `udevadm monitor --property` output.
    pub fn feed_line(&mut self, line: &str) -> Option<DeviceEvent> {
        let line = line.trim_end();
        if line.is_empty() {
            return self.finish_block();
        }

        if let Some((key, value)) = line.split_once('=')
            && !key.is_empty()
            && key.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        {
            self.properties.insert(key.to_string(), value.to_string());
        }
        None
    }

    fn finish_block(&mut self) -> Option<DeviceEvent> {
        let props = std::mem::take(&mut self.properties);
        let prop = |key: &str| props.get(key).map(String::as_str);

        if prop("SUBSYSTEM").is_some_and(|s| s != "block")
            || prop("DEVTYPE") != Some("partition")
            || prop("ID_BUS") != Some("usb")
        {
            return None;
        }

        let kind = match prop("ACTION")? {
            "add" => DeviceEventKind::Arrival,
            "remove" => DeviceEventKind::Removal,
            "change" => DeviceEventKind::ConfigurationChanged,
            _ => DeviceEventKind::Other,
        };

        Some(DeviceEvent {
            kind,
            volume: prop("DEVNAME").map(str::to_string),
        })
    }
}

/// Start a `udevadm monitor` feeder for USB partitions.
#[cfg(target_os = "linux")]
pub fn subscribe_block_events() -> Result<Subscription> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;
    use tokio::sync::mpsc;

    let udevadm = which::which(UDEVADM_BINARY)
        .map_err(|_| SignError::MissingDependency(UDEVADM_INSTALL_INSTRUCTIONS.to_string()))?;

    let mut child = Command::new(&udevadm)
        .args(UDEVADM_MONITOR_ARGS)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SignError::Launch {
            program: udevadm.to_string_lossy().into_owned(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SignError::Io(std::io::Error::other("udevadm stdout not captured")))?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let feeder = tokio::spawn(async move {
        // Owning the child here ties its lifetime to the task
        let _child = child;
        let mut parser = UdevBlockParser::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = parser.feed_line(&line)
                && tx.send(event).await.is_err()
            {
                break;
            }
        }
    });

    Ok(Subscription::new(rx, feeder))
}
