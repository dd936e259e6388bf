//! USB trigger source.
//!
//! The OS-specific feeders (`windows.rs`, `linux.rs`) translate device
//! notifications into [`DeviceEvent`]s on an mpsc channel. [`watch`] consumes
//! that channel and runs one signing session per storage arrival until the
//! shutdown signal fires.

use crate::error::Result;
use crate::runner::Runner;
use crate::session::{BusyPolicy, FilePicker, Notifier, Orchestrator, Trigger};
use tokio::sync::{mpsc, watch as watch_channel};
use tokio::task::JoinHandle;

/// Channel depth between a feeder and the watch loop.
pub const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    ConfigurationChanged,
    Arrival,
    Removal,
    Docking,
    Other,
}

impl DeviceEventKind {
    /// Maps the `EventType` field of `Win32_VolumeChangeEvent`.
    #[must_use]
    pub fn from_win32_event_type(code: u32) -> Self {
        match code {
            1 => Self::ConfigurationChanged,
            2 => Self::Arrival,
            3 => Self::Removal,
            4 => Self::Docking,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    /// Drive letter (`E:`) or device node (`/dev/sdb1`) when the OS reports one.
    pub volume: Option<String>,
}

impl DeviceEvent {
    #[must_use]
    pub fn arrival(volume: Option<String>) -> Self {
        Self {
            kind: DeviceEventKind::Arrival,
            volume,
        }
    }

    #[must_use]
    pub fn is_arrival(&self) -> bool {
        self.kind == DeviceEventKind::Arrival
    }
}

/// Live stream of device events. Dropping it stops the OS feeder.
pub struct Subscription {
    events: mpsc::Receiver<DeviceEvent>,
    feeder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<DeviceEvent>, feeder: JoinHandle<()>) -> Self {
        Self {
            events,
            feeder: Some(feeder),
        }
    }

    /// A subscription fed by the caller, with no background task attached.
    pub fn from_channel(events: mpsc::Receiver<DeviceEvent>) -> Self {
        Self {
            events,
            feeder: None,
        }
    }

    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.events.recv().await
    }

    /// Discard everything already queued. Returns how many events were dropped.
    pub fn drain_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

/// Subscribe to removable-storage notifications of the host OS.
pub fn subscribe_os_events() -> Result<Subscription> {
    #[cfg(target_os = "windows")]
    {
        crate::windows::subscribe_volume_events()
    }

    #[cfg(target_os = "linux")]
    {
        crate::linux::subscribe_block_events()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Err(crate::error::SignError::UnsupportedPlatform(format!(
            "USB watching is not available on {}",
            std::env::consts::OS
        )))
    }
}

/// Requests the watch loop to stop. Dropping every handle also stops it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(watch_channel::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch_channel::Receiver<bool>);

impl ShutdownSignal {
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested or every handle is gone.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch_channel::channel(false);
    (ShutdownHandle(tx), ShutdownSignal(rx))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub events: usize,
    pub arrivals: usize,
    pub sessions: usize,
    pub succeeded: usize,
    pub dropped_while_busy: usize,
}

/// Run one session per storage arrival until `shutdown` fires or the event
/// stream ends.
///
/// Sessions run one at a time. With [`BusyPolicy::Drop`] arrivals that were
/// queued up while a session was active are discarded once it completes.
pub async fn watch<R, P, N>(
    orchestrator: &Orchestrator<R>,
    mut subscription: Subscription,
    picker: &P,
    notifier: &N,
    mut shutdown: ShutdownSignal,
) -> WatchSummary
where
    R: Runner,
    P: FilePicker,
    N: Notifier,
{
    let mut summary = WatchSummary::default();
    if shutdown.is_shutdown() {
        return summary;
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        summary.events += 1;
        if !event.is_arrival() {
            continue;
        }
        summary.arrivals += 1;

        let trigger = Trigger::UsbInsertion {
            volume: event.volume,
        };
        let report = orchestrator.run_session(trigger, picker, notifier).await;
        summary.sessions += 1;
        if report.is_success() {
            summary.succeeded += 1;
        }

        if orchestrator.busy_policy() == BusyPolicy::Drop {
            summary.dropped_while_busy += subscription.drain_pending();
        }
        if shutdown.is_shutdown() {
            break;
        }
    }

    summary
}
