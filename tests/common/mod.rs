#![allow(dead_code)]

use kodegen_pdf_sign::config::SignerConfig;
use kodegen_pdf_sign::invocation::{Invocation, ToolLocation};
use kodegen_pdf_sign::runner::{InvocationResult, Runner};
use kodegen_pdf_sign::session::{FilePicker, Notifier, Orchestrator, SessionReport, Trigger};
use kodegen_pdf_sign::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stand-in for JSignPdf: optionally writes the output and tracks overlap.
pub struct StubRunner {
    pub exit_code: i32,
    pub write_output: bool,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub seen: Mutex<Vec<Vec<String>>>,
}

impl StubRunner {
    pub fn new(exit_code: i32, write_output: bool) -> Self {
        Self {
            exit_code,
            write_output,
            delay: Duration::from_millis(0),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn signing() -> Self {
        Self::new(0, true)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Runner for StubRunner {
    async fn run(&self, invocation: &Invocation, expected_output: &Path) -> Result<InvocationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(invocation.redacted_args());

        tokio::time::sleep(self.delay).await;
        if self.write_output {
            tokio::fs::write(expected_output, b"%PDF-1.7 signed").await?;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(InvocationResult::from_exit(
            self.exit_code,
            expected_output.to_path_buf(),
            String::new(),
            if self.exit_code == 0 {
                String::new()
            } else {
                "SEVERE: Signing failed\n".to_string()
            },
        ))
    }
}

/// Always answers with the same file, or cancels when `None`.
pub struct FixedPicker(pub Option<PathBuf>);

impl FilePicker for FixedPicker {
    async fn pick(&self, _trigger: &Trigger) -> Result<Option<PathBuf>> {
        Ok(self.0.clone())
    }
}

/// Picks `<volume>/doc.pdf` for every USB trigger.
pub struct VolumePicker;

impl FilePicker for VolumePicker {
    async fn pick(&self, trigger: &Trigger) -> Result<Option<PathBuf>> {
        Ok(match trigger {
            Trigger::UsbInsertion { volume: Some(v) } => Some(PathBuf::from(v).join("doc.pdf")),
            _ => None,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub invoked: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn invoking(&self, _session_id: u64, command_line: &str) {
        self.invoked.lock().unwrap().push(command_line.to_string());
    }

    fn finished(&self, report: &SessionReport) {
        self.finished
            .lock()
            .unwrap()
            .push(report.state().as_str().to_string());
    }
}

pub fn tool() -> ToolLocation {
    ToolLocation::jsignpdf("java", Path::new("/opt/jsignpdf/JSignPdf.jar"))
}

pub fn orchestrator<R: Runner>(config: SignerConfig, runner: R) -> Orchestrator<R> {
    Orchestrator::new(Arc::new(config), tool(), runner)
}

/// Writes a small PDF-looking file and returns its path.
pub fn write_pdf(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"%PDF-1.7\n%%EOF\n").unwrap();
    path
}
