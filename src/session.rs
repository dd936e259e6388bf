//! Signing sessions: trigger → intent → invocation → result.
//!
//! Each trigger (manual request or USB arrival) runs exactly one session:
//!
//! ```text
//! Idle → IntentBuilt → Invoking → Succeeded | Failed
//!   └──────────┴─→ Failed           (validation, collision, busy)
//!   └─→ Cancelled                   (no file picked)
//! ```
//!
//! At most one session is active per [`Orchestrator`]. Once the external tool
//! has been launched the session cannot be cancelled; it ends when the child
//! exits or the configured timeout kills it.

use crate::audit::{AuditLog, AuditRecord};
use crate::config::SignerConfig;
use crate::error::{Result, SignError};
use crate::intent::SigningIntent;
use crate::invocation::{self, Invocation, ToolLocation};
use crate::runner::{InvocationResult, Runner};
use crate::warn;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Lines of tool output quoted in failure messages.
const ERROR_EXCERPT_LINES: usize = 12;

/// What to do with a request that arrives while a session is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Wait for the running session, then start.
    #[default]
    Queue,
    /// Refuse immediately with [`SignError::Busy`].
    Drop,
}

/// Who asked for the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    UsbInsertion { volume: Option<String> },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::UsbInsertion { volume: Some(v) } => write!(f, "usb-insertion ({v})"),
            Self::UsbInsertion { volume: None } => f.write_str("usb-insertion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    IntentBuilt,
    Invoking,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, IntentBuilt | Failed | Cancelled)
                | (IntentBuilt, Invoking | Failed)
                | (Invoking, Succeeded | Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::IntentBuilt => "intent_built",
            Self::Invoking => "invoking",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Signed(InvocationResult),
    Failed {
        error: SignError,
        result: Option<InvocationResult>,
    },
    Cancelled,
}

/// Everything a trigger source gets back from a session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub trigger: Trigger,
    pub history: Vec<SessionState>,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    /// Redacted builder tokens, present once the invocation was built.
    pub command: Option<Vec<String>>,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.history.last().copied().unwrap_or(SessionState::Idle)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Signed(_))
    }

    #[must_use]
    pub fn error(&self) -> Option<&SignError> {
        match &self.outcome {
            SessionOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub fn result(&self) -> Option<&InvocationResult> {
        match &self.outcome {
            SessionOutcome::Signed(result) => Some(result),
            SessionOutcome::Failed { result, .. } => result.as_ref(),
            SessionOutcome::Cancelled => None,
        }
    }
}

/// File-selection surface. `Ok(None)` means the user dismissed it.
pub trait FilePicker: Send + Sync {
    fn pick(&self, trigger: &Trigger) -> impl Future<Output = Result<Option<PathBuf>>> + Send;
}

/// Receives progress and results of sessions.
pub trait Notifier: Send + Sync {
    /// Called right before the tool is launched, with the redacted command line.
    fn invoking(&self, _session_id: u64, _command_line: &str) {}

    fn finished(&self, report: &SessionReport);
}

struct Session {
    id: u64,
    trigger: Trigger,
    history: Vec<SessionState>,
    input_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    command: Option<Vec<String>>,
}

impl Session {
    fn new(id: u64, trigger: Trigger) -> Self {
        Self {
            id,
            trigger,
            history: vec![SessionState::Idle],
            input_path: None,
            output_path: None,
            command: None,
        }
    }

    fn state(&self) -> SessionState {
        self.history.last().copied().unwrap_or(SessionState::Idle)
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state().can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state(),
            next
        );
        self.history.push(next);
    }

    fn into_report(mut self, outcome: SessionOutcome) -> SessionReport {
        let terminal = match &outcome {
            SessionOutcome::Signed(_) => SessionState::Succeeded,
            SessionOutcome::Failed { .. } => SessionState::Failed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
        };
        self.advance(terminal);
        SessionReport {
            id: self.id,
            trigger: self.trigger,
            history: self.history,
            input_path: self.input_path,
            output_path: self.output_path,
            command: self.command,
            outcome,
        }
    }
}

/// Runs signing sessions against one immutable configuration.
pub struct Orchestrator<R> {
    config: Arc<SignerConfig>,
    tool: ToolLocation,
    runner: R,
    audit: Option<AuditLog>,
    gate: Mutex<()>,
    next_id: AtomicU64,
}

impl<R: Runner> Orchestrator<R> {
    pub fn new(config: Arc<SignerConfig>, tool: ToolLocation, runner: R) -> Self {
        let audit = config.audit_log.clone().map(AuditLog::new);
        Self {
            config,
            tool,
            runner,
            audit,
            gate: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    #[must_use]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    #[must_use]
    pub fn busy_policy(&self) -> BusyPolicy {
        self.config.watch.busy_policy
    }

    /// Ask `picker` for a file, then sign it.
    pub async fn run_session<P: FilePicker, N: Notifier>(
        &self,
        trigger: Trigger,
        picker: &P,
        notifier: &N,
    ) -> SessionReport {
        let session = Session::new(self.next_id(), trigger);
        let Some(_guard) = self.acquire().await else {
            return self.reject_busy(session, notifier).await;
        };

        let picked = picker.pick(&session.trigger).await;
        match picked {
            Ok(Some(path)) => self.execute(session, path, notifier).await,
            Ok(None) => self.finish(session, SessionOutcome::Cancelled, notifier).await,
            Err(error) => {
                self.finish(session, SessionOutcome::Failed { error, result: None }, notifier)
                    .await
            }
        }
    }

    /// Sign a file that was already chosen.
    pub async fn sign_file<N: Notifier>(
        &self,
        trigger: Trigger,
        input: PathBuf,
        notifier: &N,
    ) -> SessionReport {
        let session = Session::new(self.next_id(), trigger);
        let Some(_guard) = self.acquire().await else {
            return self.reject_busy(session, notifier).await;
        };
        self.execute(session, input, notifier).await
    }

    /// Build the redacted command for `input` without running anything.
    pub fn preview(&self, input: PathBuf) -> Result<Invocation> {
        let intent = self.intent_for(input);
        invocation::build(&intent, &self.tool)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match self.busy_policy() {
            BusyPolicy::Queue => Some(self.gate.lock().await),
            BusyPolicy::Drop => self.gate.try_lock().ok(),
        }
    }

    fn intent_for(&self, input: PathBuf) -> SigningIntent {
        let input = std::path::absolute(&input).unwrap_or(input);
        self.config.intent_for(input, Local::now().fixed_offset())
    }

    async fn reject_busy<N: Notifier>(&self, session: Session, notifier: &N) -> SessionReport {
        let outcome = SessionOutcome::Failed {
            error: SignError::Busy,
            result: None,
        };
        self.finish(session, outcome, notifier).await
    }

    async fn execute<N: Notifier>(
        &self,
        mut session: Session,
        input: PathBuf,
        notifier: &N,
    ) -> SessionReport {
        let intent = self.intent_for(input);
        let output_path = intent.output_path();
        session.input_path = Some(intent.input_path.clone());
        session.output_path = Some(output_path.clone());

        if let Err(error) = self.check_intent(&intent, &output_path).await {
            return self
                .finish(session, SessionOutcome::Failed { error, result: None }, notifier)
                .await;
        }
        session.advance(SessionState::IntentBuilt);

        let invocation = match invocation::build(&intent, &self.tool) {
            Ok(invocation) => invocation,
            Err(error) => {
                return self
                    .finish(session, SessionOutcome::Failed { error, result: None }, notifier)
                    .await;
            }
        };
        session.command = Some(invocation.redacted_args());

        if self.config.signing.overwrite
            && let Err(error) = remove_previous_output(&output_path).await
        {
            return self
                .finish(session, SessionOutcome::Failed { error, result: None }, notifier)
                .await;
        }

        session.advance(SessionState::Invoking);
        notifier.invoking(session.id, &invocation.redacted_command_line());

        let outcome = match self.runner.run(&invocation, &output_path).await {
            Ok(result) if result.succeeded => SessionOutcome::Signed(result),
            Ok(result) => SessionOutcome::Failed {
                error: failure_from(&result),
                result: Some(result),
            },
            Err(error) => SessionOutcome::Failed { error, result: None },
        };

        // Anything at the output path now was written by this run
        if let SessionOutcome::Failed { .. } = outcome {
            crate::cleanup_path(&output_path, "partial signed output").await;
        }

        self.finish(session, outcome, notifier).await
    }

    /// Validation and filesystem preconditions. Nothing is launched on error.
    async fn check_intent(&self, intent: &SigningIntent, output_path: &Path) -> Result<()> {
        intent.validate()?;

        let metadata = tokio::fs::metadata(&intent.input_path).await.map_err(|e| {
            SignError::config(format!(
                "Input PDF not accessible: {} ({e})",
                intent.input_path.display()
            ))
        })?;
        if !metadata.is_file() {
            return Err(SignError::config(format!(
                "Input PDF is not a file: {}",
                intent.input_path.display()
            )));
        }
        tokio::fs::File::open(&intent.input_path).await.map_err(|e| {
            SignError::config(format!(
                "Input PDF is not readable: {} ({e})",
                intent.input_path.display()
            ))
        })?;

        let output_dir = intent.resolved_output_directory();
        if !output_dir.is_dir() {
            return Err(SignError::config(format!(
                "Output directory does not exist: {}",
                output_dir.display()
            )));
        }

        if resolves_to_input(&intent.input_path, &output_dir, output_path).await {
            return Err(SignError::config(format!(
                "Output {} resolves to the input file; refusing to overwrite the original",
                output_path.display()
            )));
        }

        if output_path.exists() && !self.config.signing.overwrite {
            return Err(SignError::OutputExists(output_path.to_path_buf()));
        }

        Ok(())
    }

    async fn finish<N: Notifier>(
        &self,
        session: Session,
        outcome: SessionOutcome,
        notifier: &N,
    ) -> SessionReport {
        let report = session.into_report(outcome);

        if let Some(audit) = &self.audit {
            let record = AuditRecord::from_report(&report).await;
            if let Err(e) = audit.append(&record).await {
                warn!("Could not write audit record to {}: {}", audit.path().display(), e);
            }
        }

        notifier.finished(&report);
        report
    }
}

/// Whether `output_path` names the input file once `.`/`..` and symlinks are
/// resolved. Both the output directory and an existing output are checked,
/// the latter catching case-insensitive file systems.
async fn resolves_to_input(input: &Path, output_dir: &Path, output_path: &Path) -> bool {
    let Ok(input) = tokio::fs::canonicalize(input).await else {
        return false;
    };

    if let (Ok(dir), Some(name)) = (
        tokio::fs::canonicalize(output_dir).await,
        output_path.file_name(),
    ) && dir.join(name) == input
    {
        return true;
    }

    tokio::fs::canonicalize(output_path)
        .await
        .is_ok_and(|existing| existing == input)
}

async fn remove_previous_output(output_path: &Path) -> Result<()> {
    match tokio::fs::remove_file(output_path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SignError::Io(e)),
    }
}

fn failure_from(result: &InvocationResult) -> SignError {
    if result.exit_code == 0 {
        return SignError::SigningFailed {
            exit_code: 0,
            message: format!(
                "tool reported success but {} was not created",
                result.output_path.display()
            ),
        };
    }

    let excerpt = result.error_excerpt(ERROR_EXCERPT_LINES);
    SignError::SigningFailed {
        exit_code: result.exit_code,
        message: if excerpt.is_empty() {
            "no output captured from the signing tool".to_string()
        } else {
            excerpt
        },
    }
}
