mod common;

use common::{FixedPicker, RecordingNotifier, StubRunner, orchestrator, write_pdf};
use kodegen_pdf_sign::config::SignerConfig;
use kodegen_pdf_sign::secret::Secret;
use kodegen_pdf_sign::session::{BusyPolicy, SessionOutcome, SessionState, Trigger};
use kodegen_pdf_sign::SignError;
use std::time::Duration;

#[tokio::test]
async fn test_manual_session_signs_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "contract.pdf");
    let orch = orchestrator(SignerConfig::default(), StubRunner::signing());
    let notifier = RecordingNotifier::default();

    let report = orch
        .run_session(Trigger::Manual, &FixedPicker(Some(input.clone())), &notifier)
        .await;

    assert!(report.is_success(), "{:?}", report.outcome);
    assert_eq!(
        report.history,
        vec![
            SessionState::Idle,
            SessionState::IntentBuilt,
            SessionState::Invoking,
            SessionState::Succeeded
        ]
    );
    let output = dir.path().join("contract_signed.pdf");
    assert_eq!(report.output_path.as_deref(), Some(output.as_path()));
    assert!(output.is_file());

    let command = report.command.unwrap();
    assert_eq!(command.last().map(String::as_str), input.to_str());
    assert!(command.windows(2).any(|w| w == ["-kst", "WINDOWS-MY"]));
    assert_eq!(notifier.invoked.lock().unwrap().len(), 1);
    assert_eq!(*notifier.finished.lock().unwrap(), vec!["succeeded"]);
}

#[tokio::test]
async fn test_cancelled_pick_never_invokes() {
    let orch = orchestrator(SignerConfig::default(), StubRunner::signing());
    let notifier = RecordingNotifier::default();

    let report = orch
        .run_session(Trigger::Manual, &FixedPicker(None), &notifier)
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Cancelled));
    assert_eq!(report.history, vec![SessionState::Idle, SessionState::Cancelled]);
    assert_eq!(orch.runner().calls(), 0);
    assert!(notifier.invoked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_exit_without_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let orch = orchestrator(SignerConfig::default(), StubRunner::new(0, false));

    let report = orch
        .sign_file(Trigger::Manual, input, &RecordingNotifier::default())
        .await;

    assert_eq!(report.state(), SessionState::Failed);
    assert!(matches!(
        report.error(),
        Some(SignError::SigningFailed { exit_code: 0, .. })
    ));
    assert_eq!(report.result().map(|r| r.succeeded), Some(false));
}

#[tokio::test]
async fn test_nonzero_exit_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let orch = orchestrator(SignerConfig::default(), StubRunner::new(1, true));

    let report = orch
        .sign_file(Trigger::Manual, input, &RecordingNotifier::default())
        .await;

    let error = report.error().unwrap();
    assert!(matches!(error, SignError::SigningFailed { exit_code: 1, .. }));
    assert!(error.to_string().contains("SEVERE: Signing failed"));
    assert!(!dir.path().join("a_signed.pdf").exists());
}

#[tokio::test]
async fn test_existing_output_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let existing = write_pdf(dir.path(), "a_signed.pdf");
    let orch = orchestrator(SignerConfig::default(), StubRunner::signing());

    let report = orch
        .sign_file(Trigger::Manual, input, &RecordingNotifier::default())
        .await;

    assert!(matches!(report.error(), Some(SignError::OutputExists(p)) if *p == existing));
    assert_eq!(report.history, vec![SessionState::Idle, SessionState::Failed]);
    assert_eq!(orch.runner().calls(), 0);
    assert_eq!(std::fs::read(&existing).unwrap(), b"%PDF-1.7\n%%EOF\n");
}

#[tokio::test]
async fn test_overwrite_replaces_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let existing = write_pdf(dir.path(), "a_signed.pdf");
    let mut config = SignerConfig::default();
    config.signing.overwrite = true;
    let orch = orchestrator(config, StubRunner::signing());

    let report = orch
        .sign_file(Trigger::Manual, input, &RecordingNotifier::default())
        .await;

    assert!(report.is_success());
    assert_eq!(std::fs::read(&existing).unwrap(), b"%PDF-1.7 signed");
}

#[tokio::test]
async fn test_missing_input_fails_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(SignerConfig::default(), StubRunner::signing());

    let report = orch
        .sign_file(
            Trigger::Manual,
            dir.path().join("ghost.pdf"),
            &RecordingNotifier::default(),
        )
        .await;

    assert!(matches!(report.error(), Some(SignError::Configuration(_))));
    assert_eq!(report.command, None);
    assert_eq!(orch.runner().calls(), 0);
}

#[tokio::test]
async fn test_secrets_are_redacted_in_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let mut config = SignerConfig::default();
    config.signing.owner_password = Some(Secret::new("owner-pass-123"));
    let orch = orchestrator(config, StubRunner::signing());
    let notifier = RecordingNotifier::default();

    let report = orch.sign_file(Trigger::Manual, input, &notifier).await;

    assert!(report.is_success());
    let line = notifier.invoked.lock().unwrap()[0].clone();
    assert!(line.contains("-opwd"));
    assert!(!line.contains("owner-pass-123"));
    assert!(report.command.unwrap().iter().all(|t| t != "owner-pass-123"));
}

#[tokio::test]
async fn test_drop_policy_rejects_concurrent_session() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_pdf(dir.path(), "first.pdf");
    let second = write_pdf(dir.path(), "second.pdf");
    let mut config = SignerConfig::default();
    config.watch.busy_policy = BusyPolicy::Drop;
    let orch = orchestrator(
        config,
        StubRunner::signing().with_delay(Duration::from_millis(50)),
    );
    let notifier = RecordingNotifier::default();

    let (a, b) = tokio::join!(
        orch.sign_file(Trigger::Manual, first, &notifier),
        orch.sign_file(Trigger::Manual, second, &notifier),
    );

    assert!(a.is_success());
    assert!(matches!(b.error(), Some(SignError::Busy)));
    assert_eq!(orch.runner().calls(), 1);
}

#[tokio::test]
async fn test_queue_policy_serializes_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_pdf(dir.path(), "first.pdf");
    let second = write_pdf(dir.path(), "second.pdf");
    let orch = orchestrator(
        SignerConfig::default(),
        StubRunner::signing().with_delay(Duration::from_millis(20)),
    );
    let notifier = RecordingNotifier::default();

    let (a, b) = tokio::join!(
        orch.sign_file(Trigger::Manual, first, &notifier),
        orch.sign_file(Trigger::Manual, second, &notifier),
    );

    assert!(a.is_success() && b.is_success());
    assert_eq!(orch.runner().calls(), 2);
    assert_eq!(orch.runner().max_active(), 1);
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn test_audit_log_records_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "a.pdf");
    let audit = dir.path().join("logs/audit.jsonl");
    let mut config = SignerConfig::default();
    config.audit_log = Some(audit.clone());
    let orch = orchestrator(config, StubRunner::signing());
    let notifier = RecordingNotifier::default();

    orch.sign_file(Trigger::Manual, input.clone(), &notifier).await;
    orch.sign_file(Trigger::Manual, input, &notifier).await;

    let content = std::fs::read_to_string(&audit).unwrap();
    let records: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["outcome"], "succeeded");
    assert_eq!(records[0]["output_sha256"].as_str().map(str::len), Some(64));
    assert_eq!(records[1]["outcome"], "failed");
    assert_eq!(records[1]["error_kind"], "configuration");
}

fn overwrite_in_place(output_directory: std::path::PathBuf) -> SignerConfig {
    let mut config = SignerConfig::default();
    config.signing.output_suffix = String::new();
    config.signing.output_directory = Some(output_directory);
    config.signing.overwrite = true;
    config
}

async fn assert_input_untouched(config: SignerConfig, input: std::path::PathBuf) {
    let orch = orchestrator(config, StubRunner::new(1, false));

    let report = orch
        .sign_file(Trigger::Manual, input.clone(), &RecordingNotifier::default())
        .await;

    assert!(
        matches!(report.error(), Some(SignError::Configuration(msg)) if msg.contains("input file")),
        "{:?}",
        report.outcome
    );
    assert_eq!(report.history, vec![SessionState::Idle, SessionState::Failed]);
    assert_eq!(orch.runner().calls(), 0);
    assert_eq!(std::fs::read(&input).unwrap(), b"%PDF-1.7\n%%EOF\n");
}

#[tokio::test]
async fn test_output_dir_spelled_differently_never_replaces_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "report.pdf");
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let config = overwrite_in_place(dir.path().join("sub").join(".."));
    assert_input_untouched(config, input).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_output_dir_never_replaces_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_pdf(dir.path(), "report.pdf");
    let link = dir.path().join("same-folder");
    std::os::unix::fs::symlink(dir.path(), &link).unwrap();

    assert_input_untouched(overwrite_in_place(link), input).await;
}
