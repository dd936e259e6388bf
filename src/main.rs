use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

use kodegen_pdf_sign::config::{KeystoreKind, SignerConfig, default_config_path};
use kodegen_pdf_sign::invocation::{self, Invocation, ToolLocation};
use kodegen_pdf_sign::prompts::{PromptPicker, TerminalNotifier};
use kodegen_pdf_sign::runner::ProcessRunner;
use kodegen_pdf_sign::session::{BusyPolicy, Orchestrator, SessionOutcome, Trigger};
use kodegen_pdf_sign::watcher::{self, shutdown_channel};
use kodegen_pdf_sign::{info, success, warn};

// ============================================================================
// ERROR HANDLING STRATEGY
// ============================================================================
//
// This module distinguishes between CRITICAL and DECORATIVE I/O operations:
//
// CRITICAL I/O - Errors propagated with `?` operator:
//   • Config loading: tokio::fs::read_to_string(), toml parsing
//   • User input: io::stdin().read_line()
//   • External processes: java/JSignPdf, powershell.exe, udevadm
//
//   These MUST succeed for the program to function correctly.
//   Errors are propagated to the caller for proper handling.
//
// DECORATIVE I/O - Errors ignored with `let _ =`:
//   • Terminal coloring: buffer.set_color(), writeln!(), bufwtr.print()
//   • Status messages: Success/warning/error indicators with colors
//
//   These are nice-to-have but non-essential. If stderr/stdout is closed,
//   TTY is detached, or output is redirected to a broken pipe, the program
//   should continue without colors - not crash.
//
// Example:
//   io::stdout().flush()?;              // Critical - propagate error
//   let _ = buffer.set_color(...);      // Decorative - ignore error
// ============================================================================

#[derive(Parser)]
#[command(name = "kodegen_pdf_sign")]
#[command(version, about = "Sign PDF files with JSignPdf, on demand or on USB insertion")]
struct Cli {
    /// Path to config file (TOML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Print the signing tool's output after each session
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign one PDF (prompts for it when omitted)
    Sign {
        /// PDF to sign
        pdf: Option<PathBuf>,

        /// Replace an existing signed output
        #[arg(long)]
        overwrite: bool,

        /// Certificate alias in the keystore
        #[arg(long)]
        alias: Option<String>,

        /// Timestamp authority URL
        #[arg(long)]
        tsa: Option<String>,

        /// Suffix appended to the output file name
        #[arg(long)]
        suffix: Option<String>,

        /// Directory for the signed output (defaults to the input's directory)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Print the command that would run, with secrets masked
        #[arg(long, requires = "pdf")]
        dry_run: bool,
    },

    /// Wait for USB storage and sign a PDF from each inserted drive
    Watch {
        /// What to do with insertions during a running session
        #[arg(long, value_enum)]
        busy_policy: Option<BusyArg>,
    },

    /// List certificate aliases available in the configured keystore
    Certs,

    /// Show current configuration
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum BusyArg {
    Queue,
    Drop,
}

impl From<BusyArg> for BusyPolicy {
    fn from(arg: BusyArg) -> Self {
        match arg {
            BusyArg::Queue => BusyPolicy::Queue,
            BusyArg::Drop => BusyPolicy::Drop,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SignerConfig::load(cli.config.as_deref()).await?;
    let notifier = TerminalNotifier {
        verbose: cli.verbose,
    };

    match cli.command {
        Command::Sign {
            pdf,
            overwrite,
            alias,
            tsa,
            suffix,
            output_dir,
            dry_run,
        } => {
            config.signing.overwrite |= overwrite;
            if alias.is_some() {
                config.signing.certificate_alias = alias;
            }
            if tsa.is_some() {
                config.signing.timestamp_url = tsa;
            }
            if let Some(suffix) = suffix {
                config.signing.output_suffix = suffix;
            }
            if output_dir.is_some() {
                config.signing.output_directory = output_dir;
            }

            if dry_run {
                return print_dry_run(config, pdf);
            }
            run_sign(config, pdf, &notifier).await
        }
        Command::Watch { busy_policy } => {
            if let Some(policy) = busy_policy {
                config.watch.busy_policy = policy.into();
            }
            run_watch(config, &notifier).await
        }
        Command::Certs => list_certs(&config).await,
        Command::Show => {
            show_config(&config, cli.config);
            Ok(())
        }
    }
}

fn orchestrator(config: SignerConfig) -> Result<Orchestrator<ProcessRunner>> {
    let tool = config.tool_location()?;
    let runner = ProcessRunner::new(config.timeout());
    Ok(Orchestrator::new(Arc::new(config), tool, runner))
}

fn print_dry_run(config: SignerConfig, pdf: Option<PathBuf>) -> Result<()> {
    let Some(pdf) = pdf else {
        anyhow::bail!("--dry-run needs a PDF path");
    };

    let tool = config.tool_location().unwrap_or_else(|e| {
        warn!("{e}");
        ToolLocation::jsignpdf("java", &config.tool.jsignpdf_jar)
    });
    let orchestrator = Orchestrator::new(Arc::new(config), tool, ProcessRunner::new(None));
    let invocation = orchestrator.preview(pdf)?;

    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();
    let _ = writeln!(&mut buffer, "{}", invocation.redacted_command_line());
    let _ = bufwtr.print(&buffer);
    Ok(())
}

async fn run_sign(
    config: SignerConfig,
    pdf: Option<PathBuf>,
    notifier: &TerminalNotifier,
) -> Result<()> {
    let orchestrator = orchestrator(config)?;

    let report = match pdf {
        Some(pdf) => orchestrator.sign_file(Trigger::Manual, pdf, notifier).await,
        None => {
            orchestrator
                .run_session(Trigger::Manual, &PromptPicker, notifier)
                .await
        }
    };

    match report.outcome {
        SessionOutcome::Failed { error, .. } => Err(error.into()),
        SessionOutcome::Signed(_) | SessionOutcome::Cancelled => Ok(()),
    }
}

async fn run_watch(config: SignerConfig, notifier: &TerminalNotifier) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let subscription = watcher::subscribe_os_events()?;
    let (shutdown, signal) = shutdown_channel();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stopping after the current session (press Ctrl+C again to abort)");
            shutdown.shutdown();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    info!(
        "Watching for USB storage ({:?} policy). Press Ctrl+C to stop.",
        orchestrator.busy_policy()
    );

    let summary = watcher::watch(&orchestrator, subscription, &PromptPicker, notifier, signal).await;

    success!(
        "Watch stopped: {} insertion(s), {} session(s), {} signed, {} dropped while busy",
        summary.arrivals,
        summary.sessions,
        summary.succeeded,
        summary.dropped_while_busy
    );
    Ok(())
}

async fn list_certs(config: &SignerConfig) -> Result<()> {
    let aliases = match config.keystore.kind {
        KeystoreKind::WindowsMy => windows_store_aliases().await?,
        KeystoreKind::Pkcs11 => {
            let tool = config.tool_location()?;
            let listing = invocation::build_key_listing(&config.keystore_source(), &tool)?;
            token_aliases(&listing, config).await?
        }
    };

    if aliases.is_empty() {
        warn!("No certificates with a private key were found");
        return Ok(());
    }

    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();
    let _ = buffer.set_color(ColorSpec::new().set_bold(true));
    let _ = writeln!(&mut buffer, "Certificates ({}):", config.keystore_source().display_name());
    let _ = buffer.reset();
    for alias in &aliases {
        let _ = writeln!(&mut buffer, "  {alias}");
    }
    let _ = bufwtr.print(&buffer);
    Ok(())
}

#[cfg(target_os = "windows")]
async fn windows_store_aliases() -> Result<Vec<String>> {
    Ok(kodegen_pdf_sign::windows::list_cert_aliases().await?)
}

#[cfg(not(target_os = "windows"))]
async fn windows_store_aliases() -> Result<Vec<String>> {
    anyhow::bail!("The Windows certificate store is only available on Windows; configure a PKCS#11 keystore instead")
}

async fn token_aliases(listing: &Invocation, config: &SignerConfig) -> Result<Vec<String>> {
    let captured = ProcessRunner::new(config.timeout()).capture(listing).await?;
    if captured.exit_code != 0 {
        anyhow::bail!(
            "Key listing failed (exit code {}): {}",
            captured.exit_code,
            captured.stderr.trim()
        );
    }
    Ok(captured
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn show_config(config: &SignerConfig, explicit: Option<PathBuf>) {
    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();
    // Header output - errors ignored (see module-level docs)
    let _ = writeln!(&mut buffer, "📋 Current Signing Configuration\n");

    let source = explicit
        .or_else(|| default_config_path().filter(|p| p.is_file()))
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(built-in defaults)".to_string());
    let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
    let _ = write!(&mut buffer, "{:<20}", "Config file");
    let _ = buffer.reset();
    let _ = writeln!(&mut buffer, "{source}");

    for (label, value) in config.describe() {
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
        let _ = write!(&mut buffer, "{label:<20}");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, "{value}");
    }
    let _ = bufwtr.print(&buffer);
}
