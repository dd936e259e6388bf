//! Terminal interaction: coloured output macros, the PDF file prompt and the
//! terminal notifier.
//!
//! ERROR HANDLING STRATEGY FOR DECORATIVE I/O:
//! All termcolor operations use `let _ =` to deliberately ignore errors.
//! Colored output is decorative and non-essential. If stderr/stdout is unavailable
//! (broken pipe, no TTY, etc.), the program continues gracefully without colors.
//! Reading the user's answer is CRITICAL I/O and is propagated with `?`.

use crate::config::expand_tilde_path;
use crate::error::{Result, SignError};
use crate::session::{FilePicker, Notifier, SessionOutcome, SessionReport, Trigger};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use termcolor::{BufferWriter, ColorChoice};

/// Macro for printing warnings with yellow color
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        #[allow(unused_imports)]
        use ::std::io::Write as _;
        use ::termcolor::WriteColor as _;
        let bufwtr = ::termcolor::BufferWriter::stderr(::termcolor::ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(::termcolor::ColorSpec::new().set_fg(Some(::termcolor::Color::Yellow)));
        let _ = write!(&mut buffer, "⚠️  ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, $($arg)*);
        let _ = bufwtr.print(&buffer);
    }};
}

/// Macro for printing errors with red color
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        #[allow(unused_imports)]
        use ::std::io::Write as _;
        use ::termcolor::WriteColor as _;
        let bufwtr = ::termcolor::BufferWriter::stderr(::termcolor::ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(::termcolor::ColorSpec::new().set_fg(Some(::termcolor::Color::Red)));
        let _ = write!(&mut buffer, "❌ ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, $($arg)*);
        let _ = bufwtr.print(&buffer);
    }};
}

/// Macro for printing success messages with green color
#[macro_export]
macro_rules! success {
    ($($arg:tt)*) => {{
        #[allow(unused_imports)]
        use ::std::io::Write as _;
        use ::termcolor::WriteColor as _;
        let bufwtr = ::termcolor::BufferWriter::stdout(::termcolor::ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(::termcolor::ColorSpec::new().set_fg(Some(::termcolor::Color::Green)));
        let _ = write!(&mut buffer, "✓ ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, $($arg)*);
        let _ = bufwtr.print(&buffer);
    }};
}

/// Macro for printing progress messages with blue color
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        #[allow(unused_imports)]
        use ::std::io::Write as _;
        use ::termcolor::WriteColor as _;
        let bufwtr = ::termcolor::BufferWriter::stdout(::termcolor::ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(::termcolor::ColorSpec::new().set_fg(Some(::termcolor::Color::Blue)));
        let _ = write!(&mut buffer, "→ ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, $($arg)*);
        let _ = bufwtr.print(&buffer);
    }};
}

/// Root directory of a volume as reported by the device watcher (`E:` → `E:\`).
fn volume_root(volume: &str) -> PathBuf {
    if volume.len() == 2 && volume.ends_with(':') {
        PathBuf::from(format!("{volume}\\"))
    } else {
        PathBuf::from(volume)
    }
}

/// Directory to list PDFs from. Linux reports a device node, which is only
/// browsable once the desktop has mounted it.
async fn browse_root(volume: &str) -> Option<PathBuf> {
    if volume.starts_with("/dev/") {
        crate::linux::wait_for_mount(Path::new(volume), crate::linux::MOUNT_WAIT).await
    } else {
        Some(volume_root(volume))
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// PDFs directly inside `dir`, sorted. Empty when `dir` is not a readable directory.
#[must_use]
pub fn candidate_pdfs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut pdfs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_pdf(path))
        .collect();
    pdfs.sort();
    pdfs
}

/// Prompt for the PDF to sign with a validation loop
///
/// Features:
/// - Allows graceful cancellation via "q", "quit", or Ctrl+D (EOF)
/// - Accepts the number of a listed candidate
/// - Strips surrounding quotes ("Copy as path" on Windows adds them)
/// - Expands ~ to home directory
/// - Re-prompts on missing files and non-PDF files
/// - Returns Some(path) on success, None if user cancels
pub fn prompt_for_pdf_path<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    header: &str,
    candidates: &[PathBuf],
) -> Result<Option<PathBuf>> {
    writeln!(output, "\n📄 {header}")?;
    if !candidates.is_empty() {
        writeln!(output, "PDF files found:")?;
        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(output, "  [{}] {}", i + 1, candidate.display())?;
        }
    }

    loop {
        write!(output, "PDF to sign (number or path, 'q' to cancel): ")?;
        output.flush()?;

        let mut line = String::new();
        let bytes_read = input.read_line(&mut line)?;

        // Handle EOF (Ctrl+D on Unix, Ctrl+Z on Windows)
        if bytes_read == 0 {
            writeln!(output, "\nSigning cancelled.")?;
            return Ok(None);
        }

        let answer = line.trim().trim_matches('"');

        if answer.eq_ignore_ascii_case("q") || answer.eq_ignore_ascii_case("quit") {
            writeln!(output, "Signing cancelled by user.")?;
            return Ok(None);
        }

        if answer.is_empty() {
            writeln!(output, "❌ Path cannot be empty")?;
            continue;
        }

        if let Ok(index) = answer.parse::<usize>() {
            if (1..=candidates.len()).contains(&index) {
                return Ok(Some(candidates[index - 1].clone()));
            }
            if !candidates.is_empty() {
                writeln!(output, "❌ Choose a number between 1 and {}", candidates.len())?;
                continue;
            }
        }

        let expanded = match expand_tilde_path(answer) {
            Ok(path) => PathBuf::from(path),
            Err(e) => {
                writeln!(output, "❌ {e}")?;
                continue;
            }
        };

        if !expanded.is_file() {
            writeln!(output, "❌ File not found: {}", expanded.display())?;
            continue;
        }
        if !is_pdf(&expanded) {
            writeln!(output, "❌ Not a PDF file: {}", expanded.display())?;
            continue;
        }

        return Ok(Some(std::path::absolute(&expanded).unwrap_or(expanded)));
    }
}

/// Asks on the terminal which PDF to sign.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptPicker;

impl FilePicker for PromptPicker {
    async fn pick(&self, trigger: &Trigger) -> Result<Option<PathBuf>> {
        let (header, candidates) = match trigger {
            Trigger::UsbInsertion { volume: Some(volume) } => match browse_root(volume).await {
                Some(root) => (
                    format!("USB storage inserted ({volume}, {})", root.display()),
                    candidate_pdfs(&root),
                ),
                None => (
                    format!("USB storage inserted ({volume}, not mounted yet)"),
                    Vec::new(),
                ),
            },
            Trigger::UsbInsertion { volume: None } => {
                ("USB storage inserted".to_string(), Vec::new())
            }
            Trigger::Manual => ("Select a PDF to sign".to_string(), Vec::new()),
        };

        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let stdout = io::stdout();
            prompt_for_pdf_path(&mut stdin.lock(), &mut stdout.lock(), &header, &candidates)
        })
        .await
        .map_err(|e| SignError::Io(io::Error::other(e)))?
    }
}

/// Reports sessions on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalNotifier {
    pub verbose: bool,
}

impl TerminalNotifier {
    fn print_tool_output(&self, report: &SessionReport) {
        let Some(result) = report.result() else {
            return;
        };
        let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        if !result.stdout_text.trim().is_empty() {
            let _ = writeln!(&mut buffer, "{}", result.stdout_text.trim());
        }
        if !result.stderr_text.trim().is_empty() {
            let _ = writeln!(&mut buffer, "{}", result.stderr_text.trim());
        }
        let _ = bufwtr.print(&buffer);
    }
}

impl Notifier for TerminalNotifier {
    fn invoking(&self, session_id: u64, command_line: &str) {
        crate::info!("[session {session_id}] Running:\n  {command_line}");
    }

    fn finished(&self, report: &SessionReport) {
        if self.verbose {
            self.print_tool_output(report);
        }

        match &report.outcome {
            SessionOutcome::Signed(result) => {
                crate::success!("Signed PDF created: {}", result.output_path.display());
            }
            SessionOutcome::Failed { error, .. } => {
                crate::error!("Signing failed ({}): {}", report.trigger, error);
            }
            SessionOutcome::Cancelled => {
                crate::warn!("Signing cancelled ({})", report.trigger);
            }
        }
    }
}
