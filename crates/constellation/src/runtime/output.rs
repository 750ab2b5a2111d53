//! Tagged output multiplexing for child processes

use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A single line of child output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub service: String,
    pub stream: Stream,
    pub line: String,
}

pub type OutputSender = mpsc::UnboundedSender<OutputLine>;

/// Render a line as `HH:MM:SS service | text`, padding the tag to `width`
pub fn format_line(line: &OutputLine, width: usize) -> String {
    format!(
        "{} {:<width$} | {}",
        chrono::Local::now().format("%H:%M:%S"),
        line.service,
        line.line,
        width = width
    )
}

/// Spawn the task that forwards every child line to the orchestrator's own
/// stdout/stderr. Lines of one service keep their order; lines of different
/// services interleave as they arrive.
pub fn spawn_multiplexer(width: usize) -> (OutputSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();

    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let rendered = format_line(&line, width);
            let result = match line.stream {
                Stream::Stdout => writeln!(std::io::stdout().lock(), "{}", rendered),
                Stream::Stderr => writeln!(std::io::stderr().lock(), "{}", rendered),
            };
            if let Err(e) = result {
                log::debug!("Dropping child output: {}", e);
            }
        }
    });

    (tx, handle)
}
