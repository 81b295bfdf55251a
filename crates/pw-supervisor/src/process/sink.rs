//! Output sinks for supervised process output

use std::io::Write;
use std::sync::Mutex;

/// Receives complete lines of process output
///
/// Implementations must write each line in one piece; lines from several
/// processes and streams arrive concurrently.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, process: &str, line: &str);
}

/// Writes `[name] line` to standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&self, process: &str, line: &str) {
        if let Err(e) = write_prefixed(std::io::stdout().lock(), process, line) {
            tracing::debug!("Failed to write output of {}: {}", process, e);
        }
    }
}

fn write_prefixed(mut out: impl Write, process: &str, line: &str) -> std::io::Result<()> {
    writeln!(out, "[{}] {}", process, line)
}

/// Emits each line as a `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write_line(&self, process: &str, line: &str) {
        tracing::info!(target: "portwarden::output", process = %process, "{}", line);
    }
}

/// Collects lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far, formatted as `[name] line`
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, process: &str, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("[{}] {}", process, line));
        }
    }
}
