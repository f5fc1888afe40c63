//! Batch embedding progress reporting.
//!
//! `embed_batch` reports once per completed group so `dgx embed pending`
//! can show how far a backfill has got. Progress is emitted on **stderr**
//! so stdout remains parseable for scripts.

use std::io::Write;

/// One completed group of a batch embedding run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupProgress {
    /// 1-based group number.
    pub group: usize,
    pub groups: usize,
    /// Texts embedded successfully in this group.
    pub succeeded: usize,
    /// Texts that exhausted their attempts in this group.
    pub failed: usize,
    /// Texts processed so far across all groups.
    pub done: usize,
    pub total: usize,
}

/// Receives batch embedding progress. Implementations write to stderr.
pub trait EmbedProgressReporter: Send + Sync {
    fn report(&self, event: &GroupProgress);
}

/// Human-friendly progress on stderr: "embed  group 2/5  200 / 450 texts  (1 failed)".
pub struct StderrProgress;

impl EmbedProgressReporter for StderrProgress {
    fn report(&self, event: &GroupProgress) {
        let mut line = format!(
            "embed  group {}/{}  {} / {} texts",
            event.group,
            event.groups,
            format_number(event.done as u64),
            format_number(event.total as u64)
        );
        if event.failed > 0 {
            line.push_str(&format!("  ({} failed)", event.failed));
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl EmbedProgressReporter for JsonProgress {
    fn report(&self, event: &GroupProgress) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": "embedding",
            "group": event.group,
            "groups": event.groups,
            "succeeded": event.succeeded,
            "failed": event.failed,
            "n": event.done,
            "total": event.total
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl EmbedProgressReporter for NoProgress {
    fn report(&self, _event: &GroupProgress) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn EmbedProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
