//! User-facing progress reporting.
//!
//! Three message classes are reported: `info` before a step starts,
//! `success` after it completes and `warn` for degraded behavior.

use std::sync::Mutex;

/// Sink for step progress messages.
pub trait Output: Send + Sync {
    /// A step is about to start.
    fn info(&self, msg: &str);
    /// The last step completed.
    fn success(&self, msg: &str);
    /// Something the user should know about.
    fn warn(&self, msg: &str);
}

/// Prints step messages to stdout and mirrors them to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOutput;

impl Output for ConsoleOutput {
    fn info(&self, msg: &str) {
        tracing::info!("{}", msg);
        println!("{}", msg);
    }

    fn success(&self, msg: &str) {
        tracing::info!(outcome = "success", "{}", msg);
        println!("  {}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{}", msg);
        println!("  WARNING: {}", msg);
    }
}

/// Message class, as recorded by [`MemoryOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
}

/// Keeps every message in memory. Used by tests and by callers that
/// render progress themselves.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    messages: Mutex<Vec<(Level, String)>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded messages, oldest first.
    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded messages of one class.
    pub fn of(&self, level: Level) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    fn push(&self, level: Level, msg: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, msg.to_string()));
    }
}

impl Output for MemoryOutput {
    fn info(&self, msg: &str) {
        self.push(Level::Info, msg);
    }

    fn success(&self, msg: &str) {
        self.push(Level::Success, msg);
    }

    fn warn(&self, msg: &str) {
        self.push(Level::Warn, msg);
    }
}
