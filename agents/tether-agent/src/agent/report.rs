//! Batch Report
//!
//! Ordered diagnostic lines collected while applying a batch of unit
//! operations. An empty report means every operation succeeded.

use crate::agent::error::AgentError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    lines: Vec<String>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one diagnostic line
    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(line = %line, "Batch operation failed");
        self.lines.push(line);
    }

    /// Record a typed failure as a diagnostic line
    pub fn record(&mut self, error: AgentError) {
        self.push(error.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Wire form: `None` on full success, otherwise the newline-joined lines
    pub fn into_option(self) -> Option<String> {
        if self.lines.is_empty() {
            None
        } else {
            Some(self.lines.join("\n"))
        }
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lines.join("\n"))
    }
}
