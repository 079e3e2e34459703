//! Non-fatal warnings and fatal errors collected while the pipeline runs.
//!
//! Diagnostics are structured records. The reporter never formats or prints
//! them for the user; presentation is left to whoever drains it.

use crate::asg::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// The graph element a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    pub node: Option<NodeId>,
    pub name: Option<String>,
    /// Pass that was running when the diagnostic was recorded.
    pub pass: Option<String>,
}

impl DiagnosticContext {
    pub fn node(id: NodeId, name: impl Into<String>) -> Self {
        Self { node: Some(id), name: Some(name.into()), pass: None }
    }

    pub fn pass(name: impl Into<String>) -> Self {
        Self { node: None, name: None, pass: Some(name.into()) }
    }

    pub fn in_pass(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub context: Option<DiagnosticContext>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {}", level, self.message)
    }
}

/// Append-only log for one pipeline run. Single-threaded.
#[derive(Debug, Default)]
pub struct DiagnosticsReporter {
    entries: Vec<Diagnostic>,
}

impl DiagnosticsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>, context: Option<DiagnosticContext>) {
        let message = message.into();
        tracing::warn!(target: "rustymo::diagnostics", "{}", message);
        self.entries.push(Diagnostic { severity: Severity::Warning, message, context });
    }

    pub fn error(&mut self, message: impl Into<String>, context: Option<DiagnosticContext>) {
        let message = message.into();
        tracing::error!(target: "rustymo::diagnostics", "{}", message);
        self.entries.push(Diagnostic { severity: Severity::Error, message, context });
    }

    /// Returns everything collected so far, in insertion order, and clears the log.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.entries)
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order_and_clears() {
        let mut reporter = DiagnosticsReporter::new();
        reporter.warn("first", None);
        reporter.error("second", Some(DiagnosticContext::node(3, "conv")));
        reporter.warn("third", None);

        let drained = reporter.drain();
        let messages: Vec<&str> = drained.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(drained[1].severity, Severity::Error);
        assert_eq!(drained[1].context.as_ref().and_then(|c| c.node), Some(3));
        assert!(reporter.is_empty());
        assert!(reporter.drain().is_empty());
    }

    #[test]
    fn test_has_errors() {
        let mut reporter = DiagnosticsReporter::new();
        reporter.warn("only a warning", None);
        assert!(!reporter.has_errors());
        assert_eq!(reporter.warnings().count(), 1);
        reporter.error("boom", None);
        assert!(reporter.has_errors());
    }

    #[test]
    fn test_display() {
        let d = Diagnostic { severity: Severity::Warning, message: "x".into(), context: None };
        assert_eq!(d.to_string(), "warning: x");
    }
}
