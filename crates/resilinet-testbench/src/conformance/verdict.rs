//! Verdicts and failure records

use super::events::ProtocolEvent;
use serde::Serialize;
use std::fmt;

/// Error taxonomy a failure belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    ConfigurationError,
    ResourceError,
    ObservationTimeout,
    AssertionViolation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    SetupFailed,
    ImpairmentFailed,
    ExecuteFailed,
    HandshakeTimeout,
    HandshakeOutOfOrder,
    SequenceNumberMismatch,
    FragmentCountMismatch,
    ReassemblyIncomplete,
    ObservationTimeout,
}

impl FailureKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureKind::SetupFailed | FailureKind::ImpairmentFailed | FailureKind::ExecuteFailed => {
                ErrorCategory::ResourceError
            }
            FailureKind::HandshakeTimeout | FailureKind::ObservationTimeout => {
                ErrorCategory::ObservationTimeout
            }
            FailureKind::HandshakeOutOfOrder
            | FailureKind::SequenceNumberMismatch
            | FailureKind::FragmentCountMismatch
            | FailureKind::ReassemblyIncomplete => ErrorCategory::AssertionViolation,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What was actually seen when an expectation failed
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "evidence", rename_all = "snake_case")]
pub enum Evidence {
    /// The event that broke the expectation
    Event { event: ProtocolEvent },
    /// Everything relevant that was observed
    Events { events: Vec<ProtocolEvent> },
    /// Nothing arrived in time
    Absent { waited_ms: u64, detail: String },
    /// An operation failed before anything could be observed
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Assertion or phase that failed, e.g. `tcp_handshake` or `setup`
    pub assertion: String,
    pub kind: FailureKind,
    pub expected: String,
    pub observed: Evidence,
}

impl FailureRecord {
    pub fn new(
        assertion: impl Into<String>,
        kind: FailureKind,
        expected: impl Into<String>,
        observed: Evidence,
    ) -> Self {
        Self {
            assertion: assertion.into(),
            kind,
            expected: expected.into(),
            observed,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): expected {}", self.assertion, self.kind, self.expected)
    }
}

/// Outcome of one scenario run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    /// Failures in the order they were recorded; the first is the primary one
    pub failures: Vec<FailureRecord>,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::pass()
    }
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, failure: FailureRecord) {
        self.passed = false;
        self.failures.push(failure);
    }

    /// The failure that decided the verdict
    pub fn primary_failure(&self) -> Option<&FailureRecord> {
        self.failures.first()
    }

    pub fn has_failure(&self, kind: FailureKind) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed {
            return write!(f, "PASS");
        }
        write!(f, "FAIL")?;
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_accumulates() {
        let mut verdict = Verdict::default();
        assert!(verdict.passed);
        assert!(verdict.failures.is_empty());

        verdict.record(FailureRecord::new(
            "fragmentation",
            FailureKind::ReassemblyIncomplete,
            "offsets 0, 1480, 2960",
            Evidence::Events { events: Vec::new() },
        ));
        verdict.record(FailureRecord::new(
            "syn_delivery",
            FailureKind::ObservationTimeout,
            "anything",
            Evidence::Absent {
                waited_ms: 10,
                detail: "no packets".to_string(),
            },
        ));

        assert!(!verdict.passed);
        assert_eq!(
            verdict.primary_failure().map(|f| f.kind),
            Some(FailureKind::ReassemblyIncomplete)
        );
        assert!(verdict.has_failure(FailureKind::ObservationTimeout));
        assert!(verdict.to_string().starts_with("FAIL"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(FailureKind::SetupFailed.category(), ErrorCategory::ResourceError);
        assert_eq!(
            FailureKind::HandshakeTimeout.category(),
            ErrorCategory::ObservationTimeout
        );
        assert_eq!(
            FailureKind::SequenceNumberMismatch.category(),
            ErrorCategory::AssertionViolation
        );
    }
}
