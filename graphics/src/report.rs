//! Error and diagnostic report sink.
//!
//! Every GPU-level problem is funneled through a single [`Reporter`]. It forwards
//! the message to `log`, calls the user callback if one is installed, and applies
//! the [`FatalPolicy`] to critical severities.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::GraphicsError;

/// Severity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportSeverity {
    /// Not reported anywhere.
    None,
    /// Very detailed progress output.
    Verbose,
    /// Informational output.
    Info,
    /// Something works but is slower than it should be.
    PerformanceWarning,
    /// Something unexpected that the system recovered from.
    Warning,
    /// An error that affects one operation; the process keeps running.
    NonCriticalError,
    /// An error after which GPU state cannot be trusted.
    CriticalError,
    /// The GPU device was lost.
    DeviceLost,
}

impl ReportSeverity {
    const COUNT: usize = 8;

    /// Returns true for severities that the fatal policy applies to.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::CriticalError | Self::DeviceLost)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ReportSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::PerformanceWarning => "performance warning",
            Self::Warning => "warning",
            Self::NonCriticalError => "error",
            Self::CriticalError => "critical error",
            Self::DeviceLost => "device lost",
        };
        f.write_str(name)
    }
}

/// What happens after a fatal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FatalPolicy {
    /// Terminate the process.
    #[default]
    Exit,
    /// Log and keep running. The caller is expected to stop using the affected objects.
    Continue,
}

/// User report callback.
pub type ReportCallback = Arc<dyn Fn(ReportSeverity, &str) + Send + Sync>;

/// The single report sink shared by all objects of an instance.
pub struct Reporter {
    policy: FatalPolicy,
    callback: Mutex<Option<ReportCallback>>,
    counts: [AtomicU64; ReportSeverity::COUNT],
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("policy", &self.policy)
            .field("has_callback", &self.callback.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Create a reporter with the given fatal policy.
    pub fn new(policy: FatalPolicy) -> Self {
        Self {
            policy,
            callback: Mutex::new(None),
            counts: Default::default(),
        }
    }

    /// Install or replace the user callback.
    pub fn set_callback(&self, callback: Option<ReportCallback>) {
        *self.callback.lock() = callback;
    }

    /// The fatal policy of this reporter.
    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Report a message.
    pub fn report(&self, severity: ReportSeverity, message: &str) {
        if severity == ReportSeverity::None {
            return;
        }
        self.counts[severity.index()].fetch_add(1, Ordering::Relaxed);

        match severity {
            ReportSeverity::None => {}
            ReportSeverity::Verbose => log::trace!("{message}"),
            ReportSeverity::Info => log::info!("{message}"),
            ReportSeverity::PerformanceWarning | ReportSeverity::Warning => {
                log::warn!("{message}")
            }
            ReportSeverity::NonCriticalError
            | ReportSeverity::CriticalError
            | ReportSeverity::DeviceLost => log::error!("[{severity}] {message}"),
        }

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(severity, message);
        }

        if severity.is_fatal() && self.policy == FatalPolicy::Exit {
            log::error!("Fatal report, terminating");
            std::process::exit(-1);
        }
    }

    /// Report an error with some context, choosing the severity from the error kind.
    pub fn report_error(&self, error: &GraphicsError, context: &str) {
        let severity = match error {
            GraphicsError::DeviceLost | GraphicsError::SynchronizationTimeout { .. } => {
                ReportSeverity::DeviceLost
            }
            GraphicsError::ResourceCreationFailed(_) | GraphicsError::CommandRecordingFailed(_) => {
                ReportSeverity::CriticalError
            }
            _ => ReportSeverity::NonCriticalError,
        };
        self.report(severity, &format!("{context}: {error}"));
    }

    /// Number of reports made with the given severity.
    pub fn count(&self, severity: ReportSeverity) -> u64 {
        self.counts[severity.index()].load(Ordering::Relaxed)
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(FatalPolicy::default())
    }
}

static_assertions::assert_impl_all!(Reporter: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_severity() {
        let reporter = Reporter::new(FatalPolicy::Continue);
        reporter.report(ReportSeverity::Warning, "first");
        reporter.report(ReportSeverity::Warning, "second");
        reporter.report(ReportSeverity::Info, "third");
        reporter.report(ReportSeverity::None, "ignored");

        assert_eq!(reporter.count(ReportSeverity::Warning), 2);
        assert_eq!(reporter.count(ReportSeverity::Info), 1);
        assert_eq!(reporter.count(ReportSeverity::None), 0);
    }

    #[test]
    fn test_callback_receives_reports() {
        let reporter = Reporter::new(FatalPolicy::Continue);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reporter.set_callback(Some(Arc::new(move |severity, message: &str| {
            sink.lock().push((severity, message.to_string()));
        })));

        reporter.report(ReportSeverity::NonCriticalError, "commit failed");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, ReportSeverity::NonCriticalError);
        assert_eq!(seen[0].1, "commit failed");
    }

    #[test]
    fn test_fatal_continues_under_continue_policy() {
        let reporter = Reporter::new(FatalPolicy::Continue);
        reporter.report_error(&GraphicsError::DeviceLost, "waiting for slot");
        reporter.report_error(
            &GraphicsError::ResourceCreationFailed("image".into()),
            "creating surface",
        );
        reporter.report_error(
            &GraphicsError::SubmissionFailed("queue".into()),
            "submitting",
        );

        assert_eq!(reporter.count(ReportSeverity::DeviceLost), 1);
        assert_eq!(reporter.count(ReportSeverity::CriticalError), 1);
        assert_eq!(reporter.count(ReportSeverity::NonCriticalError), 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ReportSeverity::Warning < ReportSeverity::NonCriticalError);
        assert!(ReportSeverity::CriticalError.is_fatal());
        assert!(!ReportSeverity::NonCriticalError.is_fatal());
    }
}
