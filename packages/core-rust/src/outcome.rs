use std::time::Duration;

use crate::panic::PanicReport;

/// The single result of executing a handler under supervision.
///
/// Exactly one outcome is produced per request, and it is the only input
/// to the response decision. `Completed` and `Panicked` mean the handler's
/// unit ran to its own conclusion; `TimedOut` means the deadline won.
#[derive(Debug)]
pub enum ExecutionOutcome<R> {
    Completed(R),
    Panicked(PanicReport),
    TimedOut { after: Duration },
}

impl<R> ExecutionOutcome<R> {
    /// Short label used as a log field and metric tag.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Panicked(_) => "panicked",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

impl<R> From<Result<R, PanicReport>> for ExecutionOutcome<R> {
    fn from(result: Result<R, PanicReport>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(report) => Self::Panicked(report),
        }
    }
}
