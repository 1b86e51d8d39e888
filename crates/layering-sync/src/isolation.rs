//! Fault isolation shared by every maintenance job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::error;

use crate::SyncError;
use crate::types::{JobKind, RunOutcome};

/// Run one job action so that neither an error nor a panic escapes.
///
/// Failures are logged with the job name and the number of consecutive
/// failures including this one; the caller keeps its schedule either way.
pub async fn isolate<F>(kind: JobKind, consecutive_failures: u32, action: F) -> RunOutcome
where
    F: Future<Output = Result<(), SyncError>> + Send,
{
    match AssertUnwindSafe(action).catch_unwind().await {
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(e)) => {
            error!(
                job = %kind,
                error = %e,
                transient = e.is_transient(),
                consecutive_failures = consecutive_failures + 1,
                "layering-cache failed while {}", kind.activity()
            );
            RunOutcome::Failed(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                job = %kind,
                panic = %message,
                consecutive_failures = consecutive_failures + 1,
                "layering-cache panicked while {}", kind.activity()
            );
            RunOutcome::Panicked(message)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
