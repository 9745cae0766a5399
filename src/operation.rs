//! Async operation engine (spec.md §4.3, §5 "Concurrency model").
//!
//! spec.md calls for one worker thread per in-flight operation, coordinated
//! with a condvar rather than a shared thread pool — the teacher's own code
//! is built on tokio/sqlx throughout, so each operation thread builds its
//! own minimal current-thread tokio runtime and blocks on it, keeping the
//! teacher's async driver calls while honoring the one-thread-per-operation
//! design note.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{RpcError, INTERNAL_ERROR, QUERY_CANCELLED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

struct Inner<T> {
    state: OperationState,
    result: Option<Result<T, RpcError>>,
}

/// A single in-flight (or finished) unit of work. `T` is whatever the
/// operation produces on success — a `ResultSet`, an affected-row count, a
/// schema, and so on.
pub struct Operation<T> {
    inner: Mutex<Inner<T>>,
    condvar: Condvar,
    cancel_flag: Arc<AtomicBool>,
}

impl<T: Send + 'static> Operation<T> {
    /// Spawns a dedicated OS thread that builds a current-thread tokio
    /// runtime and blocks on `work`, which receives the shared cancellation
    /// flag so it can check it at row-batch boundaries (spec.md §5
    /// "Cancellation is cooperative").
    pub fn spawn<F, Fut>(work: F) -> Arc<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, String>> + Send,
    {
        let op = Arc::new(Self {
            inner: Mutex::new(Inner { state: OperationState::Pending, result: None }),
            condvar: Condvar::new(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        let op_for_thread = op.clone();
        let cancel_flag = op.cancel_flag.clone();
        std::thread::spawn(move || {
            {
                let mut guard = op_for_thread.inner.lock().unwrap();
                guard.state = OperationState::Running;
            }

            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    op_for_thread.finish(Err(RpcError::new(INTERNAL_ERROR, e.to_string())));
                    return;
                }
            };

            let outcome = runtime.block_on(work(cancel_flag.clone()));
            let finished = match outcome {
                Ok(value) => Ok(value),
                Err(message) => {
                    if cancel_flag.load(Ordering::SeqCst) {
                        Err(RpcError::new(QUERY_CANCELLED, "operation cancelled"))
                    } else {
                        Err(crate::error::classify_driver_error(message))
                    }
                }
            };
            op_for_thread.finish(finished);
        });

        op
    }

    fn finish(&self, result: Result<T, RpcError>) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = match &result {
            Ok(_) => OperationState::Completed,
            Err(e) if e.code == QUERY_CANCELLED => OperationState::Cancelled,
            Err(_) => OperationState::Error,
        };
        guard.result = Some(result);
        drop(guard);
        self.condvar.notify_all();
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().unwrap().state
    }

    /// Non-blocking poll: `None` if still running.
    pub fn poll(&self) -> Option<&'static str> {
        match self.state() {
            OperationState::Pending | OperationState::Running => None,
            OperationState::Completed => Some("completed"),
            OperationState::Error => Some("error"),
            OperationState::Cancelled => Some("cancelled"),
        }
    }

    /// Blocks the calling (dispatcher) thread until the operation finishes
    /// or `timeout` elapses, returning the result by value. Only ever
    /// called once per operation in practice — the dispatch loop owns each
    /// `Operation` exclusively after spawning it.
    pub fn wait(self: &Arc<Self>, timeout: Duration) -> Option<Result<T, RpcError>> {
        let mut guard = self.inner.lock().unwrap();
        while guard.result.is_none() {
            let (g, timeout_result) = self.condvar.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if timeout_result.timed_out() && guard.result.is_none() {
                return None;
            }
        }
        guard.result.take()
    }

    pub fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn completed_operation_reports_ok_result() {
        let op = Operation::<i64>::spawn(|_cancel| async move { Ok(42) });
        let result = op.wait(Duration::from_secs(5)).expect("did not time out");
        assert_eq!(result.unwrap(), 42);
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[test]
    fn failed_operation_classifies_the_driver_error() {
        let op = Operation::<i64>::spawn(|_cancel| async move { Err("no such table: ghosts".to_string()) });
        let result = op.wait(Duration::from_secs(5)).expect("did not time out");
        let err = result.unwrap_err();
        assert_eq!(err.code, crate::error::NO_SUCH_TABLE);
        assert_eq!(op.state(), OperationState::Error);
    }

    #[test]
    fn cancelled_operation_reports_query_cancelled() {
        let op = Operation::<i64>::spawn(|cancel| async move {
            cancel.store(true, Ordering::SeqCst);
            Err("driver aborted".to_string())
        });
        let result = op.wait(Duration::from_secs(5)).expect("did not time out");
        let err = result.unwrap_err();
        assert_eq!(err.code, QUERY_CANCELLED);
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn wait_times_out_while_still_running() {
        let op = Operation::<i64>::spawn(|_cancel| async move {
            std::thread::sleep(Duration::from_millis(200));
            Ok(1)
        });
        assert!(op.wait(Duration::from_millis(10)).is_none());
        assert!(op.wait(Duration::from_secs(5)).is_some());
    }
}
