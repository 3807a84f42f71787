use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::WorkerError;

/// How a bounded [`Worker::join`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Completed,
    Aborted,
    NotStarted,
}

/// A detached unit of work that can be stopped independently of its owner.
///
/// Cancellation is cooperative: [`Worker::cancel`] fires the token handed to
/// the procedure, which is expected to check it at its own loop boundaries.
/// [`Worker::join`] falls back to aborting the task once its grace period
/// runs out. Dropping a worker always cancels it.
#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run<F, Fut>(&mut self, procedure: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(self.create_error("already started"));
        }
        let runtime = Handle::try_current().map_err(|_| self.create_error("no async runtime"))?;

        self.handle = Some(runtime.spawn(procedure(self.token.clone())));
        debug!(worker = %self.name, "worker started");
        Ok(())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits up to `grace` for the task to end, then aborts it.
    pub async fn join(&mut self, grace: Duration) -> Result<JoinOutcome, WorkerError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(JoinOutcome::NotStarted);
        };

        match time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => Ok(JoinOutcome::Completed),
            Ok(Err(source)) => Err(WorkerError::Cancel {
                name: self.name.clone(),
                source,
            }),
            Err(_) => {
                warn!(worker = %self.name, "worker did not stop in time, aborting");
                handle.abort();
                match handle.await {
                    Ok(()) => Ok(JoinOutcome::Completed),
                    Err(err) if err.is_cancelled() => Ok(JoinOutcome::Aborted),
                    Err(source) => Err(WorkerError::Cancel {
                        name: self.name.clone(),
                        source,
                    }),
                }
            }
        }
    }

    fn create_error(&self, reason: &'static str) -> WorkerError {
        WorkerError::Create {
            name: self.name.clone(),
            reason,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::{JoinOutcome, Worker, WorkerError};

    #[test]
    fn run_without_runtime_fails() {
        let mut worker = Worker::new("orphan");
        let err = worker.run(|_| async {}).unwrap_err();
        assert!(matches!(err, WorkerError::Create { reason: "no async runtime", .. }));
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let mut worker = Worker::new("twice");
        worker.run(|_| async {}).unwrap();
        let err = worker.run(|_| async {}).unwrap_err();
        assert!(matches!(err, WorkerError::Create { reason: "already started", .. }));
    }

    #[tokio::test]
    async fn cancel_reaches_procedure() {
        let mut worker = Worker::new("cooperative");
        let (tx, rx) = oneshot::channel();

        worker
            .run(|token| async move {
                token.cancelled().await;
                let _ = tx.send(());
            })
            .unwrap();

        worker.cancel();
        assert!(worker.is_cancelled());
        rx.await.unwrap();
        assert_eq!(
            worker.join(Duration::from_secs(1)).await.unwrap(),
            JoinOutcome::Completed
        );
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn join_aborts_stubborn_procedure() {
        let mut worker = Worker::new("stubborn");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        worker
            .run(|_token| async move {
                sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        worker.cancel();
        let outcome = worker.join(Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Aborted);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn join_reports_panicked_procedure() {
        let mut worker = Worker::new("panicky");
        worker.run(|_| async { panic!("boom") }).unwrap();

        let err = worker.join(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancel { .. }));
    }

    #[tokio::test]
    async fn drop_cancels_token() {
        let mut worker = Worker::new("dropped");
        let (tx, rx) = oneshot::channel();

        worker
            .run(|token| async move {
                token.cancelled().await;
                let _ = tx.send(());
            })
            .unwrap();

        drop(worker);
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn join_before_run_is_noop() {
        let mut worker = Worker::new("idle");
        assert_eq!(
            worker.join(Duration::from_millis(10)).await.unwrap(),
            JoinOutcome::NotStarted
        );
        assert!(worker.is_finished());
    }
}
