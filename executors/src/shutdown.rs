use std::future::Future;

use engine_core::error::EngineError;
use tokio::{sync::oneshot, task::JoinHandle};

/// Handle for a single background loop that can be shut down gracefully
pub struct WorkerHandle {
    pub name: String,
    pub join_handle: JoinHandle<Result<(), EngineError>>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    /// Spawn `run` with a fresh shutdown channel.
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(run(shutdown_rx));
        Self {
            name: name.into(),
            join_handle,
            shutdown_tx,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Shutdown this worker gracefully
    pub async fn shutdown(self) -> Result<(), EngineError> {
        tracing::info!(worker = self.name, "Initiating graceful shutdown of worker");

        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = self.name, "Worker was already shutting down");
        }

        match self.join_handle.await {
            Ok(Ok(())) => {
                tracing::info!(worker = self.name, "Worker shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(worker = self.name, error = ?e, "Worker shut down with error");
                Err(e)
            }
            Err(e) => {
                tracing::error!(worker = self.name, error = ?e, "Worker task panicked during shutdown");
                Err(EngineError::InternalError {
                    message: format!("Worker {} panic: {}", self.name, e),
                })
            }
        }
    }
}

/// Handle for coordinating shutdown of multiple workers
#[derive(Default)]
pub struct ShutdownHandle {
    workers: Vec<WorkerHandle>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker, then wait for all of them.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let worker_count = self.workers.len();
        tracing::info!("Initiating graceful shutdown of {} workers", worker_count);

        let mut join_handles = Vec::with_capacity(worker_count);
        for worker in self.workers {
            if worker.shutdown_tx.send(()).is_err() {
                tracing::warn!(worker = worker.name, "Worker was already shutting down");
            }
            join_handles.push((worker.name, worker.join_handle));
        }

        let mut first_error = None;
        let mut error_count = 0;
        for (name, handle) in join_handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::InternalError {
                    message: format!("Worker {name} panic: {e}"),
                }),
            };
            match result {
                Ok(()) => tracing::debug!(worker = name, "Worker shut down gracefully"),
                Err(e) => {
                    tracing::error!(worker = name, error = ?e, "Worker shut down with error");
                    error_count += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => {
                tracing::info!("All {} workers shut down gracefully", worker_count);
                Ok(())
            }
            Some(e) => {
                tracing::error!("{} workers had errors during shutdown", error_count);
                Err(e)
            }
        }
    }
}
