//! A runtime backend that runs a `RunnerShim` on a tokio task instead of a child process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use crosstest::backend::{BackendError, BackendExit, RuntimeBackend, Started};
use crosstest_core::{ParentData, Register};
use crosstest_runner::{HostLink, HttpHostLink, RunnerShim};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

pub type Suite = Arc<dyn Fn(&mut dyn Register) + Send + Sync>;

pub struct TaskBackend {
    name: String,
    suite: Suite,
    fail_prepare: bool,
}

impl TaskBackend {
    pub fn new(name: &str, suite: impl Fn(&mut dyn Register) + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            suite: Arc::new(suite),
            fail_prepare: false,
        }
    }

    /// Make artifact preparation fail, so the controller never starts.
    #[allow(dead_code)]
    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }
}

#[async_trait]
impl RuntimeBackend for TaskBackend {
    type Handle = AbortHandle;

    fn runtime(&self) -> &str {
        &self.name
    }

    async fn prepare_artifact(&self, file: &Path) -> Result<PathBuf, BackendError> {
        if self.fail_prepare {
            return Err(BackendError::Other(format!("cannot build {}", file.display())));
        }
        Ok(file.to_path_buf())
    }

    async fn start(&self, _artifact: &Path, parent: &ParentData) -> Result<Started<AbortHandle>, BackendError> {
        let mut shim = RunnerShim::new().with_parent(parent);
        let registrar: &mut dyn Register = &mut shim;
        (self.suite)(registrar);
        let link: Arc<dyn HostLink> = Arc::new(HttpHostLink::new(parent.server.clone()));
        let (exit_tx, exit_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let exit = match shim.serve(link).await {
                Ok(()) => BackendExit::Exited(Some(0)),
                Err(err) => BackendExit::Lost(err.to_string()),
            };
            let _ = exit_tx.send(exit);
        });
        Ok(Started {
            handle: task.abort_handle(),
            exited: Box::pin(async move {
                exit_rx
                    .await
                    .unwrap_or_else(|_| BackendExit::Lost("runner task aborted".to_string()))
            }),
        })
    }

    async fn stop(&self, handle: &mut AbortHandle) -> Result<(), BackendError> {
        handle.abort();
        Ok(())
    }
}
