//! Runner instances as child processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crosstest_core::{PARENT_DATA_ENV, ParentData};
use futures::FutureExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendExit, RuntimeBackend, Started};
use crate::artifact::{ArtifactCache, ArtifactTarget};
use crate::config::{RuntimeKind, RuntimeSpec};

/// How long a child gets to exit on its own after `stop` before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Starts `command artifact` with the parent data in its environment.
pub struct ProcessBackend {
    runtime: String,
    spec: RuntimeSpec,
    target: Option<ArtifactTarget>,
    artifacts: Arc<ArtifactCache>,
    grace: Duration,
}

pub struct ProcessHandle {
    pid: Option<u32>,
    stop: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl ProcessBackend {
    /// Backend for a `process` runtime. Returns `None` for in-process runtimes.
    pub fn from_spec(spec: &RuntimeSpec, artifacts: Arc<ArtifactCache>) -> Option<Self> {
        let RuntimeKind::Process { target, .. } = &spec.kind else {
            return None;
        };
        Some(Self {
            runtime: spec.name.clone(),
            spec: spec.clone(),
            target: target.clone(),
            artifacts,
            grace: DEFAULT_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
    type Handle = ProcessHandle;

    fn runtime(&self) -> &str {
        &self.runtime
    }

    async fn prepare_artifact(&self, file: &Path) -> Result<PathBuf, BackendError> {
        match &self.target {
            Some(target) => Ok(self.artifacts.get_or_compile(file, target).await?),
            None => Ok(file.to_path_buf()),
        }
    }

    async fn start(&self, artifact: &Path, parent: &ParentData) -> Result<Started<ProcessHandle>, BackendError> {
        let argv = self
            .spec
            .command_for(artifact)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| BackendError::EmptyCommand(self.runtime.clone()))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BackendError::EmptyCommand(self.runtime.clone()))?;

        let mut child = Command::new(program)
            .args(args)
            .env(PARENT_DATA_ENV, parent.to_json()?)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id();
        tracing::debug!(runtime = %self.runtime, ?pid, ?argv, "runner process started");

        let stop = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let grace = self.grace;
        let cancelled = stop.clone();
        let watcher = tokio::spawn(async move {
            let natural = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancelled.cancelled() => None,
            };
            let status = match natural {
                Some(status) => status,
                None => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                },
            };
            let exit = match status {
                Ok(status) => BackendExit::Exited(status.code()),
                Err(err) => BackendExit::Lost(err.to_string()),
            };
            let _ = exit_tx.send(exit);
        });

        let exited = exit_rx
            .map(|exit| exit.unwrap_or_else(|_| BackendExit::Lost("process watcher stopped".to_string())))
            .boxed();
        Ok(Started {
            handle: ProcessHandle {
                pid,
                stop,
                watcher: Some(watcher),
            },
            exited,
        })
    }

    async fn stop(&self, handle: &mut ProcessHandle) -> Result<(), BackendError> {
        handle.stop.cancel();
        if let Some(watcher) = handle.watcher.take() {
            watcher
                .await
                .map_err(|err| BackendError::Other(format!("process watcher failed: {err}")))?;
        }
        Ok(())
    }
}
