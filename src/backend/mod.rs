//! Execution backends: how a runner instance is started for one runtime family.

pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crosstest_core::ParentData;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::artifact::ArtifactError;

pub use process::{ProcessBackend, ProcessHandle};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("runtime `{0}` has no command")]
    EmptyCommand(String),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode parent data: {0}")]
    ParentData(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// How a runner instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendExit {
    /// The process exited; `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// The instance ended without an exit status (a task that panicked, a lost watcher).
    Lost(String),
}

impl fmt::Display for BackendExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendExit::Exited(Some(code)) => write!(f, "exit code {code}"),
            BackendExit::Exited(None) => f.write_str("terminated by signal"),
            BackendExit::Lost(reason) => f.write_str(reason),
        }
    }
}

/// A started runner instance.
pub struct Started<H> {
    pub handle: H,
    /// Resolves when the instance ends, for whatever reason.
    pub exited: BoxFuture<'static, BackendExit>,
}

/// One runtime family's way of preparing and running artifacts.
#[async_trait]
pub trait RuntimeBackend: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Runtime name as configured (`node`, `bun`, ...).
    fn runtime(&self) -> &str;

    /// Produce (or fetch from cache) the artifact for `file`.
    async fn prepare_artifact(&self, file: &Path) -> Result<PathBuf, BackendError>;

    /// Start an instance running `artifact`. It must reach the transport described by `parent`.
    async fn start(&self, artifact: &Path, parent: &ParentData) -> Result<Started<Self::Handle>, BackendError>;

    /// Terminate the instance. Calling this on an instance that already ended is not an error.
    async fn stop(&self, handle: &mut Self::Handle) -> Result<(), BackendError>;
}
