//! The registration table and serving loop linked into every runner artifact.

use std::sync::Arc;

use crosstest_core::{
    Context, NormalizedTest, ParentData, Register, TestArgs, TestError, TestId, Thrown, ToHostMessage,
    ToRunnerMessage, invoke, normalize,
};
use futures::StreamExt;
use thiserror::Error;

use crate::context::RunnerContext;
use crate::link::{HostLink, LinkError};

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("Unexpected EOF: the host closed the command stream without sending exit")]
    UnexpectedEof,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("environment variable {0} is not set; was this runner started by a crosstest host?")]
    MissingParentData(&'static str),

    #[error("invalid parent data: {0}")]
    ParentData(#[source] serde_json::Error),
}

/// Ordered table of the tests a file registered, replayed on the host's command.
///
/// Registration only records; nothing runs until the host sends `run`. Ids are positions in the
/// table, which matches the host's own registration order for the same file.
pub struct RunnerShim {
    tests: Vec<NormalizedTest>,
    origin: Arc<str>,
    runtime: Arc<str>,
}

impl Default for RunnerShim {
    fn default() -> Self {
        Self {
            tests: Vec::new(),
            origin: Arc::from("<unknown>"),
            runtime: Arc::from("runner"),
        }
    }
}

impl RunnerShim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the origin file and runtime name the host passed down.
    pub fn with_parent(mut self, parent: &ParentData) -> Self {
        self.origin = Arc::from(parent.file.as_str());
        self.runtime = Arc::from(parent.runtime.as_str());
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn get(&self, id: TestId) -> Option<&NormalizedTest> {
        usize::try_from(id.0).ok().and_then(|index| self.tests.get(index))
    }

    /// Announce readiness, then execute host commands until `exit`.
    pub async fn serve(&self, link: Arc<dyn HostLink>) -> Result<(), ShimError> {
        link.send(ToHostMessage::Ready).await?;
        let mut commands = link.commands().await?;
        tracing::debug!(tests = self.tests.len(), runtime = %self.runtime, "runner ready");

        while let Some(command) = commands.next().await {
            match command? {
                ToRunnerMessage::Run { test_id } => self.run(&link, test_id).await?,
                ToRunnerMessage::Exit => {
                    tracing::debug!("exit received");
                    return Ok(());
                }
            }
        }
        Err(ShimError::UnexpectedEof)
    }

    /// Run one test to completion and report its terminal result.
    ///
    /// Only link failures are returned as errors; a failing test is reported to the host.
    pub async fn run(&self, link: &Arc<dyn HostLink>, test_id: TestId) -> Result<(), ShimError> {
        let outcome = match self.get(test_id) {
            None => Err(Thrown::Error(TestError::new(
                crosstest_core::errors::GENERIC_ERROR_NAME,
                format!("Invalid testId: {test_id}"),
            ))),
            Some(test) => {
                let context: Context = Arc::new(RunnerContext::root(
                    Arc::clone(link),
                    test_id,
                    test.display_name(test_id),
                    Arc::clone(&self.origin),
                    Arc::clone(&self.runtime),
                ));
                invoke(&test.func, context).await
            }
        };

        let message = match outcome {
            Ok(()) => ToHostMessage::Pass { test_id },
            Err(thrown) => {
                tracing::debug!(%test_id, error = %thrown, "test failed");
                ToHostMessage::Fail {
                    test_id,
                    error: thrown.serialize(),
                }
            }
        };
        link.send(message).await?;
        Ok(())
    }
}

impl Register for RunnerShim {
    fn register(&mut self, args: TestArgs) -> TestId {
        let id = TestId(self.tests.len() as u64);
        self.tests.push(normalize(args));
        id
    }
}
