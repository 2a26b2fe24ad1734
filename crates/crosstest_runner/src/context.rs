//! The step context handed to test bodies inside a runner.

use std::sync::Arc;

use async_trait::async_trait;
use crosstest_core::{Context, Nonce, StepApi, StepDefinition, TestError, TestId, Thrown, ToHostMessage, invoke};

use crate::link::{HostLink, LinkError};

/// Name given to errors raised when the host link itself fails mid-step.
pub const LINK_ERROR_NAME: &str = "CrossTestLinkError";

/// Forwards every `step` call to the host and runs the body locally.
///
/// Each context knows the nonce of the step it belongs to (`None` at the test root), which is the
/// `parent` of every step opened through it.
pub struct RunnerContext {
    link: Arc<dyn HostLink>,
    test_id: TestId,
    parent: Option<Nonce>,
    name: String,
    origin: Arc<str>,
    runtime: Arc<str>,
}

impl RunnerContext {
    pub fn root(
        link: Arc<dyn HostLink>,
        test_id: TestId,
        name: impl Into<String>,
        origin: Arc<str>,
        runtime: Arc<str>,
    ) -> Self {
        Self {
            link,
            test_id,
            parent: None,
            name: name.into(),
            origin,
            runtime,
        }
    }

    fn child(&self, nonce: Nonce, name: String) -> Self {
        Self {
            link: Arc::clone(&self.link),
            test_id: self.test_id,
            parent: Some(nonce),
            name,
            origin: Arc::clone(&self.origin),
            runtime: Arc::clone(&self.runtime),
        }
    }

    pub fn test_id(&self) -> TestId {
        self.test_id
    }

    pub fn parent(&self) -> Option<&Nonce> {
        self.parent.as_ref()
    }
}

fn link_failure(err: LinkError) -> Thrown {
    Thrown::Error(TestError::new(LINK_ERROR_NAME, err.to_string()))
}

#[async_trait]
impl StepApi for RunnerContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn runtime(&self) -> &str {
        &self.runtime
    }

    async fn step(&self, step: StepDefinition) -> Result<bool, Thrown> {
        let StepDefinition { name, ignore, func } = step;
        let start = ToHostMessage::StepStart {
            test_id: self.test_id,
            parent: self.parent.clone(),
            ignore,
            name: name.clone(),
        };
        let nonce = self
            .link
            .send(start)
            .await
            .map_err(link_failure)?
            .ok_or_else(|| link_failure(LinkError::MissingNonce))?;
        if ignore {
            return Ok(false);
        }

        let child: Context = Arc::new(self.child(nonce.clone(), name));
        let outcome = invoke(&func, child).await;
        let settle = match &outcome {
            Ok(()) => ToHostMessage::StepPass {
                test_id: self.test_id,
                nonce,
            },
            Err(thrown) => ToHostMessage::StepFail {
                test_id: self.test_id,
                nonce,
                error: thrown.serialize(),
            },
        };
        self.link.send(settle).await.map_err(link_failure)?;
        Ok(outcome.is_ok())
    }
}
