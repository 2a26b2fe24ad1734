//! Native nested-step API of the host.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use crosstest_core::{Context, StepApi, StepDefinition, TestError, Thrown, invoke};

use super::report::{NodeId, ReportTree, StepOutcome, StepReport};

/// A handle on one node of a test's report tree.
///
/// Cloning is cheap; clones refer to the same node. The in-process runtime hands these to test
/// bodies directly, and controllers use them to mirror steps reported by remote runners.
#[derive(Clone)]
pub struct HostContext {
    tree: Arc<Mutex<ReportTree>>,
    node: NodeId,
    name: String,
    origin: Arc<str>,
    runtime: Arc<str>,
}

impl HostContext {
    /// Start the tree of a new test.
    pub fn root(name: impl Into<String>, origin: impl Into<Arc<str>>, runtime: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            tree: Arc::new(Mutex::new(ReportTree::new(&name))),
            node: 0,
            name,
            origin: origin.into(),
            runtime: runtime.into(),
        }
    }

    fn tree(&self) -> MutexGuard<'_, ReportTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn at(&self, node: NodeId, name: &str) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            node,
            name: name.to_string(),
            origin: Arc::clone(&self.origin),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// The same node, reported as running on `runtime`.
    pub fn for_runtime(mut self, runtime: &str) -> Self {
        self.runtime = Arc::from(runtime);
        self
    }

    /// Open a nested step. It stays running until [`finish`](Self::finish) is called on it.
    pub fn open_step(&self, name: &str) -> HostContext {
        let node = self.tree().open(self.node, name);
        self.at(node, name)
    }

    /// Record a nested step that was skipped.
    pub fn ignore_step(&self, name: &str) {
        self.tree().ignore(self.node, name);
    }

    /// Settle this node; see the report tree for how open and failed children affect it.
    pub fn finish(&self, result: Result<(), TestError>) -> bool {
        self.tree().finish(self.node, result)
    }

    pub fn outcome(&self) -> StepOutcome {
        self.tree().outcome(self.node).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome() != StepOutcome::Running
    }

    pub fn report(&self) -> StepReport {
        self.tree().snapshot(self.node)
    }

    /// Run `step` as a nested step of this node and report whether it passed.
    pub async fn run_step(&self, step: StepDefinition) -> bool {
        if step.ignore {
            self.ignore_step(&step.name);
            return false;
        }
        let child = self.open_step(&step.name);
        if child.is_finished() {
            return false;
        }
        let result = invoke(&step.func, Arc::new(child.clone()) as Context).await;
        child.finish(result.map_err(Thrown::into_test_error))
    }
}

#[async_trait]
impl StepApi for HostContext {
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
        Ok(self.run_step(step).await)
    }
}
