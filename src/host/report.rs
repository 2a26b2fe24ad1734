//! The host's report tree and its immutable snapshots.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crosstest_core::TestError;

/// Name of errors raised by the step tree itself (as opposed to test bodies).
pub const STEP_ERROR_NAME: &str = "StepError";

pub(crate) type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Running,
    Passed,
    Ignored,
    Failed(TestError),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            StepOutcome::Running => "running",
            StepOutcome::Passed => "ok",
            StepOutcome::Ignored => "ignored",
            StepOutcome::Failed(_) => "FAILED",
        }
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    children: Vec<NodeId>,
    outcome: StepOutcome,
    started: Instant,
    elapsed: Duration,
}

/// Arena of one test's step nodes. Node 0 is the test itself.
#[derive(Debug)]
pub(crate) struct ReportTree {
    nodes: Vec<Node>,
}

impl ReportTree {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            nodes: vec![Node {
                name: name.to_string(),
                children: Vec::new(),
                outcome: StepOutcome::Running,
                started: Instant::now(),
                elapsed: Duration::ZERO,
            }],
        }
    }

    pub(crate) fn outcome(&self, id: NodeId) -> &StepOutcome {
        &self.nodes[id].outcome
    }

    fn push(&mut self, parent: NodeId, name: &str, outcome: StepOutcome) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            children: Vec::new(),
            outcome,
            started: Instant::now(),
            elapsed: Duration::ZERO,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Open a child step. The step starts failed when its parent is already finished or a sibling
    /// is still running.
    pub(crate) fn open(&mut self, parent: NodeId, name: &str) -> NodeId {
        let parent_node = &self.nodes[parent];
        let outcome = if parent_node.outcome != StepOutcome::Running {
            StepOutcome::Failed(TestError::new(
                STEP_ERROR_NAME,
                format!("cannot start step '{name}': '{}' has already finished", parent_node.name),
            ))
        } else if let Some(busy) = parent_node
            .children
            .iter()
            .find(|child| self.nodes[**child].outcome == StepOutcome::Running)
        {
            StepOutcome::Failed(TestError::new(
                STEP_ERROR_NAME,
                format!(
                    "cannot start step '{name}' while sibling step '{}' is still running",
                    self.nodes[*busy].name
                ),
            ))
        } else {
            StepOutcome::Running
        };
        self.push(parent, name, outcome)
    }

    pub(crate) fn ignore(&mut self, parent: NodeId, name: &str) -> NodeId {
        self.push(parent, name, StepOutcome::Ignored)
    }

    /// Settle a node. Children still running are failed first; failed children fail the node.
    /// Returns whether the node passed. Settling twice keeps the first outcome.
    pub(crate) fn finish(&mut self, id: NodeId, result: Result<(), TestError>) -> bool {
        if self.nodes[id].outcome != StepOutcome::Running {
            return self.nodes[id].outcome == StepOutcome::Passed;
        }

        let running: Vec<NodeId> = self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|child| self.nodes[*child].outcome == StepOutcome::Running)
            .collect();
        for child in &running {
            let message = format!(
                "'{}' finished before step '{}' completed",
                self.nodes[id].name, self.nodes[*child].name
            );
            self.finish(*child, Err(TestError::new(STEP_ERROR_NAME, message)));
        }

        let failed_children = self.nodes[id]
            .children
            .iter()
            .filter(|child| self.nodes[**child].outcome.is_failed())
            .count();
        let outcome = match result {
            Err(err) => StepOutcome::Failed(err),
            Ok(()) if !running.is_empty() => StepOutcome::Failed(TestError::new(
                STEP_ERROR_NAME,
                format!("{} step(s) were still running when '{}' finished", running.len(), self.nodes[id].name),
            )),
            Ok(()) if failed_children > 0 => StepOutcome::Failed(TestError::new(
                STEP_ERROR_NAME,
                format!("{failed_children} nested step(s) failed"),
            )),
            Ok(()) => StepOutcome::Passed,
        };

        let node = &mut self.nodes[id];
        node.elapsed = node.started.elapsed();
        node.outcome = outcome;
        node.outcome == StepOutcome::Passed
    }

    pub(crate) fn snapshot(&self, id: NodeId) -> StepReport {
        let node = &self.nodes[id];
        StepReport {
            name: node.name.clone(),
            outcome: node.outcome.clone(),
            duration: node.elapsed,
            steps: node.children.iter().map(|child| self.snapshot(*child)).collect(),
        }
    }
}

/// Immutable view of one node and its nested steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub outcome: StepOutcome,
    pub duration: Duration,
    pub steps: Vec<StepReport>,
}

impl StepReport {
    pub fn passed(&self) -> bool {
        self.outcome == StepOutcome::Passed
    }

    pub fn error(&self) -> Option<&TestError> {
        match &self.outcome {
            StepOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Find a nested step by its path of names below this node.
    pub fn find(&self, path: &[&str]) -> Option<&StepReport> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        self.steps.iter().find(|step| step.name == *first)?.find(rest)
    }

    /// Every failed node below and including this one, with its `a > b > c` path.
    pub fn failures(&self) -> Vec<(String, &TestError)> {
        let mut out = Vec::new();
        self.collect_failures(&self.name, &mut out);
        out
    }

    fn collect_failures<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a TestError)>) {
        if let StepOutcome::Failed(err) = &self.outcome {
            out.push((path.to_string(), err));
        }
        for step in &self.steps {
            step.collect_failures(&format!("{path} > {}", step.name), out);
        }
    }

    /// Deno-style tree: `name ... ok`, children indented by two spaces. Durations are omitted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(0, &mut out);
        out
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{:indent$}{} ... {}", "", self.name, self.outcome.label(), indent = depth * 2);
        for step in &self.steps {
            step.render_into(depth + 1, out);
        }
    }
}

/// Everything one test file produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub file: String,
    pub tests: Vec<StepReport>,
    /// Tests skipped because another test was marked `only`
    pub filtered: usize,
    pub duration: Duration,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.count(|outcome| *outcome == StepOutcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(StepOutcome::is_failed)
    }

    pub fn ignored(&self) -> usize {
        self.count(|outcome| *outcome == StepOutcome::Ignored)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn test(&self, name: &str) -> Option<&StepReport> {
        self.tests.iter().find(|test| test.name == name)
    }

    pub fn render(&self) -> String {
        self.tests.iter().map(StepReport::render).collect()
    }

    fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.tests.iter().filter(|test| pred(&test.outcome)).count()
    }
}
