//! The protocol state of one controller, free of IO.
//!
//! A [`Session`] tracks the test runs and open steps of one runner instance and applies inbound
//! messages to the host's report tree. It is owned by the controller's actor task, so nothing in
//! here is locked; every call happens in message order.

use std::collections::{HashMap, HashSet};

use crosstest_core::{Nonce, TestError, TestId, ToHostMessage, deserialize_error};
use tokio::sync::oneshot;

use super::ControllerState;
use super::error::{ControllerError, ProtocolError, RunError};
use crate::host::HostContext;
use crate::host::report::STEP_ERROR_NAME;

pub(crate) type RunReply = oneshot::Sender<Result<(), RunError>>;

struct TestRun {
    context: HostContext,
    done: RunReply,
}

struct PendingStep {
    test_id: TestId,
    parent: Option<Nonce>,
    /// Opening order; larger means deeper or later.
    seq: u64,
    context: HostContext,
}

pub(crate) struct Session {
    runtime: String,
    runs: HashMap<TestId, TestRun>,
    used: HashSet<TestId>,
    settled: HashSet<TestId>,
    steps: HashMap<Nonce, PendingStep>,
    next_nonce: u64,
    ready: bool,
    failure: Option<ControllerError>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            runs: HashMap::new(),
            used: HashSet::new(),
            settled: HashSet::new(),
            steps: HashMap::new(),
            next_nonce: 0,
            ready: false,
            failure: None,
            closed: false,
        }
    }

    pub(crate) fn state(&self) -> ControllerState {
        if let Some(err) = &self.failure {
            ControllerState::Panicked(err.clone())
        } else if self.closed {
            ControllerState::Closed
        } else if !self.ready {
            ControllerState::Starting
        } else if self.runs.is_empty() {
            ControllerState::Ready
        } else {
            ControllerState::Running
        }
    }

    pub(crate) fn is_serving(&self) -> bool {
        self.failure.is_none() && !self.closed
    }

    pub(crate) fn failure(&self) -> Option<&ControllerError> {
        self.failure.as_ref()
    }

    /// Track a new run. Returns `true` when the `run` command should be sent; otherwise `done`
    /// has already been rejected.
    pub(crate) fn register_run(&mut self, test_id: TestId, context: HostContext, done: RunReply) -> bool {
        let rejection = if let Some(err) = &self.failure {
            Some(err.clone())
        } else if self.closed {
            Some(ControllerError::Closed)
        } else if !self.used.insert(test_id) {
            Some(ControllerError::Protocol(ProtocolError::DuplicateTestId(test_id)))
        } else {
            None
        };
        if let Some(err) = rejection {
            let _ = done.send(Err(RunError::Controller(err)));
            return false;
        }
        self.runs.insert(test_id, TestRun { context, done });
        true
    }

    fn mint_nonce(&mut self) -> (Nonce, u64) {
        let seq = self.next_nonce;
        self.next_nonce += 1;
        (Nonce::new(format!("{}-{seq}", self.runtime)), seq)
    }

    fn check_open(&self, test_id: TestId) -> Result<(), ProtocolError> {
        if self.settled.contains(&test_id) {
            return Err(ProtocolError::SettledTest(test_id));
        }
        if !self.runs.contains_key(&test_id) {
            return Err(ProtocolError::InvalidId(test_id));
        }
        Ok(())
    }

    /// Apply one inbound message. Returns the nonce to answer a `stepStart` with.
    pub(crate) fn handle(&mut self, message: ToHostMessage) -> Result<Option<Nonce>, ProtocolError> {
        match message {
            ToHostMessage::Ready => {
                self.ready = true;
                Ok(None)
            }
            ToHostMessage::Pass { test_id } => {
                self.settle(test_id, Ok(()))?;
                Ok(None)
            }
            ToHostMessage::Fail { test_id, error } => {
                self.settle(test_id, Err(RunError::Failed(deserialize_error(error))))?;
                Ok(None)
            }
            ToHostMessage::StepStart {
                test_id,
                parent,
                ignore,
                name,
            } => self.start_step(test_id, parent, ignore, &name).map(Some),
            ToHostMessage::StepPass { test_id, nonce } => {
                self.finish_step(test_id, nonce, Ok(()))?;
                Ok(None)
            }
            ToHostMessage::StepFail { test_id, nonce, error } => {
                self.finish_step(test_id, nonce, Err(deserialize_error(error)))?;
                Ok(None)
            }
        }
    }

    fn settle(&mut self, test_id: TestId, result: Result<(), RunError>) -> Result<(), ProtocolError> {
        self.check_open(test_id)?;
        let Some(run) = self.runs.remove(&test_id) else {
            return Err(ProtocolError::InvalidId(test_id));
        };
        self.settled.insert(test_id);

        let dangling: Vec<Nonce> = self.steps_by_depth(|step| step.test_id == test_id);
        for nonce in dangling {
            if let Some(step) = self.steps.remove(&nonce) {
                step.context.finish(Err(TestError::new(
                    STEP_ERROR_NAME,
                    "test finished before this step reported completion",
                )));
            }
        }

        tracing::debug!(runtime = %self.runtime, %test_id, passed = result.is_ok(), "test settled");
        let _ = run.done.send(result);
        Ok(())
    }

    fn start_step(
        &mut self,
        test_id: TestId,
        parent: Option<Nonce>,
        ignore: bool,
        name: &str,
    ) -> Result<Nonce, ProtocolError> {
        self.check_open(test_id)?;
        let parent_context = match &parent {
            None => self.runs.get(&test_id).map(|run| run.context.clone()),
            Some(nonce) => {
                let step = self
                    .steps
                    .get(nonce)
                    .ok_or_else(|| ProtocolError::InvalidParent(nonce.clone()))?;
                if step.test_id != test_id {
                    return Err(ProtocolError::ForeignNonce {
                        nonce: nonce.clone(),
                        owner: step.test_id,
                        test_id,
                    });
                }
                Some(step.context.clone())
            }
        }
        .ok_or(ProtocolError::InvalidId(test_id))?;

        let (nonce, seq) = self.mint_nonce();
        if ignore {
            parent_context.ignore_step(name);
            tracing::debug!(runtime = %self.runtime, %test_id, %nonce, name, "step ignored");
            return Ok(nonce);
        }

        let context = parent_context.open_step(name);
        tracing::debug!(runtime = %self.runtime, %test_id, %nonce, name, "step started");
        self.steps.insert(
            nonce.clone(),
            PendingStep {
                test_id,
                parent,
                seq,
                context,
            },
        );
        Ok(nonce)
    }

    fn finish_step(&mut self, test_id: TestId, nonce: Nonce, result: Result<(), TestError>) -> Result<(), ProtocolError> {
        self.check_open(test_id)?;
        let step = self
            .steps
            .get(&nonce)
            .ok_or_else(|| ProtocolError::InvalidNonce(nonce.clone()))?;
        if step.test_id != test_id {
            return Err(ProtocolError::ForeignNonce {
                nonce,
                owner: step.test_id,
                test_id,
            });
        }
        let open = self
            .steps
            .values()
            .filter(|other| other.parent.as_ref() == Some(&nonce))
            .count();
        if open > 0 {
            return Err(ProtocolError::OpenChildren { nonce, open });
        }

        if let Some(step) = self.steps.remove(&nonce) {
            let passed = step.context.finish(result);
            tracing::debug!(runtime = %self.runtime, %test_id, %nonce, passed, "step finished");
        }
        Ok(())
    }

    /// Nonces of the matching open steps, most recently opened first.
    fn steps_by_depth(&self, filter: impl Fn(&PendingStep) -> bool) -> Vec<Nonce> {
        let mut open: Vec<(u64, Nonce)> = self
            .steps
            .iter()
            .filter(|(_, step)| filter(step))
            .map(|(nonce, step)| (step.seq, nonce.clone()))
            .collect();
        open.sort_by(|a, b| b.0.cmp(&a.0));
        open.into_iter().map(|(_, nonce)| nonce).collect()
    }

    /// Fail every open step (deepest first) and reject every open run with `err`.
    ///
    /// Only the first failure is kept; later calls are no-ops.
    pub(crate) fn panic(&mut self, err: ControllerError) {
        if self.failure.is_some() {
            return;
        }
        tracing::warn!(runtime = %self.runtime, error = %err, "controller panicked");
        self.failure = Some(err.clone());
        self.abort(&err);
    }

    /// Stop serving; whatever is still open is rejected as closed.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.failure.is_none() {
            self.abort(&ControllerError::Closed);
        }
    }

    fn abort(&mut self, err: &ControllerError) {
        for nonce in self.steps_by_depth(|_| true) {
            if let Some(step) = self.steps.remove(&nonce) {
                step.context.finish(Err(err.to_test_error()));
            }
        }
        for (test_id, run) in self.runs.drain() {
            self.settled.insert(test_id);
            let _ = run.done.send(Err(RunError::Controller(err.clone())));
        }
    }

    #[cfg(test)]
    fn open_steps(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosstest_core::SerializedError;

    fn session() -> Session {
        let mut session = Session::new("node");
        session.handle(ToHostMessage::Ready).unwrap();
        session
    }

    fn run(session: &mut Session, id: u64) -> (HostContext, oneshot::Receiver<Result<(), RunError>>) {
        let root = HostContext::root(format!("test {id}"), "suite.rs", "native");
        let context = root.open_step("Node").for_runtime("node");
        let (tx, rx) = oneshot::channel();
        assert!(session.register_run(TestId(id), context, tx));
        (root, rx)
    }

    fn start(session: &mut Session, id: u64, parent: Option<&Nonce>, name: &str) -> Nonce {
        session
            .handle(ToHostMessage::StepStart {
                test_id: TestId(id),
                parent: parent.cloned(),
                ignore: false,
                name: name.to_string(),
            })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_states() {
        let mut session = Session::new("node");
        assert_eq!(session.state(), ControllerState::Starting);
        session.handle(ToHostMessage::Ready).unwrap();
        session.handle(ToHostMessage::Ready).unwrap();
        assert_eq!(session.state(), ControllerState::Ready);
        let (_root, _rx) = run(&mut session, 0);
        assert_eq!(session.state(), ControllerState::Running);
        session.handle(ToHostMessage::Pass { test_id: TestId(0) }).unwrap();
        assert_eq!(session.state(), ControllerState::Ready);
        session.close();
        assert_eq!(session.state(), ControllerState::Closed);
    }

    #[test]
    fn test_pass_resolves_run() {
        let mut session = session();
        let (_root, mut rx) = run(&mut session, 7);
        session.handle(ToHostMessage::Pass { test_id: TestId(7) }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_fail_deserializes_error() {
        let mut session = session();
        let (_root, mut rx) = run(&mut session, 3);
        session
            .handle(ToHostMessage::Fail {
                test_id: TestId(3),
                error: SerializedError::Error {
                    name: "AssertionError".to_string(),
                    message: "1 != 2".to_string(),
                    stack: None,
                },
            })
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RunError::Failed(TestError::new("AssertionError", "1 != 2")))
        );
    }

    #[test]
    fn test_parent_cannot_close_before_child() {
        let mut session = session();
        let (_root, _rx) = run(&mut session, 0);
        let outer = start(&mut session, 0, None, "outer");
        let inner = start(&mut session, 0, Some(&outer), "inner");
        assert_ne!(outer, inner);

        let err = session
            .handle(ToHostMessage::StepPass {
                test_id: TestId(0),
                nonce: outer.clone(),
            })
            .unwrap_err();
        assert_eq!(err, ProtocolError::OpenChildren { nonce: outer.clone(), open: 1 });
    }

    #[test]
    fn test_steps_close_in_order() {
        let mut session = session();
        let (root, mut rx) = run(&mut session, 0);
        let outer = start(&mut session, 0, None, "outer");
        let inner = start(&mut session, 0, Some(&outer), "inner");
        for nonce in [inner, outer] {
            session
                .handle(ToHostMessage::StepPass { test_id: TestId(0), nonce })
                .unwrap();
        }
        session.handle(ToHostMessage::Pass { test_id: TestId(0) }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(session.open_steps(), 0);

        insta::assert_snapshot!(root.report().render(), @r"
        test 0 ... running
          Node ... running
            outer ... ok
              inner ... ok
        ");
    }

    #[test]
    fn test_ignored_step_gets_unregistered_nonce() {
        let mut session = session();
        let (root, _rx) = run(&mut session, 0);
        let nonce = session
            .handle(ToHostMessage::StepStart {
                test_id: TestId(0),
                parent: None,
                ignore: true,
                name: "skipped".to_string(),
            })
            .unwrap()
            .unwrap();
        assert_eq!(session.open_steps(), 0);
        assert_eq!(
            session.handle(ToHostMessage::StepPass { test_id: TestId(0), nonce: nonce.clone() }),
            Err(ProtocolError::InvalidNonce(nonce))
        );
        assert_eq!(root.report().steps[0].steps[0].outcome, crate::host::StepOutcome::Ignored);
    }

    #[test]
    fn test_unknown_ids_are_protocol_errors() {
        let mut session = session();
        assert_eq!(
            session.handle(ToHostMessage::Pass { test_id: TestId(4) }),
            Err(ProtocolError::InvalidId(TestId(4)))
        );
        let (_root, _rx) = run(&mut session, 0);
        assert_eq!(
            session.handle(ToHostMessage::StepFail {
                test_id: TestId(0),
                nonce: Nonce::new("bogus"),
                error: SerializedError::Other { value: serde_json::Value::Null },
            }),
            Err(ProtocolError::InvalidNonce(Nonce::new("bogus")))
        );
        assert_eq!(
            session
                .handle(ToHostMessage::StepStart {
                    test_id: TestId(0),
                    parent: Some(Nonce::new("ghost")),
                    ignore: false,
                    name: "x".to_string(),
                })
                .unwrap_err(),
            ProtocolError::InvalidParent(Nonce::new("ghost"))
        );
    }

    #[test]
    fn test_foreign_nonce_is_rejected() {
        let mut session = session();
        let (_a, _rx_a) = run(&mut session, 0);
        let (_b, _rx_b) = run(&mut session, 1);
        let nonce = start(&mut session, 0, None, "mine");
        assert!(matches!(
            session.handle(ToHostMessage::StepPass { test_id: TestId(1), nonce }),
            Err(ProtocolError::ForeignNonce { owner: TestId(0), test_id: TestId(1), .. })
        ));
    }

    #[test]
    fn test_messages_after_settlement_are_rejected() {
        let mut session = session();
        let (_root, _rx) = run(&mut session, 2);
        session.handle(ToHostMessage::Pass { test_id: TestId(2) }).unwrap();
        assert_eq!(
            session.handle(ToHostMessage::Pass { test_id: TestId(2) }),
            Err(ProtocolError::SettledTest(TestId(2)))
        );
        assert!(matches!(
            session.handle(ToHostMessage::StepStart {
                test_id: TestId(2),
                parent: None,
                ignore: false,
                name: "late".to_string()
            }),
            Err(ProtocolError::SettledTest(TestId(2)))
        ));
    }

    #[test]
    fn test_duplicate_test_id_rejected_immediately() {
        let mut session = session();
        let (_root, _rx) = run(&mut session, 0);
        let (tx, mut rx) = oneshot::channel();
        assert!(!session.register_run(TestId(0), HostContext::root("dup", "suite.rs", "node"), tx));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RunError::Controller(ControllerError::Protocol(ProtocolError::DuplicateTestId(TestId(0)))))
        );
    }

    #[test]
    fn test_panic_fails_steps_and_rejects_runs() {
        let mut session = session();
        let (root, mut rx0) = run(&mut session, 0);
        let (_other, mut rx1) = run(&mut session, 1);
        let outer = start(&mut session, 0, None, "outer");
        start(&mut session, 0, Some(&outer), "inner");

        let err = ControllerError::BackendDied("exit code 1".to_string());
        session.panic(err.clone());
        session.panic(ControllerError::Closed);

        assert_eq!(session.state(), ControllerState::Panicked(err.clone()));
        assert_eq!(rx0.try_recv().unwrap(), Err(RunError::Controller(err.clone())));
        assert_eq!(rx1.try_recv().unwrap(), Err(RunError::Controller(err.clone())));
        assert_eq!(session.open_steps(), 0);

        let outer_report = root.report().steps[0].steps[0].clone();
        assert_eq!(outer_report.error(), Some(&err.to_test_error()));
        assert_eq!(outer_report.steps[0].error(), Some(&err.to_test_error()));

        let (tx, mut late) = oneshot::channel();
        assert!(!session.register_run(TestId(9), HostContext::root("late", "suite.rs", "node"), tx));
        assert_eq!(late.try_recv().unwrap(), Err(RunError::Controller(err)));
    }

    #[test]
    fn test_settling_fails_dangling_steps() {
        let mut session = session();
        let (root, _rx) = run(&mut session, 0);
        start(&mut session, 0, None, "never closed");
        session.handle(ToHostMessage::Pass { test_id: TestId(0) }).unwrap();
        assert_eq!(session.open_steps(), 0);
        assert!(root.report().steps[0].steps[0].outcome.is_failed());
    }
}
