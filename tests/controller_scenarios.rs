//! Drive a real controller over HTTP, playing the runner by hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use crosstest::backend::{BackendError, BackendExit, RuntimeBackend, Started};
use crosstest::controller::{Controller, ControllerError, ControllerOptions, ControllerState, ProtocolError, RunError};
use crosstest::host::HostContext;
use crosstest_core::{Nonce, ParentData, SerializedError, TestId, ToHostMessage, ToRunnerMessage};
use crosstest_runner::{CommandStream, HostLink, HttpHostLink, LinkError};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Hands the parent data to the test instead of launching anything.
struct ManualBackend {
    parents: mpsc::UnboundedSender<ParentData>,
    exit: Mutex<Option<oneshot::Receiver<BackendExit>>>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl RuntimeBackend for ManualBackend {
    type Handle = ();

    fn runtime(&self) -> &str {
        "manual"
    }

    async fn prepare_artifact(&self, file: &Path) -> Result<PathBuf, BackendError> {
        Ok(file.to_path_buf())
    }

    async fn start(&self, _artifact: &Path, parent: &ParentData) -> Result<Started<()>, BackendError> {
        let exit = self.exit.lock().await.take();
        self.parents
            .send(parent.clone())
            .map_err(|_| BackendError::Other("harness dropped".to_string()))?;
        Ok(Started {
            handle: (),
            exited: Box::pin(async move {
                match exit {
                    Some(exit) => match exit.await {
                        Ok(exit) => exit,
                        Err(_) => futures::future::pending().await,
                    },
                    None => futures::future::pending().await,
                }
            }),
        })
    }

    async fn stop(&self, _handle: &mut ()) -> Result<(), BackendError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    controller: Arc<Controller<ManualBackend>>,
    link: HttpHostLink,
    commands: CommandStream,
    parent: ParentData,
    stops: Arc<AtomicUsize>,
    kill: oneshot::Sender<BackendExit>,
}

impl Harness {
    async fn start() -> Self {
        let (parents_tx, mut parents_rx) = mpsc::unbounded_channel();
        let (kill, exit) = oneshot::channel();
        let stops = Arc::new(AtomicUsize::new(0));
        let backend = ManualBackend {
            parents: parents_tx,
            exit: Mutex::new(Some(exit)),
            stops: Arc::clone(&stops),
        };
        let controller = Controller::start(backend, Path::new("tests/suite.rs"), ControllerOptions::default())
            .await
            .unwrap();
        let parent = parents_rx.recv().await.unwrap();
        let link = HttpHostLink::new(parent.server.clone());
        let commands = link.commands().await.unwrap();
        Self {
            controller: Arc::new(controller),
            link,
            commands,
            parent,
            stops,
            kill,
        }
    }

    /// Start, report ready and wait for the controller to notice.
    async fn ready() -> Self {
        let harness = Self::start().await;
        harness.link.send(ToHostMessage::Ready).await.unwrap();
        harness.controller.wait_ready().await.unwrap();
        harness
    }

    /// Ask the controller to run `id` and wait until the runner sees the command.
    async fn run(&mut self, id: u64) -> (HostContext, tokio::task::JoinHandle<Result<(), RunError>>) {
        let context = HostContext::root(format!("test {id}"), "tests/suite.rs", "host");
        let controller = Arc::clone(&self.controller);
        let ctx = context.clone();
        let run = tokio::spawn(async move { controller.run_test(TestId(id), ctx).await });
        assert_eq!(self.next_command().await, Some(ToRunnerMessage::Run { test_id: TestId(id) }));
        (context, run)
    }

    async fn next_command(&mut self) -> Option<ToRunnerMessage> {
        tokio::time::timeout(Duration::from_secs(5), self.commands.next())
            .await
            .unwrap()
            .map(Result::unwrap)
    }

    async fn step_start(&self, id: u64, parent: Option<&Nonce>, name: &str) -> Nonce {
        self.link
            .send(ToHostMessage::StepStart {
                test_id: TestId(id),
                parent: parent.cloned(),
                ignore: false,
                name: name.to_string(),
            })
            .await
            .unwrap()
            .unwrap()
    }

    async fn step_pass(&self, id: u64, nonce: &Nonce) {
        let reply = self
            .link
            .send(ToHostMessage::StepPass {
                test_id: TestId(id),
                nonce: nonce.clone(),
            })
            .await;
        assert_eq!(reply.unwrap(), None);
    }

    async fn pass(&self, id: u64) {
        self.link.send(ToHostMessage::Pass { test_id: TestId(id) }).await.unwrap();
    }
}

fn assertion(message: &str) -> SerializedError {
    SerializedError::Error {
        name: "AssertionError".to_string(),
        message: message.to_string(),
        stack: None,
    }
}

fn status_of(result: Result<Option<Nonce>, LinkError>) -> u16 {
    match result {
        Err(LinkError::Rejected { status, .. }) => status,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

async fn wait_for_state(controller: &Controller<ManualBackend>, pred: impl Fn(&ControllerState) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred(&controller.state()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_parent_data_describes_the_controller() {
    let harness = Harness::start().await;
    assert_eq!(harness.parent.file, "tests/suite.rs");
    assert_eq!(harness.parent.runtime, "manual");
    assert_eq!(harness.parent.server, harness.controller.server());
    assert!(!harness.parent.is_debug);
    assert_eq!(harness.controller.state(), ControllerState::Starting);
}

#[tokio::test]
async fn test_run_queued_before_ready_is_delivered_in_order() {
    let mut harness = Harness::start().await;
    let (_ctx, run) = {
        let context = HostContext::root("early", "tests/suite.rs", "host");
        let controller = Arc::clone(&harness.controller);
        let ctx = context.clone();
        (context, tokio::spawn(async move { controller.run_test(TestId(0), ctx).await }))
    };

    harness.link.send(ToHostMessage::Ready).await.unwrap();
    assert_eq!(harness.next_command().await, Some(ToRunnerMessage::Run { test_id: TestId(0) }));
    harness.pass(0).await;

    assert_eq!(run.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_single_pass() {
    let mut harness = Harness::ready().await;
    let (_ctx, run) = harness.run(7).await;
    wait_for_state(&harness.controller, |s| *s == ControllerState::Running).await;

    harness.pass(7).await;

    assert_eq!(run.await.unwrap(), Ok(()));
    wait_for_state(&harness.controller, |s| *s == ControllerState::Ready).await;
}

#[tokio::test]
async fn test_nested_steps_are_mirrored() {
    let mut harness = Harness::ready().await;
    let (ctx, run) = harness.run(0).await;

    let outer = harness.step_start(0, None, "outer").await;
    let inner = harness.step_start(0, Some(&outer), "inner").await;
    assert_ne!(outer, inner);
    assert!(outer.as_str().starts_with("manual-"));
    harness.step_pass(0, &inner).await;
    harness.step_pass(0, &outer).await;
    harness.pass(0).await;

    assert_eq!(run.await.unwrap(), Ok(()));
    ctx.finish(Ok(()));
    insta::assert_snapshot!(ctx.report().render(), @r"
    test 0 ... ok
      outer ... ok
        inner ... ok
    ");
}

#[tokio::test]
async fn test_failing_step_and_test() {
    let mut harness = Harness::ready().await;
    let (ctx, run) = harness.run(0).await;

    let step = harness.step_start(0, None, "checks").await;
    harness
        .link
        .send(ToHostMessage::StepFail {
            test_id: TestId(0),
            nonce: step,
            error: assertion("1 != 2"),
        })
        .await
        .unwrap();
    harness
        .link
        .send(ToHostMessage::Fail {
            test_id: TestId(0),
            error: assertion("1 != 2"),
        })
        .await
        .unwrap();

    match run.await.unwrap() {
        Err(RunError::Failed(err)) => {
            assert_eq!(err.name, "AssertionError");
            assert_eq!(err.message, "1 != 2");
        }
        other => panic!("expected a test failure, got {other:?}"),
    }
    let report = ctx.report();
    let checks = report.find(&["checks"]).unwrap();
    assert_eq!(checks.error().map(|e| e.message.as_str()), Some("1 != 2"));
}

#[tokio::test]
async fn test_ignored_step_is_reported_without_registration() {
    let mut harness = Harness::ready().await;
    let (ctx, run) = harness.run(0).await;

    let nonce = harness
        .link
        .send(ToHostMessage::StepStart {
            test_id: TestId(0),
            parent: None,
            ignore: true,
            name: "skipped".to_string(),
        })
        .await
        .unwrap()
        .unwrap();

    // The nonce was never registered, so completing it is a violation.
    let reply = harness
        .link
        .send(ToHostMessage::StepPass {
            test_id: TestId(0),
            nonce: nonce.clone(),
        })
        .await;
    assert_eq!(status_of(reply), 500);
    assert_eq!(
        run.await.unwrap(),
        Err(RunError::Controller(ControllerError::Protocol(ProtocolError::InvalidNonce(nonce))))
    );

    ctx.finish(Ok(()));
    insta::assert_snapshot!(ctx.report().render(), @r"
    test 0 ... ok
      skipped ... ignored
    ");
}

#[tokio::test]
async fn test_unknown_nonce_panics_the_controller() {
    let mut harness = Harness::ready().await;
    let (_ctx, run) = harness.run(0).await;

    let reply = harness
        .link
        .send(ToHostMessage::StepPass {
            test_id: TestId(0),
            nonce: Nonce::new("made-up"),
        })
        .await;
    assert_eq!(status_of(reply), 500);

    let expected = ControllerError::Protocol(ProtocolError::InvalidNonce(Nonce::new("made-up")));
    assert_eq!(run.await.unwrap(), Err(RunError::Controller(expected.clone())));
    wait_for_state(&harness.controller, |s| *s == ControllerState::Panicked(expected.clone())).await;

    // Teardown pushed `exit` and ended the stream.
    assert_eq!(harness.next_command().await, Some(ToRunnerMessage::Exit));
    assert_eq!(harness.next_command().await, None);
    assert_eq!(harness.stops.load(Ordering::SeqCst), 1);

    // Later runs fail with the same error.
    let ctx = HostContext::root("late", "tests/suite.rs", "host");
    assert_eq!(
        harness.controller.run_test(TestId(1), ctx).await,
        Err(RunError::Controller(expected))
    );
}

#[tokio::test]
async fn test_messages_for_settled_tests_are_rejected() {
    let mut harness = Harness::ready().await;
    let (_ctx, run) = harness.run(0).await;
    harness.pass(0).await;
    assert_eq!(run.await.unwrap(), Ok(()));

    let reply = harness
        .link
        .send(ToHostMessage::StepStart {
            test_id: TestId(0),
            parent: None,
            ignore: false,
            name: "too late".to_string(),
        })
        .await;
    assert_eq!(status_of(reply), 500);
    wait_for_state(&harness.controller, |s| {
        *s == ControllerState::Panicked(ControllerError::Protocol(ProtocolError::SettledTest(TestId(0))))
    })
    .await;
}

#[tokio::test]
async fn test_backend_death_fails_pending_runs() {
    let mut harness = Harness::ready().await;
    let (ctx, run) = harness.run(0).await;
    let _open = harness.step_start(0, None, "hangs").await;

    harness.kill.send(BackendExit::Exited(Some(3))).unwrap();

    let expected = ControllerError::BackendDied("exit code 3".to_string());
    assert_eq!(run.await.unwrap(), Err(RunError::Controller(expected)));
    let report = ctx.report();
    assert!(report.find(&["hangs"]).unwrap().outcome.is_failed());
}

#[tokio::test]
async fn test_backend_death_before_ready() {
    let harness = Harness::start().await;
    harness.kill.send(BackendExit::Exited(Some(1))).unwrap();

    let expected = ControllerError::BackendDied("exit code 1".to_string());
    assert_eq!(harness.controller.wait_ready().await, Err(expected.clone()));
    let ctx = HostContext::root("never runs", "tests/suite.rs", "host");
    assert_eq!(
        harness.controller.run_test(TestId(0), ctx).await,
        Err(RunError::Controller(expected))
    );
    assert_eq!(harness.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_stops_once() {
    let mut harness = Harness::ready().await;

    harness.controller.close().await;
    harness.controller.close().await;

    assert_eq!(harness.controller.state(), ControllerState::Closed);
    assert_eq!(harness.stops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.next_command().await, Some(ToRunnerMessage::Exit));
    assert_eq!(harness.next_command().await, None);

    let ctx = HostContext::root("after close", "tests/suite.rs", "host");
    assert_eq!(
        harness.controller.run_test(TestId(0), ctx).await,
        Err(RunError::Controller(ControllerError::Closed))
    );
}

#[tokio::test]
async fn test_dropping_the_controller_cleans_up() {
    let harness = Harness::ready().await;
    let Harness {
        controller,
        mut commands,
        stops,
        ..
    } = harness;
    drop(controller);

    let next = tokio::time::timeout(Duration::from_secs(5), commands.next()).await.unwrap();
    assert_eq!(next.map(Result::unwrap), Some(ToRunnerMessage::Exit));
    tokio::time::timeout(Duration::from_secs(5), async {
        while stops.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_second_subscriber_is_refused() {
    let harness = Harness::start().await;
    match harness.link.commands().await {
        Err(LinkError::Rejected { status, .. }) => assert_eq!(status, 409),
        Err(other) => panic!("expected 409, got {other:?}"),
        Ok(_) => panic!("second subscription succeeded"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_a_bad_request_and_panics() {
    let mut harness = Harness::ready().await;
    let (_ctx, run) = harness.run(0).await;

    let response = reqwest::Client::new()
        .post(&harness.parent.server)
        .body("{\"type\":\"explode\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    match run.await.unwrap() {
        Err(RunError::Controller(ControllerError::Protocol(ProtocolError::Malformed(_)))) => {}
        other => panic!("expected a malformed-message panic, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_test_id_is_rejected() {
    let mut harness = Harness::ready().await;
    let (_ctx, run) = harness.run(0).await;
    harness.pass(0).await;
    assert_eq!(run.await.unwrap(), Ok(()));

    let ctx = HostContext::root("again", "tests/suite.rs", "host");
    assert_eq!(
        harness.controller.run_test(TestId(0), ctx).await,
        Err(RunError::Controller(ControllerError::Protocol(ProtocolError::DuplicateTestId(TestId(0)))))
    );
    // The controller keeps serving other tests.
    let (_ctx, run) = harness.run(1).await;
    harness.pass(1).await;
    assert_eq!(run.await.unwrap(), Ok(()));
}
