//! Runner controllers: one protocol session per (test file, runtime).
//!
//! A [`Controller`] is a handle on an actor task. The task owns the [`Session`](session::Session), the
//! transport's inbound queue, the push writer and the backend instance, and is the only place any of
//! them change. Everything else talks to it over channels:
//! - `run_test`/`close` send commands and await a oneshot reply,
//! - transport handlers forward each runner event with a reply slot for the HTTP response,
//! - the backend's exit future is polled alongside.
//!
//! Lifecycle: `Starting → Ready → Running ⇄ Ready → (Panicked | Closed)`. Teardown (push `exit`, close
//! the stream, stop the server, stop the backend) runs exactly once, on close, on panic, or when the
//! last handle is dropped.

pub mod error;
pub(crate) mod session;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use crosstest_core::{ParentData, TestId, ToRunnerMessage};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendExit, RuntimeBackend};
use crate::host::HostContext;
use crate::logging::truncate;
use crate::transport::{Inbound, PushWriter, Transport};

pub use error::{CROSSTEST_ERROR_NAME, ControllerError, ProtocolError, RunError};
use session::{RunReply, Session};

/// Observable lifecycle of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// Waiting for the runner's `ready`. Runs may already be queued.
    Starting,
    Ready,
    /// At least one test run is in flight.
    Running,
    Panicked(ControllerError),
    Closed,
}

/// Per-controller settings.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub is_debug: bool,
    pub debug_max_length: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            is_debug: false,
            debug_max_length: crate::config::DEFAULT_DEBUG_MAX_LENGTH,
        }
    }
}

enum Command {
    Run {
        test_id: TestId,
        context: HostContext,
        done: RunReply,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle on one runner instance and its protocol session.
pub struct Controller<B: RuntimeBackend> {
    backend: Arc<B>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ControllerState>,
    server: String,
}

impl<B: RuntimeBackend> Controller<B> {
    /// Bind a transport, prepare the artifact for `file` and start a runner instance on `backend`.
    ///
    /// Returns once the instance is started; the runner may not be ready yet.
    #[tracing::instrument(skip_all, fields(runtime = backend.runtime(), file = %file.display()))]
    pub async fn start(backend: B, file: &Path, options: ControllerOptions) -> Result<Self, ControllerError> {
        let backend = Arc::new(backend);
        let transport = Transport::bind(options.debug_max_length)
            .await
            .map_err(|err| ControllerError::Transport(err.to_string()))?;

        let started = async {
            let artifact = backend.prepare_artifact(file).await?;
            let parent = ParentData {
                file: file.display().to_string(),
                runtime: backend.runtime().to_string(),
                server: transport.url.clone(),
                is_debug: options.is_debug,
            };
            backend.start(&artifact, &parent).await
        }
        .await;
        let started = match started {
            Ok(started) => started,
            Err(err) => {
                transport.push.close().await;
                transport.shutdown.cancel();
                return Err(ControllerError::Startup(err.to_string()));
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ControllerState::Starting);
        let server = transport.url.clone();
        let actor = Actor {
            backend: Arc::clone(&backend),
            session: Session::new(backend.runtime()),
            commands: commands_rx,
            inbound: transport.inbound,
            push: transport.push,
            shutdown: transport.shutdown,
            handle: Some(started.handle),
            exited: started.exited,
            state: state_tx,
            max_log_length: options.debug_max_length,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            backend,
            commands: commands_tx,
            state: state_rx,
            server,
        })
    }

    pub fn runtime(&self) -> &str {
        self.backend.runtime()
    }

    /// Base URL of this controller's transport.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    /// Run test `test_id` on the runner, mirroring its steps under `context`.
    ///
    /// Settles with the runner's terminal message, or with the controller's failure if it panics or
    /// closes first.
    pub async fn run_test(&self, test_id: TestId, context: HostContext) -> Result<(), RunError> {
        let (done, settled) = oneshot::channel();
        self.commands
            .send(Command::Run { test_id, context, done })
            .map_err(|_| ControllerError::Closed)?;
        settled.await.map_err(|_| ControllerError::Closed)?
    }

    /// Resolve once the runner reported `ready`.
    pub async fn wait_ready(&self) -> Result<(), ControllerError> {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                ControllerState::Starting => {}
                ControllerState::Ready | ControllerState::Running => return Ok(()),
                ControllerState::Panicked(err) => return Err(err),
                ControllerState::Closed => return Err(ControllerError::Closed),
            }
            state.changed().await.map_err(|_| ControllerError::Closed)?;
        }
    }

    /// Tear the runner down. Open runs are rejected as closed. Idempotent.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }
}

/// Object-safe view of a controller, for callers that hold several runtime families at once.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    fn runtime(&self) -> &str;

    async fn run_test(&self, test_id: TestId, context: HostContext) -> Result<(), RunError>;

    async fn close(&self);
}

#[async_trait]
impl<B: RuntimeBackend> RemoteRunner for Controller<B> {
    fn runtime(&self) -> &str {
        Controller::runtime(self)
    }

    async fn run_test(&self, test_id: TestId, context: HostContext) -> Result<(), RunError> {
        Controller::run_test(self, test_id, context).await
    }

    async fn close(&self) {
        Controller::close(self).await
    }
}

struct Actor<B: RuntimeBackend> {
    backend: Arc<B>,
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Receiver<Inbound>,
    push: PushWriter,
    shutdown: CancellationToken,
    /// `None` once cleanup ran.
    handle: Option<B::Handle>,
    exited: BoxFuture<'static, BackendExit>,
    state: watch::Sender<ControllerState>,
    max_log_length: usize,
}

impl<B: RuntimeBackend> Actor<B> {
    async fn run(mut self) {
        let mut inbound_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                inbound = self.inbound.recv(), if inbound_open => match inbound {
                    Some(inbound) => self.on_inbound(inbound).await,
                    None => inbound_open = false,
                },
                exit = &mut self.exited, if self.handle.is_some() => {
                    self.on_exit(exit).await;
                }
            }
            self.state.send_replace(self.session.state());
        }
        self.cleanup().await;
        tracing::debug!(runtime = self.backend.runtime(), "controller stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Run { test_id, context, done } => {
                if !self.session.register_run(test_id, context, done) {
                    return;
                }
                tracing::debug!(runtime = self.backend.runtime(), %test_id, "dispatching test");
                if let Err(err) = self.push.send(&ToRunnerMessage::Run { test_id }).await {
                    self.panic(ControllerError::Transport(err.to_string())).await;
                }
            }
            Command::Close { done } => {
                self.session.close();
                self.cleanup().await;
                self.state.send_replace(self.session.state());
                let _ = done.send(());
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message { message, reply } => {
                if let Some(err) = self.session.failure() {
                    let _ = reply.send(Err(err.clone()));
                    return;
                }
                if !self.session.is_serving() {
                    let _ = reply.send(Err(ControllerError::Closed));
                    return;
                }
                tracing::debug!(
                    runtime = self.backend.runtime(),
                    kind = message.kind(),
                    test_id = ?message.test_id(),
                    terminal = message.is_terminal(),
                    payload = %truncate(&format!("{message:?}"), self.max_log_length),
                    "runner event"
                );
                match self.session.handle(message) {
                    Ok(nonce) => {
                        let _ = reply.send(Ok(nonce));
                    }
                    Err(err) => {
                        let err = ControllerError::Protocol(err);
                        let _ = reply.send(Err(err.clone()));
                        self.panic(err).await;
                    }
                }
            }
            Inbound::Malformed { error } => {
                if self.session.is_serving() {
                    self.panic(ControllerError::Protocol(ProtocolError::Malformed(error))).await;
                }
            }
        }
    }

    async fn on_exit(&mut self, exit: BackendExit) {
        tracing::warn!(runtime = self.backend.runtime(), %exit, "runner exited unexpectedly");
        self.panic(ControllerError::BackendDied(exit.to_string())).await;
    }

    async fn panic(&mut self, err: ControllerError) {
        self.session.panic(err);
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        tracing::debug!(runtime = self.backend.runtime(), "cleaning up controller");
        let _ = self.push.send(&ToRunnerMessage::Exit).await;
        self.push.close().await;
        self.shutdown.cancel();
        if let Err(err) = self.backend.stop(&mut handle).await {
            tracing::warn!(runtime = self.backend.runtime(), error = %err, "failed to stop runner");
        }
    }
}
