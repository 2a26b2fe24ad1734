//! HTTP transport between a controller and its runner.
//!
//! One server per controller, bound to an ephemeral port on loopback:
//! - `GET /` streams host→runner commands as newline-delimited JSON. The stream can be taken once.
//! - `POST /` delivers one runner→host event. The reply is `200 {nonce}` for `stepStart`, `204`
//!   otherwise, `400` for a body that does not parse and `500` for a protocol violation.

use std::convert::Infallible;
use std::sync::{Arc, PoisonError};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use crosstest_core::codec::encode_line;
use crosstest_core::{Nonce, StepStarted, ToHostMessage, ToRunnerMessage};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::controller::error::ControllerError;
use crate::logging::truncate;

const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind transport: {0}")]
    Bind(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("push stream is closed")]
    Closed,
}

/// An event delivered by the runner, waiting for the controller's answer.
pub enum Inbound {
    Message {
        message: ToHostMessage,
        reply: oneshot::Sender<Result<Option<Nonce>, ControllerError>>,
    },
    /// A body that did not parse as a message.
    Malformed { error: String },
}

/// Writer side of the push stream.
///
/// The sender exists from the moment the transport is bound, so commands written before the runner
/// subscribes are buffered and delivered in order.
#[derive(Clone)]
pub struct PushWriter {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl PushWriter {
    pub async fn send(&self, message: &ToRunnerMessage) -> Result<(), TransportError> {
        let line = encode_line(message)?;
        let sender = self.sender.lock().await;
        let sender = sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(line).map_err(|_| TransportError::Closed)
    }

    /// End the stream. Idempotent.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }
}

#[derive(Clone)]
struct AppState {
    inbound: mpsc::Sender<Inbound>,
    stream: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    max_log_length: usize,
}

/// A bound transport server.
pub struct Transport {
    pub url: String,
    pub inbound: mpsc::Receiver<Inbound>,
    pub push: PushWriter,
    pub shutdown: CancellationToken,
}

impl Transport {
    /// Bind to `127.0.0.1:0` and start serving.
    pub async fn bind(max_log_length: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let state = AppState {
            inbound: inbound_tx,
            stream: Arc::new(std::sync::Mutex::new(Some(push_rx))),
            max_log_length,
        };
        let router = Router::new().route("/", get(subscribe).post(receive)).with_state(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(err) = server.await {
                tracing::warn!(error = %err, "transport server failed");
            }
        });

        let url = format!("http://{addr}");
        tracing::debug!(%url, "transport listening");
        Ok(Self {
            url,
            inbound: inbound_rx,
            push: PushWriter {
                sender: Arc::new(Mutex::new(Some(push_tx))),
            },
            shutdown,
        })
    }
}

async fn subscribe(State(state): State<AppState>) -> Response {
    let receiver = state.stream.lock().unwrap_or_else(PoisonError::into_inner).take();
    let Some(receiver) = receiver else {
        return (StatusCode::CONFLICT, "push stream already has a subscriber").into_response();
    };
    tracing::debug!("runner subscribed to push stream");
    let lines = futures::stream::unfold(receiver, |mut receiver| async move {
        receiver
            .recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), receiver))
    });
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(lines)).into_response()
}

async fn receive(State(state): State<AppState>, body: Bytes) -> Response {
    tracing::debug!(
        payload = %truncate(&String::from_utf8_lossy(&body), state.max_log_length),
        "received from runner"
    );
    let message: ToHostMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(err) => {
            let error = err.to_string();
            let _ = state.inbound.send(Inbound::Malformed { error: error.clone() }).await;
            return (StatusCode::BAD_REQUEST, error).into_response();
        }
    };

    let (reply, answer) = oneshot::channel();
    if state.inbound.send(Inbound::Message { message, reply }).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, ControllerError::Closed.to_string()).into_response();
    }
    match answer.await {
        Ok(Ok(Some(nonce))) => axum::Json(StepStarted { nonce }).into_response(),
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err @ ControllerError::Protocol(_))) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        Ok(Err(err)) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, ControllerError::Closed.to_string()).into_response(),
    }
}
