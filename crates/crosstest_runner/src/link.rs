//! The runner's side of the transport.

use std::collections::VecDeque;

use async_trait::async_trait;
use crosstest_core::codec::{LineDecoder, decode_line};
use crosstest_core::{Nonce, StepStarted, ToHostMessage, ToRunnerMessage};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use thiserror::Error;

/// Commands pushed by the host, in order.
pub type CommandStream = BoxStream<'static, Result<ToRunnerMessage, LinkError>>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("request to host failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("host rejected {kind} with status {status}: {body}")]
    Rejected {
        kind: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid message from host: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("host did not answer stepStart with a nonce")]
    MissingNonce,

    #[error("host link closed")]
    Closed,
}

/// How a runner reaches its controller.
#[async_trait]
pub trait HostLink: Send + Sync {
    /// Deliver one event. Returns the nonce the host minted when `message` is a `stepStart`.
    async fn send(&self, message: ToHostMessage) -> Result<Option<Nonce>, LinkError>;

    /// Open the host's push stream.
    async fn commands(&self) -> Result<CommandStream, LinkError>;
}

/// [`HostLink`] over the controller's HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpHostLink {
    client: reqwest::Client,
    server: String,
}

impl HttpHostLink {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.into(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl HostLink for HttpHostLink {
    async fn send(&self, message: ToHostMessage) -> Result<Option<Nonce>, LinkError> {
        tracing::debug!(kind = message.kind(), test_id = ?message.test_id(), "sending to host");
        let expects_nonce = matches!(message, ToHostMessage::StepStart { .. });
        let response = self.client.post(&self.server).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Rejected {
                kind: message.kind(),
                status: status.as_u16(),
                body,
            });
        }
        if !expects_nonce {
            return Ok(None);
        }
        let started: StepStarted = serde_json::from_slice(&response.bytes().await?)?;
        Ok(Some(started.nonce))
    }

    async fn commands(&self) -> Result<CommandStream, LinkError> {
        let response = self.client.get(&self.server).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Rejected {
                kind: "subscribe",
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_commands(response.bytes_stream()))
    }
}

/// Decode a chunked NDJSON byte stream into commands.
///
/// A final line the host did not terminate with `\n` is still decoded when the stream ends.
pub fn decode_commands<S, B, E>(bytes: S) -> CommandStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<LinkError> + Send,
{
    let state = (Some(Box::pin(bytes)), LineDecoder::new(), VecDeque::<String>::new());
    let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut lines)| async move {
        loop {
            if let Some(line) = lines.pop_front() {
                let item = decode_line::<ToRunnerMessage>(&line).map_err(LinkError::from);
                return Some((item, (bytes, decoder, lines)));
            }
            let next = bytes.as_mut()?.next().await;
            match next {
                Some(Ok(chunk)) => lines.extend(decoder.push(chunk.as_ref())),
                Some(Err(err)) => return Some((Err(err.into()), (bytes, decoder, lines))),
                None => {
                    bytes = None;
                    let rest = String::from_utf8_lossy(decoder.remainder()).trim().to_string();
                    if !rest.is_empty() {
                        tracing::debug!("push stream ended without a trailing newline");
                        lines.push_back(rest);
                    }
                }
            }
        }
    });
    stream.boxed()
}
