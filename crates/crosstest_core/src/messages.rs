//! Wire messages exchanged between a host controller and a runner.
//!
//! Every message is one JSON object discriminated by its `type` field. Field names are camelCase on
//! the wire (`testId`), snake_case in Rust.

use serde::{Deserialize, Serialize};

use crate::errors::SerializedError;
use crate::ids::{Nonce, TestId};

/// Events a runner reports to its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ToHostMessage {
    /// The runner finished loading and is listening on the push stream.
    Ready,
    Pass {
        test_id: TestId,
    },
    Fail {
        test_id: TestId,
        error: SerializedError,
    },
    /// A nested step began. The host answers with a [`StepStarted`] carrying a fresh nonce.
    StepStart {
        test_id: TestId,
        #[serde(default)]
        parent: Option<Nonce>,
        #[serde(default)]
        ignore: bool,
        name: String,
    },
    StepPass {
        test_id: TestId,
        nonce: Nonce,
    },
    StepFail {
        test_id: TestId,
        nonce: Nonce,
        error: SerializedError,
    },
}

impl ToHostMessage {
    /// The test this message refers to (`None` for `ready`).
    pub fn test_id(&self) -> Option<TestId> {
        match self {
            ToHostMessage::Ready => None,
            ToHostMessage::Pass { test_id }
            | ToHostMessage::Fail { test_id, .. }
            | ToHostMessage::StepStart { test_id, .. }
            | ToHostMessage::StepPass { test_id, .. }
            | ToHostMessage::StepFail { test_id, .. } => Some(*test_id),
        }
    }

    /// The wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ToHostMessage::Ready => "ready",
            ToHostMessage::Pass { .. } => "pass",
            ToHostMessage::Fail { .. } => "fail",
            ToHostMessage::StepStart { .. } => "stepStart",
            ToHostMessage::StepPass { .. } => "stepPass",
            ToHostMessage::StepFail { .. } => "stepFail",
        }
    }

    /// Whether this message settles a test run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToHostMessage::Pass { .. } | ToHostMessage::Fail { .. })
    }
}

/// Commands the host pushes to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ToRunnerMessage {
    Run { test_id: TestId },
    Exit,
}

/// The host's reply to a `stepStart`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStarted {
    pub nonce: Nonce,
}
