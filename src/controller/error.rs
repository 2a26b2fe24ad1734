//! Errors raised by a controller.

use crosstest_core::{Nonce, TestError, TestId};
use thiserror::Error;

/// Name of the error a test step fails with when the cause is infrastructure, not the test.
pub const CROSSTEST_ERROR_NAME: &str = "CrossTestError";

/// A runner broke the protocol. Always fatal for the controller that saw it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid id: {0}")]
    InvalidId(TestId),

    #[error("test {0} already settled")]
    SettledTest(TestId),

    #[error("Invalid nonce: {0}")]
    InvalidNonce(Nonce),

    #[error("Invalid parent nonce: {0}")]
    InvalidParent(Nonce),

    #[error("nonce {nonce} belongs to test {owner}, not test {test_id}")]
    ForeignNonce { nonce: Nonce, owner: TestId, test_id: TestId },

    #[error("step {nonce} completed while {open} nested step(s) are still open")]
    OpenChildren { nonce: Nonce, open: usize },

    #[error("test id {0} was already used on this controller")]
    DuplicateTestId(TestId),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Why a controller stopped serving. `Clone` so one failure can reject every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("backend process died: {0}")]
    BackendDied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to start runtime: {0}")]
    Startup(String),

    #[error("controller is closed")]
    Closed,
}

impl ControllerError {
    pub fn to_test_error(&self) -> TestError {
        TestError::new(CROSSTEST_ERROR_NAME, self.to_string())
    }
}

/// Why a `run_test` call did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// The test itself failed on the runner.
    #[error("{0}")]
    Failed(TestError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl RunError {
    /// The error the runtime's step is reported with.
    pub fn into_test_error(self) -> TestError {
        match self {
            RunError::Failed(err) => err,
            RunError::Controller(err) => err.to_test_error(),
        }
    }
}
