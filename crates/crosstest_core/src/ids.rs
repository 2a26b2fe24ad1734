//! Correlation ids carried on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identify one logical test inside a test file.
///
/// Ids are assigned in registration order on both sides of the protocol, so the host's test `N`
/// and the runner's test `N` are the same definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub u64);

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TestId {
    fn from(value: u64) -> Self {
        TestId(value)
    }
}

/// Opaque token correlating a step's start with its later pass/fail.
///
/// Only the host mints nonces; runners echo them back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    pub fn new(value: impl Into<String>) -> Self {
        Nonce(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
