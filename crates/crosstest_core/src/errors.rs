//! Error values that cross the runner/host boundary.
//!
//! A runner reports whatever its test body raised as a [`SerializedError`]. Native errors keep their
//! identity (`name`, `message`, `stack`); anything else (a panic payload, an arbitrary value) travels as
//! `other` and is stringified when the host rebuilds it.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name given to errors rebuilt from non-error thrown values.
pub const GENERIC_ERROR_NAME: &str = "Error";

/// Wire form of a thrown value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SerializedError {
    Error {
        name: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Other {
        value: Value,
    },
}

/// A native error: what a failing test or step is reported with on the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct TestError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl TestError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an arbitrary error, naming it after its Rust type.
    ///
    /// A `TestError` passed through here keeps its original name and stack.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        if let Some(existing) = (err as &dyn std::error::Error).downcast_ref::<TestError>() {
            return existing.clone();
        }
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

/// Whatever a test body raised.
#[derive(Debug, Clone, PartialEq)]
pub enum Thrown {
    Error(TestError),
    Other(Value),
}

impl Thrown {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Thrown::Error(TestError::new(name, message))
    }

    pub fn other(value: impl Into<Value>) -> Self {
        Thrown::Other(value.into())
    }

    /// Convert a caught panic payload. String payloads (the `panic!`/`assert!` case) are kept
    /// verbatim.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Thrown::Other(Value::String(*message)),
            Err(payload) => payload,
        };
        match payload.downcast::<&'static str>() {
            Ok(message) => Thrown::Other(Value::String((*message).to_string())),
            Err(_) => Thrown::Other(Value::String("Box<dyn Any>".to_string())),
        }
    }

    pub fn serialize(&self) -> SerializedError {
        match self {
            Thrown::Error(err) => SerializedError::Error {
                name: err.name.clone(),
                message: err.message.clone(),
                stack: err.stack.clone(),
            },
            Thrown::Other(value) => SerializedError::Other { value: value.clone() },
        }
    }

    /// The native error the host would rebuild from this value.
    pub fn into_test_error(self) -> TestError {
        match self {
            Thrown::Error(err) => err,
            Thrown::Other(value) => deserialize_error(SerializedError::Other { value }),
        }
    }
}

impl<E: std::error::Error + 'static> From<E> for Thrown {
    fn from(err: E) -> Self {
        Thrown::Error(TestError::from_error(&err))
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Thrown::Error(err) => write!(f, "{err}"),
            Thrown::Other(value) => f.write_str(&stringify(value)),
        }
    }
}

/// Rebuild a native error from its wire form.
pub fn deserialize_error(error: SerializedError) -> TestError {
    match error {
        SerializedError::Error { name, message, stack } => {
            let error = TestError::new(name, message);
            match stack {
                Some(stack) => error.with_stack(stack),
                None => error,
            }
        }
        SerializedError::Other { value } => TestError::new(GENERIC_ERROR_NAME, stringify(&value)),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn short_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}
