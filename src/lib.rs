#![forbid(unsafe_code)]
//! Run one test definition on several runtimes and report every outcome in one tree.
//!
//! The host side of crosstest: it registers tests, runs each one in-process and on every configured
//! remote runtime, and rebuilds the step trees those runtimes report into the host's own tree.
//!
//! ## Layout
//!
//! - [`registrar`] fans each test out to its runtimes.
//! - [`controller`] owns one runner instance per (file, runtime) and speaks the wire protocol.
//! - [`transport`] is the HTTP server a controller and its runner talk over.
//! - [`backend`] starts runner instances; [`artifact`] builds and caches what they load.
//! - [`host`] is the native nested-step API and its reports.
//!
//! ## Panic Policy
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The crate root enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Test bodies**: a panic inside a test or step body is caught and reported as that node's failure; it
//!   never takes the host down.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod artifact;
pub mod backend;
pub mod cli;
pub mod config;
pub mod controller;
pub mod host;
pub mod logging;
pub mod registrar;
pub mod transport;

pub use artifact::{ArtifactCache, ArtifactCompiler, ArtifactTarget};
pub use backend::{BackendExit, ProcessBackend, RuntimeBackend, Started};
pub use config::{CrossTestConfig, RuntimeKind, RuntimeSpec};
pub use controller::{Controller, ControllerError, ControllerOptions, ControllerState, RemoteRunner, RunError};
pub use host::{HostContext, StepOutcome, StepReport, SuiteReport};
pub use registrar::CrossTestHost;

pub use crosstest_core::{Register, StepDefinition, TestOptions, Thrown, test_fn};
