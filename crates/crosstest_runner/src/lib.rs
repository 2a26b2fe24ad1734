//! Runner shim for crosstest artifacts.
//!
//! A runner artifact registers its tests on a [`RunnerShim`] exactly as the host does, then hands the
//! shim to [`run_from_env`]. The shim reports `ready`, waits for the host's commands, and replays each
//! requested test, forwarding its nested steps so the host can rebuild the tree.
//!
//! ```no_run
//! use crosstest_core::{Register, test_fn};
//! use crosstest_runner::{RunnerShim, run_from_env};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), crosstest_runner::ShimError> {
//!     let mut shim = RunnerShim::new();
//!     shim.test("adds", test_fn(|_| async { Ok(()) }));
//!     run_from_env(shim).await
//! }
//! ```

#![deny(clippy::unwrap_used)]

pub mod context;
pub mod link;
pub mod shim;

use std::sync::Arc;

use crosstest_core::{PARENT_DATA_ENV, ParentData};

pub use context::{LINK_ERROR_NAME, RunnerContext};
pub use link::{CommandStream, HostLink, HttpHostLink, LinkError};
pub use shim::{RunnerShim, ShimError};

/// Read the parent data from the environment and serve `shim` over HTTP.
pub async fn run_from_env(shim: RunnerShim) -> Result<(), ShimError> {
    let raw = std::env::var(PARENT_DATA_ENV).map_err(|_| ShimError::MissingParentData(PARENT_DATA_ENV))?;
    let parent = ParentData::from_json(&raw).map_err(ShimError::ParentData)?;
    if parent.is_debug {
        init_debug_logging();
    }
    tracing::debug!(file = %parent.file, runtime = %parent.runtime, server = %parent.server, "runner starting");

    let link: Arc<dyn HostLink> = Arc::new(HttpHostLink::new(parent.server.clone()));
    shim.with_parent(&parent).serve(link).await
}

/// Log to stderr at `debug` unless `RUST_LOG` says otherwise. A no-op if a subscriber is installed.
fn init_debug_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
