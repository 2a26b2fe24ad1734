//! Provide the shared contracts between a crosstest host and the runners it drives.
//!
//! Both sides of the protocol link this crate:
//! - the host (`crosstest`) uses it to decode runner events and encode push commands, and
//! - the runner shim (`crosstest_runner`) uses it to encode events and replay registered tests.
//!
//! ## Notes
//!
//! - This is a "contracts" crate: **no transport IO**, no global state, no host-specific types.
//! - Test definitions are written once against [`api::StepApi`] and registered through
//!   [`api::Register`], so the same `fn suite(r: &mut dyn Register)` feeds the host registrar and the
//!   runner shim.

pub mod api;
pub mod codec;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod parent;

pub use api::{
    BoxTestFuture, Context, NormalizedTest, Register, StepApi, StepDefinition, TestArgs, TestDescriptor, TestFn,
    TestOptions, TestResult, invoke, normalize, test_fn,
};
pub use errors::{SerializedError, TestError, Thrown, deserialize_error};
pub use ids::{Nonce, TestId};
pub use messages::{StepStarted, ToHostMessage, ToRunnerMessage};
pub use parent::{PARENT_DATA_ENV, ParentData};
