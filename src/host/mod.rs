//! The host's own nested-step reporting: a report tree per test, the [`HostContext`] handle test
//! bodies and controllers write through, and reporters that print the results.

pub mod context;
pub mod report;
pub mod reporter;

pub use context::HostContext;
pub use report::{STEP_ERROR_NAME, StepOutcome, StepReport, SuiteReport};
pub use reporter::{ConsoleReporter, SilentReporter, TestReporter};
