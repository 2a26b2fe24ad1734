//! The test-definition API shared by hosts and runners.
//!
//! A test body is an async function of a [`Context`]. The context is the only thing that differs
//! between runtimes: on the host it writes into the native report tree, inside a runner it forwards
//! every `step` call over the wire. The body itself never knows which one it got.
//!
//! ## Registration
//!
//! Registration accepts the same argument shapes as common JS test frameworks, expressed as
//! [`TestArgs`] variants, and [`normalize`] turns any of them into one typed triple. Precedence:
//! - an explicit string name wins over a name carried in [`TestOptions`],
//! - the function is always the last element,
//! - an options value is options, never a name.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Thrown;
use crate::ids::TestId;

/// Outcome of a test body or step body.
pub type TestResult = Result<(), Thrown>;

/// Boxed future returned by a [`TestFn`].
pub type BoxTestFuture = Pin<Box<dyn Future<Output = TestResult> + Send + 'static>>;

/// Shared handle to whichever step API the current runtime provides.
pub type Context = Arc<dyn StepApi>;

/// A test or step body.
pub type TestFn = Arc<dyn Fn(Context) -> BoxTestFuture + Send + Sync>;

/// Wrap an async closure as a [`TestFn`].
pub fn test_fn<F, Fut>(f: F) -> TestFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TestResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// The nested-step API a test body sees.
#[async_trait]
pub trait StepApi: Send + Sync {
    /// Name of the test or step this context belongs to.
    fn name(&self) -> &str;

    /// The test file the definition came from.
    fn origin(&self) -> &str;

    /// Name of the runtime executing the body.
    fn runtime(&self) -> &str;

    /// Run a nested step and report whether it passed.
    ///
    /// Ignored steps are reported but never executed and yield `Ok(false)`. An `Err` means the step
    /// could not be reported at all (for example, the runner lost its host).
    async fn step(&self, step: StepDefinition) -> Result<bool, Thrown>;
}

/// A nested step to run.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub ignore: bool,
    pub func: TestFn,
}

impl StepDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self::from_fn(name, test_fn(f))
    }

    pub fn from_fn(name: impl Into<String>, func: TestFn) -> Self {
        Self {
            name: name.into(),
            ignore: false,
            func,
        }
    }

    pub fn ignore(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("ignore", &self.ignore)
            .finish_non_exhaustive()
    }
}

/// Per-test registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    pub name: Option<String>,
    pub ignore: bool,
    pub only: bool,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn ignored(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn only(mut self, only: bool) -> Self {
        self.only = only;
        self
    }
}

/// A full test descriptor (the single-argument registration form).
#[derive(Clone)]
pub struct TestDescriptor {
    pub name: Option<String>,
    pub options: TestOptions,
    pub func: TestFn,
}

/// Every accepted registration shape.
#[derive(Clone)]
pub enum TestArgs {
    /// `test(fn)`
    Fn(TestFn),
    /// `test(name, fn)`
    Named(String, TestFn),
    /// `test(name, options, fn)`
    NamedWithOptions(String, TestOptions, TestFn),
    /// `test(options, fn)`
    WithOptions(TestOptions, TestFn),
    /// `test({ name, fn, ...options })`
    Descriptor(TestDescriptor),
}

impl From<TestFn> for TestArgs {
    fn from(func: TestFn) -> Self {
        TestArgs::Fn(func)
    }
}

impl From<(&str, TestFn)> for TestArgs {
    fn from((name, func): (&str, TestFn)) -> Self {
        TestArgs::Named(name.to_string(), func)
    }
}

impl From<(String, TestFn)> for TestArgs {
    fn from((name, func): (String, TestFn)) -> Self {
        TestArgs::Named(name, func)
    }
}

impl From<(&str, TestOptions, TestFn)> for TestArgs {
    fn from((name, options, func): (&str, TestOptions, TestFn)) -> Self {
        TestArgs::NamedWithOptions(name.to_string(), options, func)
    }
}

impl From<(String, TestOptions, TestFn)> for TestArgs {
    fn from((name, options, func): (String, TestOptions, TestFn)) -> Self {
        TestArgs::NamedWithOptions(name, options, func)
    }
}

impl From<(TestOptions, TestFn)> for TestArgs {
    fn from((options, func): (TestOptions, TestFn)) -> Self {
        TestArgs::WithOptions(options, func)
    }
}

impl From<TestDescriptor> for TestArgs {
    fn from(descriptor: TestDescriptor) -> Self {
        TestArgs::Descriptor(descriptor)
    }
}

/// A registration reduced to one typed triple.
#[derive(Clone)]
pub struct NormalizedTest {
    pub name: Option<String>,
    pub options: TestOptions,
    pub func: TestFn,
}

impl NormalizedTest {
    /// The name to report, falling back to the test's position for anonymous tests.
    pub fn display_name(&self, id: TestId) -> String {
        self.name.clone().unwrap_or_else(|| format!("test #{id}"))
    }
}

impl fmt::Debug for NormalizedTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedTest")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Reduce any registration shape to `{name?, options, fn}`.
pub fn normalize(args: TestArgs) -> NormalizedTest {
    let (explicit, options, func) = match args {
        TestArgs::Fn(func) => (None, TestOptions::default(), func),
        TestArgs::Named(name, func) => (Some(name), TestOptions::default(), func),
        TestArgs::NamedWithOptions(name, options, func) => (Some(name), options, func),
        TestArgs::WithOptions(options, func) => (None, options, func),
        TestArgs::Descriptor(TestDescriptor { name, options, func }) => (name, options, func),
    };
    let name = explicit.or_else(|| options.name.clone());
    NormalizedTest { name, options, func }
}

/// Something tests can be registered on: the host registrar or a runner shim.
///
/// Both assign [`TestId`]s sequentially from zero in registration order.
pub trait Register {
    fn register(&mut self, args: TestArgs) -> TestId;

    /// Shorthand for `register(TestArgs::Named(name, func))`.
    fn test(&mut self, name: &str, func: TestFn) -> TestId {
        self.register(TestArgs::Named(name.to_string(), func))
    }
}

/// Run a body to completion, turning a panic into a thrown value.
///
/// The body runs on its own task so a panic unwinds that task only.
pub async fn invoke(func: &TestFn, ctx: Context) -> TestResult {
    let future = func(ctx);
    match tokio::spawn(future).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(Thrown::from_panic(err.into_panic())),
        Err(err) => Err(Thrown::error("Cancelled", err.to_string())),
    }
}
