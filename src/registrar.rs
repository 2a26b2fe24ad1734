//! Fan-out of one logical test across every configured runtime.
//!
//! Each registered test becomes one host test with one nested step per runtime, named after the
//! runtime (`native` → `Native`, `node` → `Node`). The in-process runtime runs the test body directly;
//! every other runtime delegates to its controller, which is started on first use and closed once
//! the whole file has run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crosstest_core::{Context, NormalizedTest, Register, TestArgs, TestId, Thrown, invoke, normalize};
use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::artifact::ArtifactCache;
use crate::backend::{ProcessBackend, RuntimeBackend};
use crate::config::CrossTestConfig;
use crate::controller::{Controller, ControllerError, ControllerOptions, RemoteRunner, RunError};
use crate::host::{HostContext, SilentReporter, StepOutcome, StepReport, SuiteReport, TestReporter};

/// Runtime name reported for the host's own test nodes.
pub const HOST_RUNTIME: &str = "host";

type StartFuture = BoxFuture<'static, Result<Arc<dyn RemoteRunner>, ControllerError>>;

/// A remote runtime whose controller starts on first use. A failed start is remembered and reported
/// by every test that needs the runtime.
struct LazyRunner {
    start: Mutex<Option<StartFuture>>,
    runner: OnceCell<Result<Arc<dyn RemoteRunner>, ControllerError>>,
}

impl LazyRunner {
    fn new(start: StartFuture) -> Self {
        Self {
            start: Mutex::new(Some(start)),
            runner: OnceCell::new(),
        }
    }

    fn ready(runner: Arc<dyn RemoteRunner>) -> Self {
        Self {
            start: Mutex::new(None),
            runner: OnceCell::new_with(Some(Ok(runner))),
        }
    }

    async fn get(&self) -> Result<Arc<dyn RemoteRunner>, ControllerError> {
        self.runner
            .get_or_init(|| async {
                let start = self.start.lock().unwrap_or_else(PoisonError::into_inner).take();
                match start {
                    Some(start) => start.await,
                    None => Err(ControllerError::Closed),
                }
            })
            .await
            .clone()
    }

    /// The runner, if it was ever started successfully.
    fn started(&self) -> Option<Arc<dyn RemoteRunner>> {
        self.runner.get().and_then(|runner| runner.as_ref().ok().cloned())
    }
}

enum Runtime {
    InProcess { name: String },
    Remote { name: String, runner: LazyRunner },
}

impl Runtime {
    fn name(&self) -> &str {
        match self {
            Runtime::InProcess { name } | Runtime::Remote { name, .. } => name,
        }
    }
}

/// Registers tests for one file and runs each across all runtimes.
pub struct CrossTestHost {
    file: PathBuf,
    runtimes: Vec<Runtime>,
    tests: Vec<NormalizedTest>,
}

/// `node` → `Node`.
pub fn step_name(runtime: &str) -> String {
    let mut chars = runtime.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl CrossTestHost {
    /// A host for `file` with no runtimes yet.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            runtimes: Vec::new(),
            tests: Vec::new(),
        }
    }

    /// A host with every runtime `config` declares, sharing `artifacts` with other files.
    pub fn from_config(file: impl Into<PathBuf>, config: &CrossTestConfig, artifacts: Arc<ArtifactCache>) -> Self {
        let options = ControllerOptions {
            is_debug: config.debug,
            debug_max_length: config.debug_max_length,
        };
        config.runtimes.iter().fold(Self::new(file), |host, spec| {
            match ProcessBackend::from_spec(spec, Arc::clone(&artifacts)) {
                Some(backend) => host.with_backend(backend, options.clone()),
                None => host.with_in_process(spec.name.clone()),
            }
        })
    }

    pub fn with_in_process(mut self, name: impl Into<String>) -> Self {
        self.runtimes.push(Runtime::InProcess { name: name.into() });
        self
    }

    /// Add a runtime served by `backend`; its controller starts when the first test needs it.
    pub fn with_backend<B: RuntimeBackend>(mut self, backend: B, options: ControllerOptions) -> Self {
        let name = backend.runtime().to_string();
        let file = self.file.clone();
        let start: StartFuture = Box::pin(async move {
            let controller = Controller::start(backend, &file, options).await?;
            Ok(Arc::new(controller) as Arc<dyn RemoteRunner>)
        });
        self.runtimes.push(Runtime::Remote {
            name,
            runner: LazyRunner::new(start),
        });
        self
    }

    /// Add a runtime served by an already started runner.
    pub fn with_runner(mut self, runner: Arc<dyn RemoteRunner>) -> Self {
        self.runtimes.push(Runtime::Remote {
            name: runner.runtime().to_string(),
            runner: LazyRunner::ready(runner),
        });
        self
    }

    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    pub fn runtimes(&self) -> Vec<&str> {
        self.runtimes.iter().map(Runtime::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Run every registered test, then close all controllers.
    pub async fn run(&self) -> SuiteReport {
        self.run_with(&mut SilentReporter).await
    }

    pub async fn run_with(&self, reporter: &mut (dyn TestReporter + Send)) -> SuiteReport {
        let started = Instant::now();
        let origin = self.file.display().to_string();
        let focused = self.tests.iter().any(|test| test.options.only);
        reporter.on_file_start(&origin, self.tests.len());

        let mut reports = Vec::with_capacity(self.tests.len());
        let mut filtered = 0;
        for (index, test) in self.tests.iter().enumerate() {
            let test_id = TestId(index as u64);
            if focused && !test.options.only {
                filtered += 1;
                continue;
            }
            let name = test.display_name(test_id);
            reporter.on_test_start(&name);

            let report = if test.options.ignore {
                StepReport {
                    name,
                    outcome: StepOutcome::Ignored,
                    duration: Duration::ZERO,
                    steps: Vec::new(),
                }
            } else {
                let root = HostContext::root(name, origin.as_str(), HOST_RUNTIME);
                for runtime in &self.runtimes {
                    self.run_on(runtime, test_id, test, &root).await;
                }
                root.finish(Ok(()));
                root.report()
            };
            reporter.on_test_complete(&report);
            reports.push(report);
        }

        self.close().await;
        let suite = SuiteReport {
            file: origin,
            tests: reports,
            filtered,
            duration: started.elapsed(),
        };
        reporter.on_run_complete(&suite);
        suite
    }

    async fn run_on(&self, runtime: &Runtime, test_id: TestId, test: &NormalizedTest, root: &HostContext) {
        let step = root.open_step(&step_name(runtime.name())).for_runtime(runtime.name());
        let result = match runtime {
            Runtime::InProcess { .. } => invoke(&test.func, Arc::new(step.clone()) as Context)
                .await
                .map_err(Thrown::into_test_error),
            Runtime::Remote { runner, .. } => {
                let result = match runner.get().await {
                    Ok(runner) => runner.run_test(test_id, step.clone()).await,
                    Err(err) => Err(RunError::Controller(err)),
                };
                result.map_err(RunError::into_test_error)
            }
        };
        if let Err(err) = &result {
            tracing::debug!(runtime = runtime.name(), %test_id, error = %err, "runtime step failed");
        }
        step.finish(result);
    }

    /// Close every controller that was started. Idempotent.
    pub async fn close(&self) {
        for runtime in &self.runtimes {
            let started = match runtime {
                Runtime::Remote { runner, .. } => runner.started(),
                Runtime::InProcess { .. } => None,
            };
            if let Some(runner) = started {
                runner.close().await;
            }
        }
    }
}

impl Register for CrossTestHost {
    fn register(&mut self, args: TestArgs) -> TestId {
        let id = TestId(self.tests.len() as u64);
        self.tests.push(normalize(args));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosstest_core::{StepDefinition, TestOptions, test_fn};

    #[test]
    fn test_step_names() {
        assert_eq!(step_name("node"), "Node");
        assert_eq!(step_name("bun"), "Bun");
        assert_eq!(step_name("Deno"), "Deno");
        assert_eq!(step_name(""), "");
    }

    #[tokio::test]
    async fn test_in_process_runtime_runs_body_as_step() {
        let mut host = CrossTestHost::new("suite.rs").with_in_process("native");
        host.test(
            "nested",
            test_fn(|t| async move {
                assert_eq!(t.runtime(), "native");
                t.step(StepDefinition::new("inner", |_| async { Ok(()) })).await?;
                Ok(())
            }),
        );

        let suite = host.run().await;

        insta::assert_snapshot!(suite.render(), @r"
        nested ... ok
          Native ... ok
            inner ... ok
        ");
    }

    #[tokio::test]
    async fn test_ignore_and_only() {
        let mut host = CrossTestHost::new("suite.rs").with_in_process("native");
        host.register(("skipped", TestOptions::new().ignored(true), test_fn(|_| async { Ok(()) })).into());
        host.register(("focused", TestOptions::new().only(true), test_fn(|_| async { Ok(()) })).into());
        host.register(("ignored", TestOptions::new().ignored(true).only(true), test_fn(|_| async { Ok(()) })).into());
        host.test("unfocused", test_fn(|_| async { Ok(()) }));

        let suite = host.run().await;

        assert_eq!(suite.filtered, 2);
        assert_eq!(suite.passed(), 1);
        assert_eq!(suite.ignored(), 1);
        assert!(suite.test("focused").is_some());
        assert!(suite.test("unfocused").is_none());
    }

    #[tokio::test]
    async fn test_failure_is_reported_on_the_runtime_step() {
        let mut host = CrossTestHost::new("suite.rs").with_in_process("native");
        host.test(
            "fails",
            test_fn(|_| async { Err(Thrown::error("AssertionError", "1 != 2")) }),
        );

        let suite = host.run().await;

        let test = suite.test("fails").unwrap();
        let native = test.find(&["Native"]).unwrap();
        assert_eq!(native.error().map(|e| e.name.as_str()), Some("AssertionError"));
        assert_eq!(test.error().map(|e| e.message.as_str()), Some("1 nested step(s) failed"));
        assert!(!suite.is_success());
    }

    #[tokio::test]
    async fn test_anonymous_tests_are_named_by_position() {
        let mut host = CrossTestHost::new("suite.rs").with_in_process("native");
        host.register(test_fn(|_| async { Ok(()) }).into());
        let suite = host.run().await;
        assert_eq!(suite.tests[0].name, "test #0");
    }

    #[test]
    fn test_from_config_builds_every_runtime() {
        let config = CrossTestConfig::new().with_runtime(crate::config::RuntimeSpec::process(
            "node",
            vec!["node".to_string()],
        ));
        let artifacts = Arc::new(ArtifactCache::from_config(&config));
        let host = CrossTestHost::from_config("suite.rs", &config, artifacts);
        assert_eq!(host.runtimes(), vec!["native", "node"]);
    }
}
