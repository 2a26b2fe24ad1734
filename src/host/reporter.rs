//! Progress and summary output (pytest-style).
//!
//! The registrar reports through the [`TestReporter`] trait so the output format can be swapped
//! (quiet for tests, ANSI console for the terminal).

use super::report::{StepOutcome, StepReport, SuiteReport};

/// Trait for reporting test execution results.
pub trait TestReporter {
    /// Called once before the first test of a file runs
    fn on_file_start(&mut self, _file: &str, _test_count: usize) {}

    /// Called when a test begins
    fn on_test_start(&mut self, _name: &str) {}

    /// Called when a test (including all its runtimes) has settled
    fn on_test_complete(&mut self, report: &StepReport);

    /// Called when every test of the file has settled
    fn on_run_complete(&mut self, suite: &SuiteReport);
}

/// Reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl TestReporter for SilentReporter {
    fn on_test_complete(&mut self, _report: &StepReport) {}

    fn on_run_complete(&mut self, _suite: &SuiteReport) {}
}

/// Default console reporter
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    pub verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

fn status(outcome: &StepOutcome, verbose: bool) -> &'static str {
    match (outcome, verbose) {
        (StepOutcome::Passed, true) => "\x1b[32mPASSED\x1b[0m",
        (StepOutcome::Passed, false) => "\x1b[32m.\x1b[0m",
        (StepOutcome::Failed(_), true) => "\x1b[31mFAILED\x1b[0m",
        (StepOutcome::Failed(_), false) => "\x1b[31mF\x1b[0m",
        (StepOutcome::Ignored, true) => "\x1b[33mIGNORED\x1b[0m",
        (StepOutcome::Ignored, false) => "\x1b[33ms\x1b[0m",
        (StepOutcome::Running, _) => "\x1b[33m?\x1b[0m",
    }
}

/// The `N passed, M failed` summary, without colors.
pub fn summary_line(suite: &SuiteReport) -> String {
    let mut parts = Vec::new();
    if suite.passed() > 0 {
        parts.push(format!("{} passed", suite.passed()));
    }
    if suite.failed() > 0 {
        parts.push(format!("{} failed", suite.failed()));
    }
    if suite.ignored() > 0 {
        parts.push(format!("{} ignored", suite.ignored()));
    }
    if suite.filtered > 0 {
        parts.push(format!("{} filtered out", suite.filtered));
    }
    if parts.is_empty() {
        parts.push("no tests ran".to_string());
    }
    parts.join(", ")
}

impl TestReporter for ConsoleReporter {
    fn on_file_start(&mut self, file: &str, test_count: usize) {
        eprintln!("\x1b[1m=================== {file} ===================\x1b[0m");
        eprintln!("collected {test_count} item(s)");
    }

    fn on_test_start(&mut self, name: &str) {
        if self.verbose {
            eprint!("{name} ... ");
        }
    }

    fn on_test_complete(&mut self, report: &StepReport) {
        let status = status(&report.outcome, self.verbose);
        if self.verbose {
            eprintln!("{} ({}ms)", status, report.duration.as_millis());
        } else {
            eprint!("{status}");
        }
    }

    fn on_run_complete(&mut self, suite: &SuiteReport) {
        if !self.verbose {
            eprintln!();
        }

        let failed: Vec<&StepReport> = suite.tests.iter().filter(|t| t.outcome.is_failed()).collect();
        if !failed.is_empty() {
            eprintln!();
            eprintln!("\x1b[1;31m=================== FAILURES ===================\x1b[0m");
            for test in failed {
                eprintln!();
                eprintln!("\x1b[1m___________ {} ___________\x1b[0m", test.name);
                eprint!("{}", test.render());
                for (path, error) in test.failures() {
                    eprintln!();
                    eprintln!("    {path}");
                    eprintln!("    \x1b[31m{error}\x1b[0m");
                    if let Some(stack) = &error.stack {
                        for line in stack.lines() {
                            eprintln!("      {line}");
                        }
                    }
                }
            }
        }

        let color = if suite.is_success() { "\x1b[1;32m" } else { "\x1b[1;31m" };
        eprintln!();
        eprintln!(
            "{color}====== {} in {:.2}s ======\x1b[0m",
            summary_line(suite),
            suite.duration.as_secs_f64()
        );
    }
}
