// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use itest_tests::itest_testcase::{Framework, TestCase, TestOutcome};
use tracing::{error, info, warn};

use crate::config::RunOptions;

/// Tallies for one pass over the selected tests.
pub struct ExecutionStats {
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,

    /// Selected tests that never started because the run was interrupted.
    pub tests_not_run: u32,

    /// Wall-clock time from the first test's start to the last test's end.
    pub duration: Duration,

    pub failed_test_cases: Vec<&'static TestCase>,
}

impl ExecutionStats {
    fn new(selected: usize) -> Self {
        Self {
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            tests_not_run: selected as u32,
            duration: Duration::default(),
            failed_test_cases: Vec::new(),
        }
    }

    /// Prints the failing test names and a one-line summary to stdout in the
    /// same shape `cargo test` uses.
    pub fn print_summary(&self) {
        if !self.failed_test_cases.is_empty() {
            println!("\nfailures:");
            self.failed_test_cases
                .iter()
                .for_each(|tc| println!("    {}", tc.fully_qualified_name()));
            println!();
        }

        let verdict = if self.tests_failed == 0 { "ok" } else { "FAILED" };
        println!(
            "test result: {verdict}. {} passed; {} failed; {} skipped; \
            {} not run; finished in {:.2}s\n",
            self.tests_passed,
            self.tests_failed,
            self.tests_skipped,
            self.tests_not_run,
            self.duration.as_secs_f64()
        );
    }

    fn record(&mut self, tc: &'static TestCase, outcome: &TestOutcome) {
        self.tests_not_run -= 1;
        match outcome {
            TestOutcome::Passed => self.tests_passed += 1,
            TestOutcome::Failed(_) => {
                self.tests_failed += 1;
                self.failed_test_cases.push(tc);
            }
            TestOutcome::Skipped(_) => self.tests_skipped += 1,
        }
    }
}

/// Executes the tests selected by `run_opts`, one at a time, against `ctx`.
pub fn run_tests_with_ctx(
    ctx: &Framework,
    run_opts: &RunOptions,
) -> ExecutionStats {
    let executions: Vec<&'static TestCase> = run_opts.filters.select().collect();

    let interrupted = set_sigint_handler();
    run_selected(ctx, &executions, &interrupted)
}

fn run_selected(
    ctx: &Framework,
    executions: &[&'static TestCase],
    interrupted: &AtomicBool,
) -> ExecutionStats {
    let mut stats = ExecutionStats::new(executions.len());
    if executions.is_empty() {
        info!("No tests selected for execution");
        return stats;
    }

    info!("Running {} test(s)", executions.len());
    let start_time = Instant::now();
    for &tc in executions {
        // Tests are only interrupted between cases, since VMs belonging to
        // the running test are cleaned up when it returns.
        if interrupted.load(Ordering::SeqCst) {
            info!("Test run interrupted by SIGINT");
            break;
        }

        info!("Starting test {}", tc.fully_qualified_name());
        ctx.reset();
        let test_outcome = tc.run(ctx);

        info!(
            "test {} ... {}{}",
            tc.fully_qualified_name(),
            match test_outcome {
                TestOutcome::Passed => "ok",
                TestOutcome::Failed(_) => "FAILED: ",
                TestOutcome::Skipped(_) => "skipped: ",
            },
            match &test_outcome {
                TestOutcome::Failed(Some(s)) | TestOutcome::Skipped(Some(s)) =>
                    s.as_str(),
                TestOutcome::Failed(None) | TestOutcome::Skipped(None) =>
                    "[no message]",
                _ => "",
            }
        );

        stats.record(tc, &test_outcome);
    }

    stats.duration = start_time.elapsed();
    stats
}

/// Installs a SIGINT handler and returns the flag it raises. A second SIGINT
/// exits immediately.
fn set_sigint_handler() -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let mut fired = false;
    let res = ctrlc::set_handler(move || {
        // 130 is the customary exit code for SIGINT (128 + SIGINT). VMs
        // belonging to the running test are not cleaned up.
        if fired {
            error!("SIGINT received while shutting down, rudely terminating");
            error!("some processes and resources may have been leaked!");
            std::process::exit(130);
        }

        warn!("SIGINT received, stopping after the current test");
        fired = true;
        flag.store(true, Ordering::SeqCst);
    });

    if let Err(e) = res {
        warn!(error = %e, "failed to install SIGINT handler");
    }

    interrupted
}
