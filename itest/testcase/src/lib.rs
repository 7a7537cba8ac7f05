// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::panic::{catch_unwind, AssertUnwindSafe};

pub use anyhow::{Context, Result};
pub use inventory::submit as inventory_submit;
pub use itest_framework;
pub use itest_testcase_macros::*;
use thiserror::Error;

pub use itest_framework::Framework;
pub use itest_framework::FrameworkParameters;

/// Raised by `itest_skip!`. [`TestOutcome::from_result`] looks for it under
/// any added context.
#[derive(Debug, Error)]
pub enum TestSkippedError {
    #[error("test skipped: {0:?}")]
    TestSkipped(Option<String>),
}

/// Ends the current test case with a skipped outcome. Accepts an optional
/// message in `format!` syntax.
#[macro_export]
macro_rules! itest_skip {
    () => {
        return Err($crate::TestSkippedError::TestSkipped(None).into())
    };
    ($($arg:tt)+) => {
        return Err($crate::TestSkippedError::TestSkipped(Some(format!($($arg)+)))
            .into())
    };
}

/// How a single test case ended.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestOutcome {
    Passed,

    /// Carries the error chain and backtrace, or the panic message.
    Failed(Option<String>),

    /// The test bailed out with `itest_skip!`, typically because the host
    /// lacks something it needs (a helper binary, an architecture).
    Skipped(Option<String>),
}

impl TestOutcome {
    /// Converts the result of a test body into an outcome. A
    /// [`TestSkippedError`] anywhere in the error is a skip; any other error is
    /// a failure.
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => TestOutcome::Passed,
            Err(e) => match e.downcast_ref::<TestSkippedError>() {
                Some(TestSkippedError::TestSkipped(msg)) => {
                    TestOutcome::Skipped(msg.clone())
                }
                None => TestOutcome::Failed(Some(format!(
                    "{e:#}\n    error backtrace: {}",
                    e.backtrace()
                ))),
            },
        }
    }
}

/// Holds a test entry point so [`TestCase::new`] can stay `const`.
pub struct TestFunction {
    pub f: fn(&Framework) -> TestOutcome,
}

/// One registered test. `#[itest_testcase]` fills `module_path` from
/// `module_path!()` at the definition site and `name` from the function name.
pub struct TestCase {
    pub(crate) module_path: &'static str,
    pub(crate) name: &'static str,
    pub(crate) function: TestFunction,
}

impl TestCase {
    pub const fn new(
        module_path: &'static str,
        name: &'static str,
        function: TestFunction,
    ) -> Self {
        Self { module_path, name, function }
    }

    /// `module_path::name`, which is what filters match against.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }

    /// Runs the test case's body with the supplied framework and returns its
    /// outcome. A panicking test body fails the test instead of unwinding
    /// into the caller.
    pub fn run(&self, ctx: &Framework) -> TestOutcome {
        match catch_unwind(AssertUnwindSafe(|| (self.function.f)(ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "[non-string panic payload]".to_string());
                TestOutcome::Failed(Some(format!("test panicked: {msg}")))
            }
        }
    }
}

inventory::collect!(TestCase);

pub fn all_test_cases() -> impl Iterator<Item = &'static TestCase> {
    inventory::iter::<TestCase>.into_iter()
}

/// Registered tests whose qualified name contains every `include` pattern and
/// none of the `exclude` patterns.
pub fn filtered_test_cases<'a>(
    include: &'a [String],
    exclude: &'a [String],
) -> impl Iterator<Item = &'static TestCase> + 'a {
    all_test_cases().filter(move |tc| {
        let name = tc.fully_qualified_name();
        include.iter().all(|pat| name.contains(pat.as_str()))
            && !exclude.iter().any(|pat| name.contains(pat.as_str()))
    })
}
