//! Subjects hosted inside worker processes.
//!
//! A subject is the object a [`WorkerProxy`](super::proxy::WorkerProxy) makes
//! callable from the parent: it receives a method name plus wire arguments and
//! answers with a wire value or a rehydratable error. Subjects are created by
//! name from a closed registry when the worker receives `Init`.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::value::{ErrorValue, Value};
use crate::config::FIXTURE_TEST_RUNNER;
use crate::runner::checker::Checker;
use crate::runner::fixture::{FixtureChecker, FixtureTestRunner};
use crate::runner::test_runner::TestRunner;

/// Name of the built-in scripted checker.
pub const FIXTURE_CHECKER: &str = "fixture-checker";

/// Every plugin name the registry knows.
pub const PLUGINS: &[&str] = &[FIXTURE_TEST_RUNNER, FIXTURE_CHECKER];

pub type SubjectFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ErrorValue>> + Send + 'a>>;

/// Object invoked by method name from the parent process.
pub trait Subject: Send + Sync {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<Value>) -> SubjectFuture<'a>;
}

/// Construct the subject registered under `plugin`.
pub fn create_subject(plugin: &str, options: Value) -> Result<Box<dyn Subject>, ErrorValue> {
    match plugin {
        FIXTURE_TEST_RUNNER => Ok(Box::new(TestRunnerSubject(FixtureTestRunner::new(options)?))),
        FIXTURE_CHECKER => Ok(Box::new(CheckerSubject(FixtureChecker::new(options)?))),
        other => Err(ErrorValue::new(
            "PluginError",
            format!(
                "Unknown plugin '{}'. Registered plugins: {}",
                other,
                PLUGINS.join(", ")
            ),
        )),
    }
}

/// Exposes a [`TestRunner`] as `dryRun` / `mutantRun`.
pub struct TestRunnerSubject<R>(pub R);

impl<R: TestRunner> Subject for TestRunnerSubject<R> {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<Value>) -> SubjectFuture<'a> {
        Box::pin(async move {
            match method {
                "dryRun" => encode(self.0.dry_run(single_arg(method, args)?).await?),
                "mutantRun" => encode(self.0.mutant_run(single_arg(method, args)?).await?),
                other => Err(unknown_method(other)),
            }
        })
    }
}

/// Exposes a [`Checker`] as `check`.
pub struct CheckerSubject<C>(pub C);

impl<C: Checker> Subject for CheckerSubject<C> {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<Value>) -> SubjectFuture<'a> {
        Box::pin(async move {
            match method {
                "check" => encode(self.0.check(single_arg(method, args)?).await?),
                other => Err(unknown_method(other)),
            }
        })
    }
}

fn single_arg<T: DeserializeOwned>(method: &str, args: Vec<Value>) -> Result<T, ErrorValue> {
    let arg = args.into_iter().next().ok_or_else(|| {
        ErrorValue::new("TypeError", format!("{} expects one argument", method))
    })?;
    arg.decode().map_err(|e| {
        ErrorValue::new("TypeError", format!("Invalid argument for {}: {}", method, e))
    })
}

fn encode<T: Serialize>(value: T) -> Result<Value, ErrorValue> {
    Value::encode(&value).map_err(|e| ErrorValue::from_error(&e))
}

fn unknown_method(method: &str) -> ErrorValue {
    ErrorValue::new("TypeError", format!("Unknown method '{}'", method))
}
