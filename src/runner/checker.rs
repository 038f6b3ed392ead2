//! Checker call shapes.

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::mutant::{Mutant, MutantId};
use crate::worker::value::ErrorValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckStatus {
    Passed,
    CompileError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckResult {
    pub fn passed() -> Self {
        Self {
            status: CheckStatus::Passed,
            reason: None,
        }
    }

    pub fn compile_error(reason: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::CompileError,
            reason: Some(reason.into()),
        }
    }
}

/// Verdicts of a `check` call, keyed by mutant.
pub type CheckResults = BTreeMap<MutantId, CheckResult>;

/// A static checker hosted inside a worker process.
pub trait Checker: Send + Sync + 'static {
    fn check(
        &self,
        mutants: Vec<Mutant>,
    ) -> impl Future<Output = Result<CheckResults, ErrorValue>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_wire_shape() {
        let results = CheckResults::from([
            ("1".to_string(), CheckResult::passed()),
            ("2".to_string(), CheckResult::compile_error("TS2322")),
        ]);
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["1"]["status"], "passed");
        assert!(json["1"].get("reason").is_none());
        assert_eq!(json["2"]["status"], "compileError");
        assert_eq!(json["2"]["reason"], "TS2322");
    }
}
