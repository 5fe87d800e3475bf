use serde::{Deserialize, Serialize};

use crate::coverage::Coverage;
use crate::mutation::ApiMutator;
use crate::validate::FailureKind;

/// Counters of the outer loop. All counts are monotonically non-decreasing
/// over a run.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial: u64,
    pub failure_agent: u64,
    pub failure_parse: u64,
    pub failure_compile: u64,
    pub failure_fuzzer: u64,
    pub failure_coverage: u64,
    pub failure_critical_path: u64,
    pub success: u64,
    pub llm_call: u64,
    pub converged: bool,
    /// Accumulated spend in USD.
    pub cost: f64,
}

impl Trial {
    pub fn count_failure(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Agent => self.failure_agent += 1,
            FailureKind::Parse => self.failure_parse += 1,
            FailureKind::Compile => self.failure_compile += 1,
            FailureKind::Fuzzer => self.failure_fuzzer += 1,
            FailureKind::Coverage => self.failure_coverage += 1,
            FailureKind::CriticalPath => self.failure_critical_path += 1,
        }
    }
}

/// The three coverage views the controller maintains.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covered {
    /// Union of library coverage across all accepted harnesses.
    #[serde(rename = "global")]
    pub global_: Coverage,
    /// APIs ever rendered into a prompt.
    pub prompted: Coverage,
    /// APIs whose code actually executed in an accepted harness.
    pub executed: Coverage,
}

/// The only process-wide state: persisted every trial, restored on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub trial: Trial,
    pub covered: Covered,
    pub mutator: ApiMutator,
}
