pub mod clang;
pub mod lcov;
pub mod libfuzzer;

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use eyre::Result;

use crate::coverage::Coverage;

/// Compiles a harness source into a runnable fuzzer.
pub trait Compiler {
    /// Compile `srcfile`, emitting the executable and its artifacts into
    /// `workdir`. A non-zero compiler exit is an error carrying the
    /// compiler's stderr.
    fn compile(&self, srcfile: &Path, workdir: &Path) -> Result<Box<dyn Fuzzer>>;
}

/// Options for a single fuzzer run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub corpus_dir: Option<PathBuf>,
    pub fuzzdict: Option<PathBuf>,
    /// Block until the process exits when true; otherwise spawn and return.
    pub wait_until_done: bool,
    /// Wall-clock bound in seconds.
    pub timeout: Option<f64>,
    /// `-runs=N`; unbounded when absent.
    pub runs: Option<u64>,
}

/// Options for a parallel batch of single-corpus runs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub fuzzdict: Option<PathBuf>,
    pub timeout: Option<f64>,
    pub runs: Option<u64>,
    pub return_cov: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: num_cpus::get(),
            fuzzdict: None,
            timeout: None,
            runs: Some(1),
            return_cov: false,
        }
    }
}

/// Result of one batch worker. A failed worker reports an error tuple and
/// never aborts the remainder of the batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub corpus_dir: PathBuf,
    pub result: Result<i32, String>,
    /// `(library, harness-self)` coverage when requested and collectable.
    pub coverage: Option<(Coverage, Coverage)>,
}

/// Which part of the instrumented binary a coverage query concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovScope {
    /// The target library linked into the harness.
    Library,
    /// The harness source itself.
    Harness,
}

/// Abstract contract over a coverage-instrumented fuzzer process.
///
/// Implementations own their child process; `halt`/`clear` must reap it so
/// an aborting caller leaves no orphans behind.
pub trait Fuzzer {
    /// Best-effort corpus minimization; `None` when minimization failed.
    fn minimize(&self, corpus_dir: &Path, outdir: Option<&Path>) -> Result<Option<PathBuf>>;

    /// Launch (or complete) one run. Returns the exit code when
    /// `wait_until_done`, `None` when the process was left running.
    fn run(&mut self, config: &RunConfig) -> Result<Option<i32>>;

    /// `None` while running, the exit code once done, an error past the
    /// deadline (the process is killed first).
    fn poll(&mut self) -> Result<Option<i32>>;

    /// Kill and reap the background process, if any.
    fn halt(&mut self) -> Result<()>;

    /// Drop all run state; the fuzzer can be started afresh afterwards.
    fn clear(&mut self) -> Result<()>;

    /// Best-effort scalar of the current coverage from the run log.
    fn track(&self) -> u64;

    /// Finalized coverage of the last run from profile data.
    fn coverage(&self, scope: CovScope, profile: Option<&Path>) -> Result<Coverage>;

    /// Run each corpus directory once in parallel, each worker in a private
    /// working directory with a private profile file. Outcomes arrive on the
    /// returned channel as workers finish, in no particular order.
    fn batch_run(
        &self,
        corpus_dirs: Vec<PathBuf>,
        config: &BatchConfig,
    ) -> Result<Receiver<BatchOutcome>>;
}
