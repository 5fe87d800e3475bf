use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{AstParser, CriticalPath};
use crate::config::Config;
use crate::coverage::Coverage;
use crate::execution::{BatchConfig, Compiler, Fuzzer, RunConfig};
use crate::gadget::ApiGadget;
use crate::journal::Journal;

/// Which failure bucket a validation error belongs to; rendered into counter
/// and directory names (`failure_parse`, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::AsRefStr, strum_macros::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Agent,
    Parse,
    Compile,
    Fuzzer,
    Coverage,
    CriticalPath,
}

/// Per-step hit label of an annotated critical path, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum HitLabel {
    Hit,
    Miss,
    InvalidLineno,
    InvalidFilename,
}

pub type AnnotatedPath = Vec<(String, Option<u32>, HitLabel)>;

/// A failed validation. Every variant is a value the controller dispatches
/// on; nothing here is a panic path.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("ParseError: {description}")]
    Parse { response: String, description: String },
    #[error("CompileError:\n{stderr}")]
    Compile {
        path: PathBuf,
        stderr: String,
        trace: String,
    },
    #[error("FuzzerError: {exception}")]
    Fuzzer { exception: String, trace: String },
    #[error("CoverageNotGrow: local {cov_local:.4}, global {cov_global:.4}")]
    CoverageNotGrow { cov_global: f64, cov_local: f64 },
    #[error("CriticalPathNotHit:\n{}", render_paths(.critical_paths))]
    CriticalPathNotHit { critical_paths: Vec<AnnotatedPath> },
}

fn render_paths(paths: &[AnnotatedPath]) -> String {
    paths
        .iter()
        .map(|path| {
            let steps = path
                .iter()
                .map(|(name, _, label)| format!("{name}({label})"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("- [{steps}]")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ValidationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Parse { .. } => FailureKind::Parse,
            Self::Compile { .. } => FailureKind::Compile,
            Self::Fuzzer { .. } => FailureKind::Fuzzer,
            Self::CoverageNotGrow { .. } => FailureKind::Coverage,
            Self::CriticalPathNotHit { .. } => FailureKind::CriticalPath,
        }
    }
}

/// A harness that passed all six validation stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success {
    /// The harness source inside the trial working directory.
    pub path: PathBuf,
    /// Library coverage of the run.
    pub cov_lib: Coverage,
    /// Harness-self coverage of the run.
    pub cov_fuzz: Coverage,
    /// Critical paths every line of which was hit; never empty.
    pub validated_paths: Vec<CriticalPath>,
}

/// Validation verdict: every failure is a value.
pub type Verdict = std::result::Result<Success, ValidationError>;

/// Six-stage harness validation pipeline:
/// parse, compile, fuzzer run, coverage collection, coverage growth,
/// critical-path hit. Each stage short-circuits on failure.
pub struct HarnessValidator<'e> {
    compiler: &'e dyn Compiler,
    parser: &'e dyn AstParser,
    apis: Vec<ApiGadget>,
    ext: String,
    timeout: f64,
    timeout_unit: f64,
    journal: Option<Journal>,
}

impl<'e> HarnessValidator<'e> {
    pub fn new(
        compiler: &'e dyn Compiler,
        parser: &'e dyn AstParser,
        apis: Vec<ApiGadget>,
        config: &Config,
    ) -> Self {
        Self {
            compiler,
            parser,
            apis,
            ext: config.ext.clone(),
            timeout: config.timeout,
            timeout_unit: config.timeout_unit,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn journal(&self, msg: impl AsRef<str>) {
        if let Some(journal) = &self.journal {
            journal.log(msg);
        }
    }

    /// Validate an LLM response against the global coverage.
    ///
    /// Hard environment faults (unwritable workdir, broken analyzer) surface
    /// as `Err`; everything a bad harness can cause comes back as a
    /// [`Verdict`].
    pub fn validate(
        &self,
        response: &str,
        global_cov: &Coverage,
        workdir: &Path,
        corpus_dir: &Path,
        fuzzdict: Option<&Path>,
        batch_size: Option<usize>,
    ) -> Result<Verdict> {
        // 1. parse the code segment
        let (_lang, code) = match check_code_segment(response) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(Err(err)),
        };
        std::fs::create_dir_all(workdir)
            .with_context(|| format!("cannot create the working directory {workdir:?}"))?;
        let filename = format!("source.{}", self.ext);
        let path = workdir.join(filename.trim_end_matches('.'));
        std::fs::write(&path, &code)
            .with_context(|| format!("cannot write the harness source {path:?}"))?;
        // absolute path so it matches the profile data
        let path = path.canonicalize().unwrap_or(path);
        self.journal(format!("Success to parse the code: {path:?}."));

        // 2. compilability
        let mut fuzzer = match self.compiler.compile(&path, workdir) {
            Ok(fuzzer) => fuzzer,
            Err(err) => {
                return Ok(Err(ValidationError::Compile {
                    path,
                    stderr: format!("{err:#}"),
                    trace: format!("{err:?}"),
                }))
            }
        };
        self.journal(format!("Success to compile the code: {path:?}."));

        // 3. fuzzer run
        let start = std::time::Instant::now();
        if let Some(err) = self.check_fuzzer_run(fuzzer.as_mut(), corpus_dir, fuzzdict) {
            return Ok(Err(err));
        }
        self.journal(format!(
            "Success to run the fuzzer({:.2}s).",
            start.elapsed().as_secs_f64()
        ));

        // 4. collect coverage
        let start = std::time::Instant::now();
        let (cov_lib, cov_fuzz) =
            self.collect_coverage(fuzzer.as_mut(), corpus_dir, fuzzdict, workdir, batch_size)?;
        self.journal(format!(
            "Success to collect the coverage({:.2}s, lib: {:.2}%, fuzzer: {:.2}%).",
            start.elapsed().as_secs_f64(),
            cov_lib.coverage_branch() * 100.0,
            cov_fuzz.coverage_branch() * 100.0,
        ));

        // 5. coverage growth
        if let Some(err) = check_cov_growth(global_cov, &cov_lib) {
            return Ok(Err(err));
        }
        self.journal("Coverage was grown while last fuzzer run.");

        // 6. critical path hit
        let validated_paths = match self.check_critical_path_hit(&path, &cov_fuzz)? {
            Ok(paths) => paths,
            Err(err) => return Ok(Err(err)),
        };
        self.journal("Fully covered critical path found.");

        Ok(Ok(Success {
            path,
            cov_lib,
            cov_fuzz,
            validated_paths,
        }))
    }

    /// Stage 3: launch non-blocking, poll at `timeout_unit` intervals, stop
    /// as soon as the tracked coverage counter stalls.
    fn check_fuzzer_run(
        &self,
        fuzzer: &mut dyn Fuzzer,
        corpus_dir: &Path,
        fuzzdict: Option<&Path>,
    ) -> Option<ValidationError> {
        let config = RunConfig {
            corpus_dir: Some(corpus_dir.to_path_buf()),
            fuzzdict: fuzzdict.map(Path::to_path_buf),
            wait_until_done: false,
            timeout: Some(self.timeout),
            runs: None,
        };
        if let Err(err) = fuzzer.run(&config) {
            return Some(ValidationError::Fuzzer {
                exception: format!("{err:#}"),
                trace: format!("{err:?}"),
            });
        }
        let interval = Duration::from_secs_f64(self.timeout_unit);
        std::thread::sleep(interval);
        let mut last = 0;
        loop {
            match fuzzer.poll() {
                Ok(None) => {
                    let current = fuzzer.track();
                    if last >= current {
                        break;
                    }
                    last = current;
                    std::thread::sleep(interval);
                }
                // done, or past the deadline (the driver killed it already)
                Ok(Some(_)) | Err(_) => break,
            }
        }
        if let Err(err) = fuzzer.halt() {
            return Some(ValidationError::Fuzzer {
                exception: format!("{err:#}"),
                trace: format!("{err:?}"),
            });
        }
        None
    }

    /// Stage 4: minimize the corpus, then replay each remaining unit in its
    /// own working directory, in parallel, and merge the per-unit coverages.
    fn collect_coverage(
        &self,
        fuzzer: &mut dyn Fuzzer,
        corpus_dir: &Path,
        fuzzdict: Option<&Path>,
        workdir: &Path,
        batch_size: Option<usize>,
    ) -> Result<(Coverage, Coverage)> {
        if let Some(minimized) = fuzzer.minimize(corpus_dir, None)? {
            std::fs::remove_dir_all(corpus_dir)?;
            std::fs::rename(&minimized, corpus_dir)
                .with_context(|| format!("cannot move {minimized:?} over {corpus_dir:?}"))?;
        }

        let covdir = workdir.join("cov");
        let mut worker_dirs = Vec::new();
        for entry in std::fs::read_dir(corpus_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let worker_dir = covdir.join(entry.file_name());
            std::fs::create_dir_all(&worker_dir)?;
            std::fs::copy(entry.path(), worker_dir.join("CORPORA"))?;
            worker_dirs.push(worker_dir);
        }

        let config = BatchConfig {
            batch_size: batch_size.unwrap_or_else(num_cpus::get),
            fuzzdict: fuzzdict.map(Path::to_path_buf),
            timeout: None,
            runs: Some(1),
            return_cov: true,
        };
        let (mut cov_lib, mut cov_fuzz) = (Coverage::new(), Coverage::new());
        for outcome in fuzzer.batch_run(worker_dirs, &config)? {
            match outcome.coverage {
                Some((lib, fuzz)) => {
                    cov_lib.merge(&lib);
                    cov_fuzz.merge(&fuzz);
                }
                None => self.journal(format!(
                    "Failed to run the corpora {:?}: {:?}",
                    outcome.corpus_dir, outcome.result
                )),
            }
        }
        Ok((cov_lib, cov_fuzz))
    }

    /// Stage 6: a path is validated iff every step with a known lineno is
    /// hit in the harness-self line coverage.
    fn check_critical_path_hit(
        &self,
        path: &Path,
        cov: &Coverage,
    ) -> Result<std::result::Result<Vec<CriticalPath>, ValidationError>> {
        let critical_paths = self.parser.extract_critical_path(path, &self.apis, None)?;
        let validated: Vec<CriticalPath> = critical_paths
            .iter()
            .filter(|critical_path| {
                critical_path.iter().all(|(_, lineno)| match lineno {
                    Some(lineno) => cov.cover_lines(path, *lineno) == Some(true),
                    None => true,
                })
            })
            .cloned()
            .collect();
        if !validated.is_empty() {
            return Ok(Ok(validated));
        }
        let annotated = critical_paths
            .into_iter()
            .map(|critical_path| {
                critical_path
                    .into_iter()
                    .map(|(name, lineno)| {
                        let label = match lineno {
                            None => HitLabel::InvalidLineno,
                            Some(lineno) => match cov.cover_lines(path, lineno) {
                                None => HitLabel::InvalidFilename,
                                Some(true) => HitLabel::Hit,
                                Some(false) => HitLabel::Miss,
                            },
                        };
                        (name, lineno, label)
                    })
                    .collect()
            })
            .collect();
        Ok(Err(ValidationError::CriticalPathNotHit {
            critical_paths: annotated,
        }))
    }
}

/// Stage 1: extract the first triple-backtick code block, stripping an
/// optional language tag on the opening line.
pub fn check_code_segment(
    response: &str,
) -> std::result::Result<(Option<String>, String), ValidationError> {
    let Some(open) = response.find("```") else {
        return Err(ValidationError::Parse {
            response: response.to_string(),
            description: "cannot find a ```".to_string(),
        });
    };
    let rest = &response[open + 3..];
    let Some(close) = rest.find("```") else {
        return Err(ValidationError::Parse {
            response: response.to_string(),
            description: "cannot find a pair of ```".to_string(),
        });
    };
    let block = &rest[..close];
    let (lang, code) = match block.split_once('\n') {
        Some((first, code)) => (first.trim(), code.to_string()),
        None => (block.trim(), String::new()),
    };
    let lang = (!lang.is_empty()).then(|| lang.to_string());
    Ok((lang, code))
}

/// Stage 5: at least one nonzero branch outside the global coverage.
pub fn check_cov_growth(global: &Coverage, local: &Coverage) -> Option<ValidationError> {
    let fresh: HashSet<(String, String)> = local.flat(true).into_keys().collect();
    let known: HashSet<(String, String)> = global.flat(true).into_keys().collect();
    if fresh.difference(&known).next().is_some() {
        return None;
    }
    Some(ValidationError::CoverageNotGrow {
        cov_global: global.coverage_branch(),
        cov_local: local.coverage_branch(),
    })
}
