use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use eyre::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use threadpool::ThreadPool;
use wait_timeout::ChildExt;

use crate::config::{EXECUTION_TIMEOUT, MAX_FUZZ_TIME};
use crate::coverage::Coverage;
use crate::execution::lcov::coverage_from_lcov;
use crate::execution::{BatchConfig, BatchOutcome, CovScope, Fuzzer, RunConfig};

/// `cov: N` from the libFuzzer status lines on stderr.
static COV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\d+\s+(?:INITED|NEW|REDUCE|pulse|DONE).*\bcov: (\d+)").unwrap());

/// libFuzzer process wrapper over one compiled harness.
pub struct LibFuzzer {
    executable: PathBuf,
    workdir: PathBuf,
    srcfile: PathBuf,
    logfile: PathBuf,
    profraw: PathBuf,
    child: Option<Child>,
    deadline: Option<Instant>,
}

impl LibFuzzer {
    pub fn new(executable: &Path, workdir: &Path, srcfile: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            workdir: workdir.to_path_buf(),
            srcfile: srcfile.to_path_buf(),
            logfile: workdir.join("fuzzer.log"),
            profraw: workdir.join("default.profraw"),
            child: None,
            deadline: None,
        }
    }

    fn is_harness_file(srcfile: &Path, file: &Path) -> bool {
        file == srcfile || (file.file_name().is_some() && file.file_name() == srcfile.file_name())
    }

    /// Convert raw profile data into a [`Coverage`] through
    /// `llvm-profdata`/`llvm-cov`.
    fn export_coverage(
        executable: &Path,
        srcfile: &Path,
        profraw: &Path,
        scope: CovScope,
    ) -> Result<Coverage> {
        if !profraw.exists() {
            bail!("no profile data at {profraw:?}; did the fuzzer run?");
        }
        let profdata = profraw.with_extension("profdata");
        let merge = Command::new("llvm-profdata")
            .arg("merge")
            .arg("-sparse")
            .arg(profraw)
            .arg("-o")
            .arg(&profdata)
            .output()
            .context("failed to spawn llvm-profdata")?;
        if !merge.status.success() {
            bail!(
                "llvm-profdata returned non-zero exit status:\n{}",
                String::from_utf8_lossy(&merge.stderr)
            );
        }
        let export = Command::new("llvm-cov")
            .arg("export")
            .arg(executable)
            .arg(format!("-instr-profile={}", profdata.display()))
            .arg("-format=lcov")
            .output()
            .context("failed to spawn llvm-cov")?;
        if !export.status.success() {
            bail!(
                "llvm-cov returned non-zero exit status:\n{}",
                String::from_utf8_lossy(&export.stderr)
            );
        }
        let tracefile = profraw.with_extension("lcov");
        std::fs::write(&tracefile, &export.stdout)
            .with_context(|| format!("cannot write the tracefile {tracefile:?}"))?;

        let srcfile = srcfile.to_path_buf();
        coverage_from_lcov(&tracefile, move |file| match scope {
            CovScope::Harness => Self::is_harness_file(&srcfile, file),
            CovScope::Library => !Self::is_harness_file(&srcfile, file),
        })
    }

    /// Run the fuzzer once over a single corpus unit inside `corpus_dir`,
    /// used by the batch workers. The directory doubles as the private
    /// working directory: log and profile files land next to the input.
    fn run_one(
        executable: PathBuf,
        srcfile: PathBuf,
        corpus_dir: PathBuf,
        config: BatchConfig,
    ) -> Result<BatchOutcome> {
        let profraw = corpus_dir.join("default.profraw");
        let logfile = std::fs::File::create(corpus_dir.join("run.log"))?;

        // explicit input files put libFuzzer into run-and-exit mode; run
        // artifacts all carry extensions, corpus units never do
        let mut inputs: Vec<PathBuf> = std::fs::read_dir(&corpus_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_none())
            .collect();
        inputs.sort();

        let mut cmd = Command::new(&executable);
        cmd.current_dir(&corpus_dir)
            .env("LLVM_PROFILE_FILE", &profraw)
            .stdout(Stdio::null())
            .stderr(logfile);
        if let Some(runs) = config.runs {
            cmd.arg(format!("-runs={runs}"));
        }
        if let Some(dict) = &config.fuzzdict {
            cmd.arg(format!("-dict={}", dict.display()));
        }
        cmd.args(&inputs);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn the fuzzer {executable:?}"))?;
        let timeout = Duration::from_secs_f64(config.timeout.unwrap_or(EXECUTION_TIMEOUT as f64));
        let result = match child.wait_timeout(timeout)? {
            Some(status) => Ok(status.code().unwrap_or(-1)),
            None => {
                child.kill().ok();
                child.wait().ok();
                Err(format!("fuzzer timed out after {timeout:?} on {corpus_dir:?}"))
            }
        };

        let coverage = match (&result, config.return_cov) {
            (Ok(_), true) => Some((
                Self::export_coverage(&executable, &srcfile, &profraw, CovScope::Library)?,
                Self::export_coverage(&executable, &srcfile, &profraw, CovScope::Harness)?,
            )),
            _ => None,
        };
        Ok(BatchOutcome {
            corpus_dir,
            result,
            coverage,
        })
    }
}

impl Fuzzer for LibFuzzer {
    fn minimize(&self, corpus_dir: &Path, outdir: Option<&Path>) -> Result<Option<PathBuf>> {
        let outdir = outdir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| corpus_dir.with_file_name(format!(
                "{}_min",
                corpus_dir.file_name().unwrap_or_default().to_string_lossy()
            )));
        std::fs::create_dir_all(&outdir)?;
        let output = Command::new(&self.executable)
            .current_dir(&self.workdir)
            .arg("-merge=1")
            .arg(&outdir)
            .arg(corpus_dir)
            .output()
            .with_context(|| format!("failed to spawn the fuzzer {:?}", self.executable))?;
        if !output.status.success() {
            log::warn!(
                "corpus minimization failed on {corpus_dir:?}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }
        Ok(Some(outdir))
    }

    fn run(&mut self, config: &RunConfig) -> Result<Option<i32>> {
        if self.child.is_some() {
            bail!("the fuzzer is already running; halt it first");
        }
        let logfile = std::fs::File::create(&self.logfile)?;
        let mut cmd = Command::new(&self.executable);
        cmd.current_dir(&self.workdir)
            .env("LLVM_PROFILE_FILE", &self.profraw)
            .stdout(Stdio::null())
            .stderr(logfile);
        if let Some(corpus) = &config.corpus_dir {
            cmd.arg(corpus);
        }
        if let Some(dict) = &config.fuzzdict {
            cmd.arg(format!("-dict={}", dict.display()));
        }
        if let Some(runs) = config.runs {
            cmd.arg(format!("-runs={runs}"));
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn the fuzzer {:?}", self.executable))?;
        let timeout = Duration::from_secs_f64(config.timeout.unwrap_or(MAX_FUZZ_TIME as f64));
        if config.wait_until_done {
            return match child.wait_timeout(timeout)? {
                Some(status) => Ok(Some(status.code().unwrap_or(-1))),
                None => {
                    child.kill().ok();
                    child.wait().ok();
                    bail!("fuzzer timed out after {timeout:?}");
                }
            };
        }
        self.deadline = Some(Instant::now() + timeout);
        self.child = Some(child);
        Ok(None)
    }

    fn poll(&mut self) -> Result<Option<i32>> {
        let Some(child) = &mut self.child else {
            bail!("no fuzzer process to poll");
        };
        if let Some(status) = child.try_wait()? {
            self.child = None;
            self.deadline = None;
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.halt()?;
                bail!("fuzzer run exceeded its deadline");
            }
        }
        Ok(None)
    }

    fn halt(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
        self.deadline = None;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.halt()?;
        std::fs::remove_file(&self.profraw).ok();
        std::fs::remove_file(&self.logfile).ok();
        Ok(())
    }

    fn track(&self) -> u64 {
        let Ok(log) = std::fs::read_to_string(&self.logfile) else {
            return 0;
        };
        COV_RE
            .captures_iter(&log)
            .filter_map(|capture| capture[1].parse().ok())
            .max()
            .unwrap_or(0)
    }

    fn coverage(&self, scope: CovScope, profile: Option<&Path>) -> Result<Coverage> {
        let profraw = profile.unwrap_or(&self.profraw);
        Self::export_coverage(&self.executable, &self.srcfile, profraw, scope)
    }

    fn batch_run(
        &self,
        corpus_dirs: Vec<PathBuf>,
        config: &BatchConfig,
    ) -> Result<Receiver<BatchOutcome>> {
        let pool = ThreadPool::new(config.batch_size.max(1));
        let (sender, receiver) = mpsc::channel();
        for corpus_dir in corpus_dirs {
            let sender = sender.clone();
            let executable = self.executable.clone();
            let srcfile = self.srcfile.clone();
            let config = config.clone();
            pool.execute(move || {
                let outcome = Self::run_one(executable, srcfile, corpus_dir.clone(), config)
                    .unwrap_or_else(|err| BatchOutcome {
                        corpus_dir,
                        result: Err(format!("{err:#}")),
                        coverage: None,
                    });
                sender.send(outcome).ok();
            });
        }
        // keep the pool alive until all workers finished
        std::thread::spawn(move || pool.join());
        Ok(receiver)
    }
}

impl Drop for LibFuzzer {
    fn drop(&mut self) {
        self.halt().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_parses_latest_cov() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("fuzzer.log"),
            "#2\tINITED cov: 17 ft: 18 corp: 1/1b\n\
             #65536\tpulse  cov: 17 ft: 18\n\
             #131072\tNEW    cov: 42 ft: 51 corp: 2/3b\n",
        )?;
        let fuzzer = LibFuzzer::new(Path::new("/bin/false"), dir.path(), Path::new("source.cc"));
        assert_eq!(fuzzer.track(), 42);
        Ok(())
    }

    #[test]
    fn test_track_without_log() {
        let fuzzer = LibFuzzer::new(
            Path::new("/bin/false"),
            Path::new("/nonexistent"),
            Path::new("source.cc"),
        );
        assert_eq!(fuzzer.track(), 0);
    }

    #[test]
    fn test_is_harness_file() {
        let srcfile = Path::new("/work/1/source.cc");
        assert!(LibFuzzer::is_harness_file(srcfile, Path::new("/work/1/source.cc")));
        assert!(LibFuzzer::is_harness_file(srcfile, Path::new("source.cc")));
        assert!(!LibFuzzer::is_harness_file(srcfile, Path::new("/src/cJSON.c")));
    }
}
