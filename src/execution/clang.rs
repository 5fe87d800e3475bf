use std::path::{Path, PathBuf};
use std::process::Command;

use eyre::{bail, Context, Result};

use crate::config::Config;
use crate::execution::libfuzzer::LibFuzzer;
use crate::execution::{Compiler, Fuzzer};

/// clang++ driver building libFuzzer harnesses with sanitizers and profile
/// instrumentation.
pub struct ClangCompiler {
    clang: String,
    flags: Vec<String>,
    include_dir: Vec<PathBuf>,
    libpath: PathBuf,
    links: Vec<String>,
}

impl ClangCompiler {
    pub fn new(config: &Config) -> Self {
        Self {
            clang: config.clang.clone(),
            flags: config.flags.clone(),
            include_dir: config.include_dir.clone(),
            libpath: config.libpath.clone(),
            links: config.links.clone(),
        }
    }
}

impl Compiler for ClangCompiler {
    fn compile(&self, srcfile: &Path, workdir: &Path) -> Result<Box<dyn Fuzzer>> {
        std::fs::create_dir_all(workdir)
            .with_context(|| format!("cannot create the working directory {workdir:?}"))?;
        let executable = workdir.join("fuzzer.out");

        let mut cmd = Command::new(&self.clang);
        cmd.args(&self.flags).arg(srcfile);
        for dir in &self.include_dir {
            cmd.arg("-I").arg(dir);
        }
        cmd.arg("-o").arg(&executable).arg(&self.libpath);
        for link in &self.links {
            cmd.arg(format!("-l{link}"));
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn {}", self.clang))?;
        if !output.status.success() {
            bail!(
                "{} returned non-zero exit status:\n{}",
                self.clang,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        log::trace!("compiled {srcfile:?} into {executable:?}");
        Ok(Box::new(LibFuzzer::new(&executable, workdir, srcfile)))
    }
}
