use std::path::{Path, PathBuf};

use eyre::{Context, Result};

use crate::state::State;
use crate::validate::FailureKind;

/// On-disk layout of one generation run:
///
/// ```text
/// workdir/
///   state/latest.json
///   work/<trial>/
///   exceptions/failure_<kind>/<trial>/
///   harness/<trial>.<ext>, harness/metas.csv
///   corpus/
///   tags/
/// ```
pub struct Depot {
    root: PathBuf,
}

impl Depot {
    pub fn new(root: &Path) -> Result<Self> {
        for sub in ["state", "work", "exceptions", "harness", "corpus"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("cannot create the workspace directory {root:?}/{sub}"))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state/latest.json")
    }

    /// The active working directory of the given trial, created on demand.
    pub fn work_dir(&self, trial: u64) -> Result<PathBuf> {
        let dir = self.root.join("work").join(trial.to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create the trial directory {dir:?}"))?;
        Ok(dir)
    }

    pub fn harness_file(&self, trial: u64, ext: &str) -> PathBuf {
        self.root.join("harness").join(format!("{trial}.{ext}"))
    }

    pub fn metas_file(&self) -> PathBuf {
        self.root.join("harness/metas.csv")
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join("corpus")
    }

    pub fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Copy the configured seed corpus into the working copy; libFuzzer
    /// mutates the working copy only. Seeds a placeholder input when no
    /// corpus is configured.
    pub fn stage_corpus(&self, seed_corpus: Option<&Path>) -> Result<PathBuf> {
        let corpus = self.corpus_dir();
        match seed_corpus {
            Some(src) => copy_dir(src, &corpus)
                .with_context(|| format!("cannot stage the seed corpus from {src:?}"))?,
            None => {
                let placeholder = corpus.join("seed_0");
                if !placeholder.exists() {
                    std::fs::write(&placeholder, b" ")?;
                }
            }
        }
        Ok(corpus)
    }

    pub fn persist_state(&self, state: &State) -> Result<()> {
        // write-then-rename keeps the snapshot readable on a crash
        let staging = self.state_file().with_extension("json.part");
        let file = std::fs::File::create(&staging)
            .with_context(|| format!("cannot create the state snapshot {staging:?}"))?;
        serde_json::to_writer(file, state)?;
        std::fs::rename(&staging, self.state_file())?;
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<State>> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&path)
            .with_context(|| format!("cannot open the state snapshot {path:?}"))?;
        Ok(Some(serde_json::from_reader(file).with_context(|| {
            format!("malformed state snapshot {path:?}")
        })?))
    }

    /// Preserve a failed trial: move its working directory under
    /// `exceptions/failure_<kind>/<trial>/` next to a text file naming the
    /// cause.
    pub fn preserve_failure(
        &self,
        trial: u64,
        kind: FailureKind,
        description: &str,
        workdir: &Path,
    ) -> Result<PathBuf> {
        let bucket = format!("failure_{}", kind.as_ref());
        let dir = self
            .root
            .join("exceptions")
            .join(&bucket)
            .join(trial.to_string());
        std::fs::create_dir_all(&dir)?;
        if workdir.exists() {
            copy_dir(workdir, &dir)?;
        }
        std::fs::write(dir.join(format!("{bucket}.txt")), description)?;
        Ok(dir)
    }
}

/// Recursive directory copy, contents of `src` into `dst`.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("cannot copy {:?} to {target:?}", entry.path()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::ApiGadget;
    use crate::mutation::ApiMutator;
    use crate::state::{Covered, Trial};

    fn state() -> State {
        State {
            trial: Trial {
                trial: 2,
                failure_parse: 1,
                cost: 0.5,
                ..Trial::default()
            },
            covered: Covered::default(),
            mutator: ApiMutator::new(vec![ApiGadget::new("f", "int", vec![])]),
        }
    }

    #[test]
    fn test_layout_created() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let depot = Depot::new(dir.path())?;
        for sub in ["state", "work", "exceptions", "harness", "corpus"] {
            assert!(depot.root().join(sub).is_dir());
        }
        Ok(())
    }

    #[test]
    fn test_state_persist_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let depot = Depot::new(dir.path())?;
        assert!(depot.load_state()?.is_none());

        let state = state();
        depot.persist_state(&state)?;
        let restored = depot.load_state()?.expect("state should exist");
        assert_eq!(restored.trial, state.trial);
        assert_eq!(restored.covered, state.covered);
        assert_eq!(restored.mutator.gadgets(), state.mutator.gadgets());
        Ok(())
    }

    #[test]
    fn test_preserve_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let depot = Depot::new(dir.path())?;
        let workdir = depot.work_dir(1)?;
        std::fs::write(workdir.join("source.cc"), "int x;")?;

        let preserved =
            depot.preserve_failure(1, FailureKind::Compile, "undefined reference", &workdir)?;
        assert!(preserved.join("source.cc").exists());
        let note = std::fs::read_to_string(preserved.join("failure_compile.txt"))?;
        assert_eq!(note, "undefined reference");
        Ok(())
    }

    #[test]
    fn test_stage_corpus_placeholder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let depot = Depot::new(dir.path())?;
        let corpus = depot.stage_corpus(None)?;
        assert!(corpus.join("seed_0").exists());
        Ok(())
    }

    #[test]
    fn test_stage_corpus_copies_seeds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let seeds = dir.path().join("seeds");
        std::fs::create_dir_all(&seeds)?;
        std::fs::write(seeds.join("a"), "x")?;
        std::fs::write(seeds.join("b"), "y")?;

        let depot = Depot::new(&dir.path().join("workspace"))?;
        let corpus = depot.stage_corpus(Some(&seeds))?;
        assert!(corpus.join("a").exists());
        assert!(corpus.join("b").exists());
        Ok(())
    }
}
