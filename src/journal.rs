use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only, timestamped run journal (agent and validator streams).
///
/// Journals never fail the pipeline: write errors degrade to `log` warnings.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn log(&self, msg: impl AsRef<str>) {
        let timestamp = chrono::Local::now().format("%Y.%m.%dT%H:%M:%S");
        let line = format!("[{timestamp}] {}\n", msg.as_ref());
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            log::warn!("cannot write the journal {:?}: {err}", self.path);
        }
        log::debug!("{}", msg.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_appends() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("validator.log");
        let journal = Journal::new(&path);
        journal.log("first");
        journal.log("second");
        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
        Ok(())
    }
}
