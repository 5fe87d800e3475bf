/// Logs metadata of accepted harnesses.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csv::Writer;
use eyre::{eyre, Error, Result};
use serde::{Deserialize, Serialize};

/// Stores metadata of the accepted harnesses.
///
/// Serializes into a table with each column being a meta property.
#[derive(Debug)]
pub struct SeedMetas {
    start_time: Option<DateTime<Utc>>,
    seed_metas: Vec<SeedMeta>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SeedMeta {
    pub seed_path: PathBuf,
    seconds_since_start: f64,
    cumulative_branch_coverage: Option<f64>,
}

impl SeedMetas {
    pub fn new(start_time: DateTime<Utc>) -> SeedMetas {
        SeedMetas {
            start_time: Some(start_time),
            seed_metas: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.seed_metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seed_metas.is_empty()
    }

    /// Add an accepted harness' meta data.
    pub fn add(&mut self, seed_path: &Path, branch_coverage: Option<f64>) -> Result<()> {
        let Some(start_time) = self.start_time else {
            return Err(eyre!(
                "To add new seeds with this method, SeedMetas must be initialized with a start time"
            ));
        };
        let since_start = Utc::now() - start_time;
        self.seed_metas.push(SeedMeta {
            seed_path: seed_path.to_path_buf(),
            seconds_since_start: since_start.num_milliseconds() as f64 / 1000.0,
            cumulative_branch_coverage: branch_coverage,
        });
        Ok(())
    }

    /// Write the metadata table to path.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut writer = Writer::from_path(path)?;
        for seed_meta in &self.seed_metas {
            writer.serialize(seed_meta)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl TryFrom<&Path> for SeedMetas {
    type Error = Error;

    /// Load the metadata table from csv.
    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut seed_metas = Vec::new();
        for result in reader.deserialize() {
            let record: SeedMeta = result?;
            seed_metas.push(record);
        }
        Ok(SeedMetas {
            start_time: None,
            seed_metas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metas.csv");

        let mut metas = SeedMetas::new(Utc::now());
        metas.add(Path::new("/work/harness/1.cc"), Some(0.25))?;
        metas.add(Path::new("/work/harness/2.cc"), None)?;
        metas.write_to(&path)?;

        let loaded = SeedMetas::try_from(path.as_path())?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.seed_metas[0].seed_path,
            PathBuf::from("/work/harness/1.cc")
        );
        assert_eq!(loaded.seed_metas[0].cumulative_branch_coverage, Some(0.25));
        Ok(())
    }

    #[test]
    fn test_add_requires_start_time() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metas.csv");
        SeedMetas::new(Utc::now()).write_to(&path)?;

        let mut loaded = SeedMetas::try_from(path.as_path())?;
        assert!(loaded.add(Path::new("/tmp/x.cc"), None).is_err());
        Ok(())
    }
}
