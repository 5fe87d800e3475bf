use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Additive hit-count tables collected from instrumented fuzzer runs.
///
/// Branch identifiers are opaque strings minted by the fuzzer driver
/// (`"L{line}#({block}, {branch})"` for lcov-based drivers); nothing here
/// inspects them beyond equality.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    /// {function name: {branch id: #hit}}
    #[serde(default)]
    pub functions: HashMap<String, HashMap<String, u64>>,
    /// {source file: {lineno: #hit}}
    #[serde(default)]
    pub lines: HashMap<PathBuf, HashMap<u32, u64>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pointwise additive union. Missing keys on either side count as zero.
    pub fn merge(&mut self, other: &Coverage) {
        for (func, branches) in &other.functions {
            let entry = self.functions.entry(func.clone()).or_default();
            for (id, hit) in branches {
                *entry.entry(id.clone()).or_insert(0) += hit;
            }
        }
        for (file, linenos) in &other.lines {
            let entry = self.lines.entry(file.clone()).or_default();
            for (lineno, hit) in linenos {
                *entry.entry(*lineno).or_insert(0) += hit;
            }
        }
    }

    /// Branch coverage of a single function, `None` if the function is
    /// untracked or carries no branches.
    pub fn cover_branch(&self, func: &str) -> Option<f64> {
        let branches = self.functions.get(func)?;
        if branches.is_empty() {
            return None;
        }
        let hit = branches.values().filter(|hit| **hit > 0).count();
        Some(hit as f64 / branches.len() as f64)
    }

    /// Whether the given line was hit, `None` if the file is untracked.
    pub fn cover_lines(&self, file: &Path, lineno: u32) -> Option<bool> {
        let linenos = self.lines.get(file)?;
        Some(linenos.get(&lineno).copied().unwrap_or(0) > 0)
    }

    /// Flatten the per-function tables into `(function, branch id)` keys.
    pub fn flat(&self, nonzero: bool) -> HashMap<(String, String), u64> {
        self.functions
            .iter()
            .flat_map(|(func, branches)| {
                branches
                    .iter()
                    .map(move |(id, hit)| ((func.clone(), id.clone()), *hit))
            })
            .filter(|(_, hit)| !nonzero || *hit > 0)
            .collect()
    }

    /// Overall branch coverage; the denominator is clamped to one so the
    /// empty coverage is defined (and zero).
    pub fn coverage_branch(&self) -> f64 {
        let total: usize = self.functions.values().map(HashMap::len).sum();
        let hit: usize = self
            .functions
            .values()
            .map(|branches| branches.values().filter(|hit| **hit > 0).count())
            .sum();
        hit as f64 / total.max(1) as f64
    }

    /// Record a synthetic hit for the given function.
    ///
    /// Used for the prompted/executed API sets, which reuse the coverage
    /// container for its merge and persistence behavior.
    pub fn hit(&mut self, func: &str) {
        *self
            .functions
            .entry(func.to_string())
            .or_default()
            .entry("hit".to_string())
            .or_insert(0) += 1;
    }

    pub fn contains(&self, func: &str) -> bool {
        self.functions.contains_key(func)
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create coverage dump {path:?}"))?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open coverage dump {path:?}"))?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(entries: &[(&str, &str, u64)]) -> Coverage {
        let mut cov = Coverage::new();
        for (func, id, hit) in entries {
            *cov.functions
                .entry(func.to_string())
                .or_default()
                .entry(id.to_string())
                .or_insert(0) += hit;
        }
        cov
    }

    #[test]
    fn test_merge_commutative() {
        let a = coverage(&[("f", "L1#(0, 0)", 1), ("f", "L1#(0, 1)", 0), ("g", "L9#(0, 0)", 3)]);
        let b = coverage(&[("f", "L1#(0, 0)", 2), ("h", "L4#(1, 0)", 1)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        // identity
        let mut with_empty = a.clone();
        with_empty.merge(&Coverage::new());
        assert_eq!(with_empty, a);
    }

    #[test]
    fn test_merge_is_additive() {
        let a = coverage(&[("f", "L1#(0, 0)", 1)]);
        let b = coverage(&[("f", "L1#(0, 0)", 2)]);
        let mut merged = a;
        merged.merge(&b);
        assert_eq!(merged.functions["f"]["L1#(0, 0)"], 3);
    }

    #[test]
    fn test_cover_branch() {
        let cov = coverage(&[("f", "L1#(0, 0)", 1), ("f", "L1#(0, 1)", 0)]);
        assert_eq!(cov.cover_branch("f"), Some(0.5));
        assert_eq!(cov.cover_branch("unknown"), None);
    }

    #[test]
    fn test_coverage_branch_bounds() {
        assert_eq!(Coverage::new().coverage_branch(), 0.0);
        let cov = coverage(&[("f", "L1#(0, 0)", 1), ("g", "L2#(0, 0)", 0)]);
        let ratio = cov.coverage_branch();
        assert!((0.0..=1.0).contains(&ratio));
        assert_eq!(ratio, 0.5);
    }

    #[test]
    fn test_cover_lines() {
        let mut cov = Coverage::new();
        cov.lines
            .entry(PathBuf::from("/tmp/source.cc"))
            .or_default()
            .insert(42, 7);
        assert_eq!(cov.cover_lines(Path::new("/tmp/source.cc"), 42), Some(true));
        assert_eq!(cov.cover_lines(Path::new("/tmp/source.cc"), 43), Some(false));
        assert_eq!(cov.cover_lines(Path::new("/tmp/other.cc"), 42), None);
    }

    #[test]
    fn test_flat_nonzero() {
        let cov = coverage(&[("f", "L1#(0, 0)", 1), ("f", "L1#(0, 1)", 0)]);
        assert_eq!(cov.flat(false).len(), 2);
        let nonzero = cov.flat(true);
        assert_eq!(nonzero.len(), 1);
        assert!(nonzero.contains_key(&("f".to_string(), "L1#(0, 0)".to_string())));
    }

    #[test]
    fn test_dump_load_roundtrip() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cov.json");
        let mut cov = coverage(&[("f", "L1#(0, 0)", 1)]);
        cov.lines
            .entry(PathBuf::from("a.cc"))
            .or_default()
            .insert(1, 1);
        cov.dump(&path)?;
        assert_eq!(Coverage::load(&path)?, cov);
        Ok(())
    }
}
