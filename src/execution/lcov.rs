use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use lcov::Record;

use crate::coverage::Coverage;

/// One `SF:` section of an lcov export, with branches grouped under their
/// enclosing function.
#[derive(Debug, Default)]
struct FileSection {
    functions: Vec<(String, u32)>,
    lines: Vec<(u32, u64)>,
    branches: Vec<(u32, u32, u32, u64)>,
}

/// Parse an lcov tracefile into a [`Coverage`], keeping only files accepted
/// by `keep`.
///
/// Branch identity is rendered as `"L{line}#({block}, {branch})"`; branches
/// outside any known function are dropped.
pub fn coverage_from_lcov(path: &Path, keep: impl Fn(&Path) -> bool) -> Result<Coverage> {
    let reader = lcov::Reader::open_file(path)
        .with_context(|| format!("cannot open the lcov tracefile {path:?}"))?;

    let mut coverage = Coverage::new();
    let mut current: Option<(PathBuf, FileSection)> = None;
    for record in reader {
        let record = record.with_context(|| format!("malformed lcov record in {path:?}"))?;
        match record {
            Record::SourceFile { path } => {
                current = Some((path, FileSection::default()));
            }
            Record::FunctionName { name, start_line } => {
                if let Some((_, section)) = &mut current {
                    section.functions.push((name, start_line));
                }
            }
            Record::LineData { line, count, .. } => {
                if let Some((_, section)) = &mut current {
                    section.lines.push((line, count));
                }
            }
            Record::BranchData {
                line,
                block,
                branch,
                taken,
            } => {
                if let Some((_, section)) = &mut current {
                    section
                        .branches
                        .push((line, block, branch, taken.unwrap_or(0)));
                }
            }
            Record::EndOfRecord => {
                if let Some((file, section)) = current.take() {
                    if keep(&file) {
                        fold_section(&mut coverage, file, section);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(coverage)
}

fn fold_section(coverage: &mut Coverage, file: PathBuf, mut section: FileSection) {
    section.functions.sort_by_key(|(_, start)| *start);

    // the function a line belongs to: the last one starting at or before it
    let owner = |lineno: u32| -> Option<&str> {
        match section
            .functions
            .partition_point(|(_, start)| *start <= lineno)
        {
            0 => None,
            i => Some(section.functions[i - 1].0.as_str()),
        }
    };

    for (name, _) in &section.functions {
        coverage.functions.entry(name.clone()).or_default();
    }
    for (line, block, branch, taken) in &section.branches {
        let Some(function) = owner(*line) else { continue };
        coverage
            .functions
            .entry(function.to_string())
            .or_default()
            .insert(format!("L{line}#({block}, {branch})"), *taken);
    }
    let lines = coverage.lines.entry(file).or_default();
    for (line, count) in &section.lines {
        *lines.entry(*line).or_insert(0) += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TRACEFILE: &str = "\
TN:
SF:/src/cjson/cJSON.c
FN:10,parse_value
FN:40,parse_number
FNDA:3,parse_value
DA:11,3
DA:12,0
DA:41,2
BRDA:11,0,0,2
BRDA:11,0,1,-
BRDA:41,0,0,1
LF:3
LH:2
end_of_record
SF:/work/source.cc
FN:5,LLVMFuzzerTestOneInput
DA:6,9
BRDA:6,0,0,9
end_of_record
";

    fn tracefile() -> Result<(tempfile::TempDir, PathBuf)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("coverage.lcov");
        std::fs::File::create(&path)?.write_all(TRACEFILE.as_bytes())?;
        Ok((dir, path))
    }

    #[test]
    fn test_parse_all_sections() -> Result<()> {
        let (_dir, path) = tracefile()?;
        let coverage = coverage_from_lcov(&path, |_| true)?;

        let parse_value = &coverage.functions["parse_value"];
        assert_eq!(parse_value["L11#(0, 0)"], 2);
        assert_eq!(parse_value["L11#(0, 1)"], 0);
        assert_eq!(coverage.functions["parse_number"]["L41#(0, 0)"], 1);

        assert_eq!(
            coverage.cover_lines(Path::new("/src/cjson/cJSON.c"), 12),
            Some(false)
        );
        assert_eq!(
            coverage.cover_lines(Path::new("/work/source.cc"), 6),
            Some(true)
        );
        Ok(())
    }

    #[test]
    fn test_keep_filter() -> Result<()> {
        let (_dir, path) = tracefile()?;
        let coverage = coverage_from_lcov(&path, |file| file.ends_with("source.cc"))?;
        assert!(coverage.functions.contains_key("LLVMFuzzerTestOneInput"));
        assert!(!coverage.functions.contains_key("parse_value"));
        Ok(())
    }

    #[test]
    fn test_untaken_branch_counts_zero() -> Result<()> {
        let (_dir, path) = tracefile()?;
        let coverage = coverage_from_lcov(&path, |_| true)?;
        assert_eq!(coverage.cover_branch("parse_value"), Some(0.5));
        Ok(())
    }
}
