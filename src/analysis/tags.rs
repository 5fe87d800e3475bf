use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use eyre::{bail, Context, Result};

/// GNU GLOBAL tag database over the target source tree.
///
/// Answers symbol queries for the agent tools; the database lives under the
/// workspace so repeated runs reuse it.
pub struct GlobalTags {
    srcdir: PathBuf,
    tagdir: PathBuf,
}

impl GlobalTags {
    /// Build (or reuse) the tag database with `gtags`.
    pub fn build(srcdir: &Path, tagdir: &Path) -> Result<Self> {
        std::fs::create_dir_all(tagdir)
            .with_context(|| format!("cannot create the tag directory {tagdir:?}"))?;
        let output = Command::new("gtags")
            .arg(tagdir)
            .current_dir(srcdir)
            .output()
            .context("failed to spawn gtags; is GNU GLOBAL installed?")?;
        if !output.status.success() {
            bail!(
                "gtags returned non-zero exit status:\n{}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(Self {
            srcdir: srcdir.to_path_buf(),
            tagdir: tagdir.to_path_buf(),
        })
    }

    /// Definitions of `symbol`, as `{file: [linenos]}`.
    pub fn find_definition(&self, symbol: &str) -> Result<HashMap<PathBuf, Vec<u32>>> {
        self.query(&["-x", "-d", symbol])
    }

    /// References to `symbol`, as `{file: [linenos]}`.
    pub fn find_references(&self, symbol: &str) -> Result<HashMap<PathBuf, Vec<u32>>> {
        self.query(&["-x", "-r", symbol])
    }

    fn query(&self, args: &[&str]) -> Result<HashMap<PathBuf, Vec<u32>>> {
        let output = Command::new("global")
            .args(args)
            .current_dir(&self.srcdir)
            .env("GTAGSROOT", &self.srcdir)
            .env("GTAGSDBPATH", &self.tagdir)
            .output()
            .context("failed to spawn global; is GNU GLOBAL installed?")?;
        // global exits non-zero when nothing matches; report that as empty
        Ok(Self::parse_cxref(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Parse `global -x` (cxref) output: `symbol lineno path context...`.
    fn parse_cxref(output: &str) -> HashMap<PathBuf, Vec<u32>> {
        let mut found: HashMap<PathBuf, Vec<u32>> = HashMap::new();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_symbol), Some(lineno), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(lineno) = lineno.parse::<u32>() else {
                continue;
            };
            found.entry(PathBuf::from(path)).or_default().push(lineno);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cxref() {
        let output = "\
parse_number      94 cjson/cJSON.c    static cJSON_bool parse_number(cJSON * const item)
parse_number    1363 cjson/cJSON.c            return parse_number(item, input_buffer);
parse_value      101 cjson/other.c    static cJSON_bool parse_value(void)
";
        let found = GlobalTags::parse_cxref(output);
        assert_eq!(found.len(), 2);
        assert_eq!(found[&PathBuf::from("cjson/cJSON.c")], vec![94, 1363]);
        assert_eq!(found[&PathBuf::from("cjson/other.c")], vec![101]);
    }

    #[test]
    fn test_parse_cxref_skips_garbage() {
        let found = GlobalTags::parse_cxref("malformed\nsym notanumber file.c\n");
        assert!(found.is_empty());
    }
}
