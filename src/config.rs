use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

// Agent options.
pub const RETRY_N: u8 = 5;

pub const MAX_TURNS: usize = 30;

pub const TEMPERATURE: f32 = 0.7;

pub const DEFAULT_SEED: i64 = 1024;

// Fuzzer run bounds, in seconds.
pub const EXECUTION_TIMEOUT: u64 = 180;

pub const MAX_FUZZ_TIME: u64 = 600;

/// Compiler flags for the harness build: libFuzzer, ASan/UBSan and profile
/// instrumentation.
pub const HARNESS_FLAGS: [&str; 8] = [
    "-g",
    "-fno-omit-frame-pointer",
    "-fsanitize=address,undefined",
    "-fsanitize-address-use-after-scope",
    "-fsanitize=fuzzer",
    "-fsanitize=fuzzer-no-link",
    "-fprofile-instr-generate",
    "-fcoverage-mapping",
];

/// Configurations of the harness generation pipeline, loaded from a per
/// project YAML (or JSON) file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The name of the project, e.g. cjson, zlib.
    pub name: String,
    /// A path to the source code directory.
    pub srcdir: PathBuf,
    /// Postfixes for retrieving the header files from the source directory.
    #[serde(default = "default_postfix")]
    pub postfix: Vec<String>,
    /// A path to the seed corpus directory.
    #[serde(default)]
    pub corpus_dir: Option<PathBuf>,
    /// A path to the AFL-style fuzzing dictionary.
    #[serde(default)]
    pub fuzzdict: Option<PathBuf>,
    /// Minimal and maximal length of an API combination.
    #[serde(default = "default_comblen")]
    pub comblen: (usize, usize),
    /// The maximum number of the APIs rendered into a single prompt.
    #[serde(default = "default_max_apis")]
    pub max_apis: usize,
    /// The name of the llm.
    #[serde(default = "default_llm")]
    pub llm: String,
    /// File extension for the generated harness.
    #[serde(default = "default_ext")]
    pub ext: String,
    /// The maximum running time of a validation fuzzer run, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// The interval between adjacent coverage-growth polls, in seconds.
    #[serde(default = "default_timeout_unit")]
    pub timeout_unit: f64,
    /// The cost budget of the whole run, in USD.
    #[serde(default = "default_quota")]
    pub quota: f64,
    /// A path to the built target library, e.g. libcjson.a.
    pub libpath: PathBuf,
    /// Additional libraries to link, e.g. ["z", "m"].
    #[serde(default)]
    pub links: Vec<String>,
    /// Directories for preprocessing the `#include` macro.
    #[serde(default)]
    pub include_dir: Vec<PathBuf>,
    /// A path to the clang++ compiler.
    #[serde(default = "default_clang")]
    pub clang: String,
    /// Compiler flags for building harnesses.
    #[serde(default = "default_flags")]
    pub flags: Vec<String>,
}

fn default_postfix() -> Vec<String> {
    vec![".h".into(), ".hpp".into(), ".hxx".into()]
}

fn default_comblen() -> (usize, usize) {
    (5, 10)
}

fn default_max_apis() -> usize {
    200
}

fn default_llm() -> String {
    "gpt-4o-mini-2024-07-18".into()
}

fn default_ext() -> String {
    "cc".into()
}

fn default_timeout() -> f64 {
    MAX_FUZZ_TIME as f64
}

fn default_timeout_unit() -> f64 {
    60.0
}

fn default_quota() -> f64 {
    10.0
}

fn default_clang() -> String {
    "clang++".into()
}

fn default_flags() -> Vec<String> {
    HARNESS_FLAGS.iter().map(|flag| flag.to_string()).collect()
}

impl Config {
    pub fn load_from_yaml(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open the configuration file {path:?}"))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("malformed configuration file {path:?}"))
    }

    pub fn load_from_json(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open the configuration file {path:?}"))?;
        serde_json::from_reader(file)
            .with_context(|| format!("malformed configuration file {path:?}"))
    }

    pub fn dump(&self, writer: impl Write) -> Result<()> {
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }

    /// A throwaway configuration for tests.
    #[cfg(test)]
    pub fn test(workdir: &Path) -> Self {
        Self {
            name: "cjson".into(),
            srcdir: workdir.join("src"),
            postfix: default_postfix(),
            corpus_dir: Some(workdir.join("corpus")),
            fuzzdict: None,
            comblen: (1, 3),
            max_apis: default_max_apis(),
            llm: default_llm(),
            ext: default_ext(),
            timeout: 1.0,
            timeout_unit: 0.1,
            quota: default_quota(),
            libpath: workdir.join("lib/libcjson.a"),
            links: Vec::new(),
            include_dir: Vec::new(),
            clang: default_clang(),
            flags: default_flags(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "name: cjson\nsrcdir: /src/cjson\nlibpath: /src/cjson/libcjson.a\n",
        )?;
        let config = Config::load_from_yaml(&path)?;
        assert_eq!(config.name, "cjson");
        assert_eq!(config.comblen, (5, 10));
        assert_eq!(config.max_apis, 200);
        assert_eq!(config.llm, "gpt-4o-mini-2024-07-18");
        assert_eq!(config.timeout, 600.0);
        assert_eq!(config.timeout_unit, 60.0);
        assert_eq!(config.quota, 10.0);
        Ok(())
    }

    #[test]
    fn test_unknown_key_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "name: cjson\nsrcdir: /src\nlibpath: /src/lib.a\nnonsense: 1\n",
        )?;
        assert!(Config::load_from_yaml(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_dump_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let path = dir.path().join("config.yaml");
        config.dump(std::fs::File::create(&path)?)?;
        assert_eq!(Config::load_from_yaml(&path)?, config);
        Ok(())
    }
}
