use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{bail, Result};
use serde_json::{json, Value};

use crate::agent::{Response, ToolSpec, Toolbox};
use crate::analysis::tags::GlobalTags;
use crate::coverage::Coverage;
use crate::validate::{HarnessValidator, Success, ValidationError};

const READ_WINDOW: usize = 50;

/// The tools the harness generation agent may call: symbol lookup, source
/// reading, and the validator itself.
///
/// Holds the per-trial state (working directory, corpus, global coverage)
/// and records the last validation outcome for the controller.
pub struct HarnessToolbox<'e> {
    validator: &'e HarnessValidator<'e>,
    tags: Option<&'e GlobalTags>,
    srcdir: PathBuf,
    workdir: PathBuf,
    corpus_dir: PathBuf,
    fuzzdict: Option<PathBuf>,
    global_cov: Coverage,
    batch_size: Option<usize>,
    validated: Option<Success>,
    last_failure: Option<ValidationError>,
}

impl<'e> HarnessToolbox<'e> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validator: &'e HarnessValidator<'e>,
        tags: Option<&'e GlobalTags>,
        srcdir: &Path,
        workdir: &Path,
        corpus_dir: &Path,
        fuzzdict: Option<&Path>,
        global_cov: Coverage,
        batch_size: Option<usize>,
    ) -> Self {
        Self {
            validator,
            tags,
            srcdir: srcdir.to_path_buf(),
            workdir: workdir.to_path_buf(),
            corpus_dir: corpus_dir.to_path_buf(),
            fuzzdict: fuzzdict.map(Path::to_path_buf),
            global_cov,
            batch_size,
            validated: None,
            last_failure: None,
        }
    }

    /// The verdict of the last `validate` call that failed, for the
    /// controller's failure dispatch.
    pub fn take_last_failure(&mut self) -> Option<ValidationError> {
        self.last_failure.take()
    }

    fn read_found(&self, found: HashMap<PathBuf, Vec<u32>>) -> Value {
        let files: Vec<Value> = found
            .into_iter()
            .map(|(file, linenos)| {
                let found: Vec<Value> = linenos
                    .into_iter()
                    .map(|lineno| {
                        let read = self.read_window(&file.to_string_lossy(), lineno as usize, 1);
                        let content = read
                            .get("contents")
                            .cloned()
                            .unwrap_or_else(|| read.clone());
                        json!({"line": lineno, "content": content})
                    })
                    .collect();
                json!({"file": file, "found": found})
            })
            .collect();
        Value::Array(files)
    }

    fn find_definition(&self, symbol: &str) -> Value {
        let Some(tags) = self.tags else {
            return json!({"error": "no symbol index is available."});
        };
        match tags.find_definition(symbol) {
            Ok(found) if !found.is_empty() => self.read_found(found),
            Ok(_) => json!({"error": "no results found."}),
            Err(err) => json!({"error": format!("{err:#}")}),
        }
    }

    fn find_references(&self, symbol: &str) -> Value {
        let Some(tags) = self.tags else {
            return json!({"error": "no symbol index is available."});
        };
        match tags.find_references(symbol) {
            Ok(found) if !found.is_empty() => self.read_found(found),
            Ok(_) => json!({"error": "no results found."}),
            Err(err) => json!({"error": format!("{err:#}")}),
        }
    }

    fn read_window(&self, filename: &str, lineno: usize, num_lines: usize) -> Value {
        let path = self.srcdir.join(filename);
        if !path.exists() {
            return json!({"error": "file does not exist"});
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            return json!({"error": "file is not readable as text"});
        };
        let lines: Vec<&str> = content.split('\n').collect();
        let start = lineno.saturating_sub(num_lines / 2).min(lines.len());
        let window: Vec<&str> = lines
            .iter()
            .skip(start)
            .take(num_lines)
            .copied()
            .collect();
        if window.is_empty() {
            return json!({
                "error": format!("the given lineno {lineno} is out of the file `{filename}`")
            });
        }
        json!({
            "contents": window.join("\n"),
            "line_start": start,
            "line_end": start + window.len(),
        })
    }

    fn validate(&mut self, harness: &str) -> Result<Value> {
        let verdict = self.validator.validate(
            harness,
            &self.global_cov,
            &self.workdir,
            &self.corpus_dir,
            self.fuzzdict.as_deref(),
            self.batch_size,
        )?;
        Ok(match verdict {
            Ok(success) => {
                self.last_failure = None;
                self.validated = Some(success);
                json!({"success": true})
            }
            Err(err) => {
                let reply = match &err {
                    ValidationError::Parse { description, .. } => {
                        json!({"error": "parse", "description": description})
                    }
                    ValidationError::Compile { stderr, .. } => {
                        json!({"error": "compile", "description": stderr})
                    }
                    ValidationError::Fuzzer { exception, trace } => {
                        json!({"error": "fuzzer-run", "description": exception, "_traceback": trace})
                    }
                    ValidationError::CoverageNotGrow {
                        cov_global,
                        cov_local,
                    } => json!({
                        "error": "coverage-growth",
                        "description": format!(
                            "current coverage: {:.2}%, global coverage: {:.2}%",
                            cov_local * 100.0,
                            cov_global * 100.0
                        ),
                    }),
                    ValidationError::CriticalPathNotHit { .. } => {
                        json!({"error": "api-hit", "description": err.to_string()})
                    }
                };
                self.last_failure = Some(err);
                reply
            }
        })
    }
}

impl Toolbox for HarnessToolbox<'_> {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "find_definition".into(),
                description: "Find the definition about the given symbol from the project. \
                    You will see a list of found definitions `content`, path `file` and line numbers `line`. \
                    If the symbol does not exist, {\"error\": \"no results found.\"} will be returned."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "symbol": {
                            "type": "string",
                            "description": "The target symbol, for example, \"parse_number\"",
                        },
                    },
                    "required": ["symbol"],
                }),
            },
            ToolSpec {
                name: "find_references".into(),
                description: "Find the references about the given symbol. \
                    You will see a list of found references `content`, path `file` and line numbers `line`. \
                    If the symbol does not exist, {\"error\": \"no results found.\"} will be returned."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "symbol": {
                            "type": "string",
                            "description": "The target symbol, for example, \"parse_number\"",
                        },
                    },
                    "required": ["symbol"],
                }),
            },
            ToolSpec {
                name: "read_file".into(),
                description: "Read the `filename` file and return the `num_lines` lines around \
                    line `lineno`. If the file does not exist, {\"error\": \"file does not exist\"} \
                    will be returned."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "filename": {
                            "type": "string",
                            "description": "The name of the file, for example, \"cjson/cJSON.c\"",
                        },
                        "lineno": {
                            "type": "integer",
                            "description": "The line number, center point, e.g. 1363",
                        },
                        "num_lines": {
                            "type": "integer",
                            "description": "The number of the lines to read, e.g. 50",
                        },
                    },
                    "required": ["filename", "lineno"],
                }),
            },
            ToolSpec {
                name: "validate".into(),
                description: "Validate the given harness. Validation consists of six steps: \
                    parse the ``` ``` code segment, compile it, run the fuzzer, collect coverage, \
                    check the coverage grew over the global coverage, and check the requested APIs \
                    were hit. On success you will see a \"success\" flag; otherwise an error flag \
                    naming the failed step. Fix the harness and retry until validation passes."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "harness": {
                            "type": "string",
                            "description": "The requested harness, a full source file inside a \
                                ``` ``` code block defining LLVMFuzzerTestOneInput",
                        },
                    },
                    "required": ["harness"],
                }),
            },
        ]
    }

    fn dispatch(&mut self, name: &str, args: Value) -> Result<Value> {
        match name {
            "find_definition" => {
                let Some(symbol) = args["symbol"].as_str() else {
                    bail!("missing required argument `symbol`");
                };
                Ok(self.find_definition(symbol))
            }
            "find_references" => {
                let Some(symbol) = args["symbol"].as_str() else {
                    bail!("missing required argument `symbol`");
                };
                Ok(self.find_references(symbol))
            }
            "read_file" => {
                let Some(filename) = args["filename"].as_str() else {
                    bail!("missing required argument `filename`");
                };
                let Some(lineno) = args["lineno"].as_u64() else {
                    bail!("missing required argument `lineno`");
                };
                let num_lines = args["num_lines"].as_u64().unwrap_or(READ_WINDOW as u64);
                Ok(self.read_window(filename, lineno as usize, num_lines as usize))
            }
            "validate" => {
                let Some(harness) = args["harness"].as_str() else {
                    bail!("missing required argument `harness`");
                };
                self.validate(harness)
            }
            _ => bail!("undefined function `{name}`"),
        }
    }

    fn post_call(&mut self, name: &str, _args: &Value, retn: &Value) -> Option<Response> {
        if name == "validate" && retn.get("success").and_then(Value::as_bool) == Some(true) {
            return Some(Response {
                validated: self.validated.clone(),
                ..Response::default()
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AstParser, CriticalPath};
    use crate::config::Config;
    use crate::execution::{BatchConfig, BatchOutcome, Compiler, CovScope, Fuzzer, RunConfig};
    use crate::gadget::{ApiGadget, TypeGadget};
    use std::sync::mpsc;

    struct NullFuzzer;

    impl Fuzzer for NullFuzzer {
        fn minimize(&self, _corpus: &Path, _outdir: Option<&Path>) -> Result<Option<PathBuf>> {
            Ok(None)
        }
        fn run(&mut self, _config: &RunConfig) -> Result<Option<i32>> {
            Ok(None)
        }
        fn poll(&mut self) -> Result<Option<i32>> {
            Ok(Some(0))
        }
        fn halt(&mut self) -> Result<()> {
            Ok(())
        }
        fn clear(&mut self) -> Result<()> {
            Ok(())
        }
        fn track(&self) -> u64 {
            0
        }
        fn coverage(&self, _scope: CovScope, _profile: Option<&Path>) -> Result<Coverage> {
            Ok(Coverage::new())
        }
        fn batch_run(
            &self,
            _corpus_dirs: Vec<PathBuf>,
            _config: &BatchConfig,
        ) -> Result<mpsc::Receiver<BatchOutcome>> {
            let (_, receiver) = mpsc::channel();
            Ok(receiver)
        }
    }

    struct NullCompiler;

    impl Compiler for NullCompiler {
        fn compile(&self, _srcfile: &Path, _workdir: &Path) -> Result<Box<dyn Fuzzer>> {
            Ok(Box::new(NullFuzzer))
        }
    }

    struct NullParser;

    impl AstParser for NullParser {
        fn parse_api_gadget(&self, _source: &Path) -> Result<Vec<ApiGadget>> {
            Ok(Vec::new())
        }
        fn parse_type_gadget(&self, _source: &Path) -> Result<Vec<TypeGadget>> {
            Ok(Vec::new())
        }
        fn extract_critical_path(
            &self,
            _source: &Path,
            _gadgets: &[ApiGadget],
            _target: Option<&str>,
        ) -> Result<Vec<CriticalPath>> {
            Ok(Vec::new())
        }
    }

    fn toolbox_fixture<'e>(
        validator: &'e HarnessValidator<'e>,
        srcdir: &Path,
        workdir: &Path,
    ) -> HarnessToolbox<'e> {
        HarnessToolbox::new(
            validator,
            None,
            srcdir,
            workdir,
            &workdir.join("corpus"),
            None,
            Coverage::new(),
            Some(1),
        )
    }

    #[test]
    fn test_tool_specs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::test(dir.path());
        let compiler = NullCompiler;
        let parser = NullParser;
        let validator = HarnessValidator::new(&compiler, &parser, vec![], &config);
        let toolbox = toolbox_fixture(&validator, dir.path(), dir.path());

        let names: Vec<String> = toolbox.tools().into_iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            ["find_definition", "find_references", "read_file", "validate"]
        );
    }

    #[test]
    fn test_read_file_window() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let srcdir = dir.path().join("src");
        std::fs::create_dir_all(&srcdir)?;
        let body: String = (0..100).map(|i| format!("line {i}\n")).collect();
        std::fs::write(srcdir.join("lib.c"), body)?;

        let config = Config::test(dir.path());
        let compiler = NullCompiler;
        let parser = NullParser;
        let validator = HarnessValidator::new(&compiler, &parser, vec![], &config);
        let mut toolbox = toolbox_fixture(&validator, &srcdir, dir.path());

        let read = toolbox.dispatch(
            "read_file",
            json!({"filename": "lib.c", "lineno": 50, "num_lines": 10}),
        )?;
        assert_eq!(read["line_start"], 45);
        assert!(read["contents"].as_str().unwrap().contains("line 50"));

        let missing = toolbox.dispatch("read_file", json!({"filename": "nope.c", "lineno": 1}))?;
        assert_eq!(missing["error"], "file does not exist");
        Ok(())
    }

    #[test]
    fn test_dispatch_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::test(dir.path());
        let compiler = NullCompiler;
        let parser = NullParser;
        let validator = HarnessValidator::new(&compiler, &parser, vec![], &config);
        let mut toolbox = toolbox_fixture(&validator, dir.path(), dir.path());
        assert!(toolbox.dispatch("rm_rf", json!({})).is_err());
    }

    #[test]
    fn test_find_definition_without_tags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let compiler = NullCompiler;
        let parser = NullParser;
        let validator = HarnessValidator::new(&compiler, &parser, vec![], &config);
        let mut toolbox = toolbox_fixture(&validator, dir.path(), dir.path());

        let reply = toolbox.dispatch("find_definition", json!({"symbol": "parse_number"}))?;
        assert!(reply["error"].as_str().unwrap().contains("no symbol index"));
        Ok(())
    }

    #[test]
    fn test_post_call_short_circuits_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::test(dir.path());
        let compiler = NullCompiler;
        let parser = NullParser;
        let validator = HarnessValidator::new(&compiler, &parser, vec![], &config);
        let mut toolbox = toolbox_fixture(&validator, dir.path(), dir.path());
        toolbox.validated = Some(Success {
            path: dir.path().join("source.cc"),
            cov_lib: Coverage::new(),
            cov_fuzz: Coverage::new(),
            validated_paths: vec![vec![("f".to_string(), None)]],
        });

        // a failed validation never short-circuits
        assert!(toolbox
            .post_call("validate", &json!({}), &json!({"error": "parse"}))
            .is_none());
        let response = toolbox
            .post_call("validate", &json!({}), &json!({"success": true}))
            .expect("expected a short-circuit");
        assert!(response.validated.is_some());
    }
}
