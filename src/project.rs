use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::Result;

use crate::analysis::clang::ClangParser;
use crate::analysis::tags::GlobalTags;
use crate::analysis::AstParser;
use crate::config::Config;
use crate::execution::clang::ClangCompiler;
use crate::execution::Compiler;
use crate::gadget::{ApiGadget, TypeGadget};

/// Analyzes the target project and retrieves the knowledges: header files,
/// API/type gadgets, symbol tags.
pub struct Project {
    pub config: Config,
    pub parser: ClangParser,
    pub compiler: ClangCompiler,
    pub tags: Option<GlobalTags>,
}

impl Project {
    pub fn new(config: Config, tagdir: &Path) -> Self {
        let parser = ClangParser::new(&config.clang, &config.include_dir);
        let compiler = ClangCompiler::new(&config);
        let tags = match GlobalTags::build(&config.srcdir, tagdir) {
            Ok(tags) => Some(tags),
            Err(err) => {
                log::warn!("symbol tags are unavailable: {err:#}");
                None
            }
        };
        Self {
            config,
            parser,
            compiler,
            tags,
        }
    }

    /// Header files under the include directories (the source root when none
    /// are configured), filtered by the configured postfixes.
    pub fn listup_files(&self) -> Vec<PathBuf> {
        let roots = match self.config.include_dir.is_empty() {
            true => std::slice::from_ref(&self.config.srcdir),
            false => self.config.include_dir.as_slice(),
        };
        let mut files = Vec::new();
        for root in roots {
            walk(root, &mut files);
        }
        files.retain(|file| {
            let name = file.to_string_lossy();
            self.config
                .postfix
                .iter()
                .any(|postfix| name.ends_with(postfix.as_str()))
        });
        files.sort();
        files
    }

    /// The API universe, deduplicated by signature.
    pub fn listup_apis(&self) -> Result<Vec<ApiGadget>> {
        let mut seen = HashSet::new();
        let mut apis = Vec::new();
        for file in self.listup_files() {
            for gadget in self.parser.parse_api_gadget(&file)? {
                if seen.insert(gadget.signature()) {
                    apis.push(gadget);
                }
            }
        }
        Ok(apis)
    }

    pub fn listup_types(&self) -> Result<Vec<TypeGadget>> {
        let mut seen = HashSet::new();
        let mut types = Vec::new();
        for file in self.listup_files() {
            for gadget in self.parser.parse_type_gadget(&file)? {
                if seen.insert(gadget.signature()) {
                    types.push(gadget);
                }
            }
        }
        Ok(types)
    }

    /// Restrict the API universe to the compilable subset: each API gets a
    /// one-line harness test-compiled against its declaring header.
    pub fn precheck(
        &self,
        workdir: &Path,
        errfile: Option<&Path>,
    ) -> Result<Vec<ApiGadget>> {
        let scratch = workdir.join("precheck");
        std::fs::create_dir_all(&scratch)?;
        let source = scratch.join(format!("probe.{}", self.config.ext));

        let mut passed = Vec::new();
        for api in self.listup_apis()? {
            let Some(header) = api.meta.get("source") else {
                continue;
            };
            std::fs::write(
                &source,
                format!(
                    "#include <stdlib.h>\n#include <stdint.h>\n#include \"{header}\"\n\n\
                     extern \"C\" int LLVMFuzzerTestOneInput(const uint8_t* data, size_t size) {{\n\
                     (void){};\nreturn 0;\n}}\n",
                    api.name
                ),
            )?;
            match self.compiler.compile(&source, &scratch) {
                Ok(_) => passed.push(api),
                Err(err) => {
                    log::debug!("{}: COMPILE FAILURE", api.signature());
                    if let Some(errfile) = errfile {
                        let mut file = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(errfile)?;
                        writeln!(file, "{}: COMPILE FAILURE\n{err:#}\n", api.signature())?;
                    }
                }
            }
        }
        log::info!("precheck passed {} APIs", passed.len());
        Ok(passed)
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, files);
        } else {
            files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listup_files_filters_by_postfix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested"))?;
        std::fs::write(src.join("api.h"), "")?;
        std::fs::write(src.join("impl.c"), "")?;
        std::fs::write(src.join("nested/more.hpp"), "")?;

        let mut config = Config::test(dir.path());
        config.srcdir = src.clone();
        let project = Project {
            config,
            parser: ClangParser::new("clang++", &[]),
            compiler: ClangCompiler::new(&Config::test(dir.path())),
            tags: None,
        };
        let files = project.listup_files();
        assert_eq!(files, vec![src.join("api.h"), src.join("nested/more.hpp")]);
        Ok(())
    }
}
