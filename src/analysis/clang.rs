use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use eyre::{Context, Result};
use serde::Deserialize;

use crate::analysis::{cfg, AstParser, CriticalPath};
use crate::gadget::{ApiGadget, TypeGadget, TypeTag};

pub type Node = clang_ast::Node<Clang>;

/// Node kinds relevant to gadget extraction; everything else is traversed
/// through `Other`.
#[derive(Debug, Deserialize)]
pub enum Clang {
    FunctionDecl(FunctionDecl),
    ParmVarDecl(ParmVarDecl),
    TypedefDecl(TypedefDecl),
    TypeAliasDecl(TypedefDecl),
    CXXRecordDecl(CxxRecordDecl),
    Other,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDecl {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<QualType>,
    pub loc: Option<clang_ast::SourceLocation>,
    #[serde(rename = "mangledName")]
    pub mangled_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParmVarDecl {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<QualType>,
}

#[derive(Debug, Deserialize)]
pub struct TypedefDecl {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<QualType>,
    pub loc: Option<clang_ast::SourceLocation>,
}

#[derive(Debug, Deserialize)]
pub struct CxxRecordDecl {
    pub name: Option<String>,
    #[serde(rename = "tagUsed")]
    pub tag_used: Option<String>,
    pub loc: Option<clang_ast::SourceLocation>,
}

#[derive(Debug, Deserialize)]
pub struct QualType {
    #[serde(rename = "qualType")]
    pub qual_type: String,
}

/// Clang `-ast-dump=json` based static analysis for C/C++ sources.
pub struct ClangParser {
    clang: String,
    include_dir: Vec<PathBuf>,
    // bounded FIFO cache of parsed dumps
    cache: RefCell<(Vec<PathBuf>, HashMap<PathBuf, Rc<Node>>)>,
    max_cache: usize,
}

impl ClangParser {
    pub fn new(clang: &str, include_dir: &[PathBuf]) -> Self {
        Self {
            clang: clang.to_string(),
            include_dir: include_dir.to_vec(),
            cache: RefCell::new((Vec::new(), HashMap::new())),
            max_cache: 500,
        }
    }

    fn dump_ast(&self, source: &Path) -> Result<Rc<Node>> {
        if let Some(cached) = self.cache.borrow().1.get(source) {
            return Ok(Rc::clone(cached));
        }
        let mut cmd = Command::new(&self.clang);
        cmd.arg("-fsyntax-only").arg("-Xclang").arg("-ast-dump=json");
        for dir in &self.include_dir {
            cmd.arg("-I").arg(dir);
        }
        let output = cmd
            .arg(source)
            .output()
            .with_context(|| format!("failed to spawn {}", self.clang))?;
        let node: Node = serde_json::from_slice(&output.stdout).with_context(|| {
            format!(
                "cannot parse the ast dump of {source:?}: {}",
                String::from_utf8_lossy(&output.stderr)
            )
        })?;
        let node = Rc::new(node);
        let mut cache = self.cache.borrow_mut();
        if cache.0.len() >= self.max_cache {
            let eldest = cache.0.remove(0);
            cache.1.remove(&eldest);
        }
        cache.0.push(source.to_path_buf());
        cache.1.insert(source.to_path_buf(), Rc::clone(&node));
        Ok(node)
    }

    /// The file a node was spelled in, as clang printed it.
    fn node_file(loc: &Option<clang_ast::SourceLocation>) -> Option<PathBuf> {
        let loc = loc.as_ref()?;
        let spelling = loc.spelling_loc.as_ref()?;
        Some(PathBuf::from(&*spelling.file))
    }

    /// Nodes with no recorded file belong to the main file of the dump.
    fn declared_in(loc: &Option<clang_ast::SourceLocation>, source: &Path) -> bool {
        match Self::node_file(loc) {
            None => true,
            Some(file) => file == source,
        }
    }

    /// Split a clang-printed function type into its return and argument
    /// parts, e.g. `"int (const char *, size_t)"`.
    fn split_function_type(qual_type: &str) -> Option<(String, String, String)> {
        let open = qual_type.find('(')?;
        let mut depth = 0usize;
        let mut close = None;
        for (offset, char_) in qual_type[open..].char_indices() {
            match char_ {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + offset);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close?;
        Some((
            qual_type[..open].trim().to_string(),
            qual_type[open + 1..close].trim().to_string(),
            qual_type[close + 1..].trim().to_string(),
        ))
    }
}

impl AstParser for ClangParser {
    fn parse_api_gadget(&self, source: &Path) -> Result<Vec<ApiGadget>> {
        let top = self.dump_ast(source)?;
        let mut gadgets = Vec::new();
        let mut stack: Vec<&Node> = top.inner.iter().collect();
        while let Some(node) = stack.pop() {
            let Clang::FunctionDecl(decl) = &node.kind else {
                stack.extend(node.inner.iter());
                continue;
            };
            if !Self::declared_in(&decl.loc, source) {
                continue;
            }
            let (Some(name), Some(ty)) = (&decl.name, &decl.ty) else {
                continue;
            };
            let Some((return_type, args_type, post_qualifier)) =
                Self::split_function_type(&ty.qual_type)
            else {
                continue;
            };
            let mut arguments: Vec<(Option<String>, String)> = node
                .inner
                .iter()
                .filter_map(|subnode| match &subnode.kind {
                    Clang::ParmVarDecl(param) => Some((
                        param.name.clone(),
                        param
                            .ty
                            .as_ref()
                            .map(|ty| ty.qual_type.clone())
                            .unwrap_or_default(),
                    )),
                    _ => None,
                })
                .collect();
            if args_type.ends_with("...") {
                arguments.push((None, "...".to_string()));
            }
            let mut gadget = ApiGadget::new(name, &return_type, arguments)
                .with_meta("source", &source.to_string_lossy())
                .with_meta("post_qualifier", &post_qualifier);
            if let Some(mangled) = &decl.mangled_name {
                gadget = gadget.with_meta("mangled", mangled);
            }
            gadgets.push(gadget);
        }
        Ok(gadgets)
    }

    fn parse_type_gadget(&self, source: &Path) -> Result<Vec<TypeGadget>> {
        let top = self.dump_ast(source)?;
        let mut gadgets = Vec::new();
        let mut stack: Vec<&Node> = top.inner.iter().collect();
        while let Some(node) = stack.pop() {
            let (name, tag, qualified, kind, loc) = match &node.kind {
                Clang::TypedefDecl(decl) => (
                    &decl.name,
                    TypeTag::Alias,
                    decl.ty.as_ref().map(|ty| ty.qual_type.clone()),
                    "TypedefDecl",
                    &decl.loc,
                ),
                Clang::TypeAliasDecl(decl) => (
                    &decl.name,
                    TypeTag::Alias,
                    decl.ty.as_ref().map(|ty| ty.qual_type.clone()),
                    "TypeAliasDecl",
                    &decl.loc,
                ),
                Clang::CXXRecordDecl(decl) => {
                    let tag = match decl.tag_used.as_deref() {
                        Some("class") => TypeTag::Class,
                        _ => TypeTag::Struct,
                    };
                    // nested type declarations, excluding the implicit
                    // self-reference a record keeps in its inner nodes
                    stack.extend(node.inner.iter().filter(|inner| {
                        !matches!(&inner.kind, Clang::CXXRecordDecl(sub) if sub.name == decl.name)
                    }));
                    (&decl.name, tag, None, "CXXRecordDecl", &decl.loc)
                }
                _ => {
                    stack.extend(node.inner.iter());
                    continue;
                }
            };
            if !Self::declared_in(loc, source) {
                continue;
            }
            let Some(name) = name else { continue };
            let gadget = TypeGadget::new(name, tag, qualified.as_deref())
                .with_meta("kind", kind)
                .with_meta("source", &source.to_string_lossy());
            gadgets.push(gadget);
        }
        Ok(gadgets)
    }

    fn extract_critical_path(
        &self,
        source: &Path,
        gadgets: &[ApiGadget],
        target: Option<&str>,
    ) -> Result<Vec<CriticalPath>> {
        cfg::extract_critical_path(source, gadgets, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_function_type() {
        let (ret, args, post) =
            ClangParser::split_function_type("int (const char *, size_t)").unwrap();
        assert_eq!(ret, "int");
        assert_eq!(args, "const char *, size_t");
        assert_eq!(post, "");

        // function pointer argument keeps its nested parenthesis
        let (ret, args, _) =
            ClangParser::split_function_type("void (void (*)(int), ...)").unwrap();
        assert_eq!(ret, "void");
        assert_eq!(args, "void (*)(int), ...");

        assert!(ClangParser::split_function_type("int").is_none());
    }

    #[test]
    fn test_split_function_type_post_qualifier() {
        let (_, _, post) =
            ClangParser::split_function_type("int (int) __attribute__((cdecl))").unwrap();
        assert_eq!(post, "__attribute__((cdecl))");
    }
}
