use std::collections::HashSet;
use std::path::Path;

use eyre::{eyre, Context, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use tree_sitter::{Node, Parser};

use crate::analysis::CriticalPath;
use crate::gadget::ApiGadget;

/// Entry function of a libFuzzer harness.
pub const FUZZER_ENTRYPOINT: &str = "LLVMFuzzerTestOneInput";

/// Upper bound on enumerated control-flow paths per harness.
const MAX_PATHS: usize = 256;

type Call = (String, u32);

/// Extract every maximal call path through the control-flow graph of the
/// `target` function (the libFuzzer entry point by default).
///
/// Paths are projected onto `gadgets` when non-empty; only the paths with the
/// maximum number of projected calls survive, deduplicated, empty projections
/// dropped. Loop bodies are walked once and back edges discarded, so the
/// graph is acyclic.
pub fn extract_critical_path(
    source: &Path,
    gadgets: &[ApiGadget],
    target: Option<&str>,
) -> Result<Vec<CriticalPath>> {
    let code = std::fs::read_to_string(source)
        .with_context(|| format!("cannot read the harness source {source:?}"))?;
    let target = target.unwrap_or(FUZZER_ENTRYPOINT);

    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_cpp::language())
        .map_err(|err| eyre!("failed to load the C++ grammar: {err}"))?;
    let tree = parser
        .parse(&code, None)
        .ok_or_else(|| eyre!("failed to parse the harness source {source:?}"))?;

    let function = find_function(tree.root_node(), code.as_bytes(), target)
        .ok_or_else(|| eyre!("no function `{target}` in {source:?}"))?;
    let body = function
        .child_by_field_name("body")
        .ok_or_else(|| eyre!("function `{target}` has no body"))?;

    let mut builder = CfgBuilder::new(code.as_bytes());
    let (entry, exit) = builder.sequence(named_children(body));
    let paths = builder.enumerate(entry, exit);

    // project onto the names of the given gadgets
    let names: HashSet<&str> = gadgets.iter().map(|gadget| gadget.name.as_str()).collect();
    let projected: Vec<CriticalPath> = paths
        .into_iter()
        .map(|path| {
            path.into_iter()
                .filter(|(name, _)| names.is_empty() || names.contains(name.as_str()))
                .map(|(name, lineno)| (name, Some(lineno)))
                .collect::<CriticalPath>()
        })
        .filter(|path| !path.is_empty())
        .collect();

    let longest = projected.iter().map(Vec::len).max().unwrap_or(0);
    let mut seen = HashSet::new();
    Ok(projected
        .into_iter()
        .filter(|path| path.len() == longest)
        .filter(|path| seen.insert(path.clone()))
        .collect())
}

/// Locate a `function_definition` whose declarator names `target`.
fn find_function<'t>(root: Node<'t>, source: &[u8], target: &str) -> Option<Node<'t>> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.kind() == "function_definition" {
            if let Some(declarator) = node.child_by_field_name("declarator") {
                if declared_name(declarator, source).as_deref() == Some(target) {
                    return Some(node);
                }
            }
        }
        for i in (0..node.child_count()).rev() {
            stack.extend(node.child(i));
        }
    }
    None
}

/// First identifier inside a declarator, skipping pointers and qualifiers.
fn declared_name(declarator: Node, source: &[u8]) -> Option<String> {
    let mut stack = vec![declarator];
    while let Some(node) = stack.pop() {
        if matches!(node.kind(), "identifier" | "field_identifier") {
            return node.utf8_text(source).ok().map(str::to_string);
        }
        for i in (0..node.child_count()).rev() {
            stack.extend(node.child(i));
        }
    }
    None
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    let children = node.named_children(&mut cursor).collect::<Vec<_>>();
    children
}

/// Reduce a spelled callee to a plain gadget name: drop template arguments,
/// qualifiers and member access, e.g. `ns::parse<int>` becomes `parse`.
fn resolve_name(raw: &str) -> String {
    let raw = raw.trim();
    let raw = match raw.find('<') {
        Some(i) if !raw.starts_with("operator") => &raw[..i],
        _ => raw,
    };
    let raw = raw.rsplit("::").next().unwrap_or(raw);
    let raw = raw.rsplit('.').next().unwrap_or(raw);
    let raw = raw.rsplit("->").next().unwrap_or(raw);
    raw.trim_matches(|char_: char| !char_.is_alphanumeric() && char_ != '_')
        .to_string()
}

struct CfgBuilder<'s> {
    source: &'s [u8],
    graph: DiGraph<Vec<Call>, ()>,
}

impl<'s> CfgBuilder<'s> {
    fn new(source: &'s [u8]) -> Self {
        Self {
            source,
            graph: DiGraph::new(),
        }
    }

    fn block(&mut self, calls: Vec<Call>) -> NodeIndex {
        self.graph.add_node(calls)
    }

    fn link(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.add_edge(from, to, ());
    }

    /// Chain the given statements into one linear segment.
    fn sequence(&mut self, statements: Vec<Node>) -> (NodeIndex, NodeIndex) {
        let entry = self.block(Vec::new());
        let mut tail = entry;
        for statement in statements {
            let (sub_entry, sub_exit) = self.statement(statement);
            self.link(tail, sub_entry);
            tail = sub_exit;
        }
        (entry, tail)
    }

    fn statement(&mut self, node: Node) -> (NodeIndex, NodeIndex) {
        match node.kind() {
            "compound_statement" => self.sequence(named_children(node)),
            "if_statement" => {
                let cond = self.block(self.calls_of_opt(node.child_by_field_name("condition")));
                let join = self.block(Vec::new());
                if let Some(consequence) = node.child_by_field_name("consequence") {
                    let (entry, exit) = self.statement(consequence);
                    self.link(cond, entry);
                    self.link(exit, join);
                }
                match node.child_by_field_name("alternative") {
                    Some(alternative) => {
                        // unwrap an `else_clause` wrapper if the grammar adds one
                        let alternative = match alternative.kind() {
                            "else_clause" => alternative.named_child(0).unwrap_or(alternative),
                            _ => alternative,
                        };
                        let (entry, exit) = self.statement(alternative);
                        self.link(cond, entry);
                        self.link(exit, join);
                    }
                    None => self.link(cond, join),
                }
                (cond, join)
            }
            "while_statement" | "for_statement" | "for_range_loop" => {
                let header = self.header_calls(node);
                let cond = self.block(header);
                let join = self.block(Vec::new());
                if let Some(body) = node.child_by_field_name("body") {
                    let (entry, exit) = self.statement(body);
                    self.link(cond, entry);
                    self.link(exit, join);
                }
                // zero-iteration pass, no back edge
                self.link(cond, join);
                (cond, join)
            }
            "do_statement" => {
                let join = self.block(self.calls_of_opt(node.child_by_field_name("condition")));
                match node.child_by_field_name("body") {
                    Some(body) => {
                        let (entry, exit) = self.statement(body);
                        self.link(exit, join);
                        (entry, join)
                    }
                    None => (join, join),
                }
            }
            "switch_statement" => {
                let cond = self.block(self.calls_of_opt(node.child_by_field_name("condition")));
                let join = self.block(Vec::new());
                let mut cases = Vec::new();
                if let Some(body) = node.child_by_field_name("body") {
                    cases = named_children(body)
                        .into_iter()
                        .filter(|child| child.kind() == "case_statement")
                        .collect();
                }
                if cases.is_empty() {
                    self.link(cond, join);
                } else {
                    for case in cases {
                        let statements = named_children(case)
                            .into_iter()
                            .filter(|child| Some(*child) != case.child_by_field_name("value"))
                            .collect();
                        let (entry, exit) = self.sequence(statements);
                        self.link(cond, entry);
                        self.link(exit, join);
                    }
                }
                (cond, join)
            }
            _ => {
                let block = self.block(self.calls_of(node));
                (block, block)
            }
        }
    }

    /// Calls spelled in a loop header (everything but the body).
    fn header_calls(&self, node: Node) -> Vec<Call> {
        let body = node.child_by_field_name("body");
        let mut calls = Vec::new();
        for i in 0..node.child_count() {
            let Some(child) = node.child(i) else { continue };
            if Some(child) == body {
                continue;
            }
            calls.extend(self.calls_of(child));
        }
        calls
    }

    fn calls_of_opt(&self, node: Option<Node>) -> Vec<Call> {
        node.map(|node| self.calls_of(node)).unwrap_or_default()
    }

    /// Every call expression under `node`, pre-order.
    fn calls_of(&self, node: Node) -> Vec<Call> {
        let mut calls = Vec::new();
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if node.kind() == "call_expression" {
                if let Some(function) = node.child_by_field_name("function") {
                    if let Ok(text) = function.utf8_text(self.source) {
                        let name = resolve_name(text);
                        if !name.is_empty() {
                            calls.push((name, node.start_position().row as u32 + 1));
                        }
                    }
                }
            }
            for i in (0..node.child_count()).rev() {
                stack.extend(node.child(i));
            }
        }
        calls
    }

    /// All call sequences along entry-to-exit paths, capped at `MAX_PATHS`.
    fn enumerate(&self, entry: NodeIndex, exit: NodeIndex) -> Vec<Vec<Call>> {
        let mut paths = Vec::new();
        let mut stack = vec![(entry, self.graph[entry].clone())];
        while let Some((node, calls)) = stack.pop() {
            if node == exit {
                paths.push(calls);
                if paths.len() >= MAX_PATHS {
                    break;
                }
                continue;
            }
            for succ in self.graph.neighbors(node) {
                let mut extended = calls.clone();
                extended.extend(self.graph[succ].iter().cloned());
                stack.push((succ, extended));
            }
        }
        paths
    }
}
