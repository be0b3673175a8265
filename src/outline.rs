//! Outline assembly: flat parser symbols → a forest of outline nodes.
//!
//! The parser is an external collaborator ([`SourceParser`]). It reports, in
//! source order, each symbol's name, kind, line range, and the *name* of its
//! parent. [`build_outline`] resolves those names to concrete nodes:
//!
//! - an empty parent name makes the symbol a root;
//! - otherwise the candidates are all previously emitted nodes with that
//!   name, scanned newest first, and the first one whose line range contains
//!   the symbol's range becomes the parent (the nearest enclosing scope wins
//!   over an outer one with the same name);
//! - a symbol whose parent name is unknown, or whose range no candidate
//!   contains, becomes a root instead of being dropped.
//!
//! Node ids are derived from `(path, start, end, name)` only, so re-indexing
//! unchanged code yields the same ids and `nodeSource` lookups stay valid.
//!
//! The assembler knows nothing about languages and never fails: duplicate or
//! ambiguous names simply resolve by the rule above.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::models::{OutlineNode, OutlineTree};

/// A symbol as reported by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSymbol {
    pub name: String,
    pub kind: String,
    /// Name of the enclosing symbol, empty for top-level symbols.
    #[serde(default)]
    pub parent: String,
    pub start_line: i64,
    pub end_line: i64,
}

impl ParsedSymbol {
    pub fn new(name: &str, kind: &str, parent: &str, start_line: i64, end_line: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            parent: parent.to_string(),
            start_line,
            end_line,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub symbols: Vec<ParsedSymbol>,
    /// Recoverable parse errors; symbols found before/after them are still usable.
    pub errors: Vec<String>,
}

/// The source parser collaborator.
pub trait SourceParser: Send + Sync {
    fn parse_file(&self, path: &str, bytes: &[u8]) -> ParseOutput;
}

/// Deterministic node id: first 16 bytes of SHA-256 over the location and name, hex-encoded.
pub fn node_id(path: &str, start_line: i64, end_line: i64, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Build the outline forest of `path` from symbols in source order.
///
/// The result is flat, with every parent before its children and
/// `position` set to the node's index among its siblings.
pub fn build_outline(path: &str, symbols: &[ParsedSymbol]) -> Vec<OutlineNode> {
    let mut nodes: Vec<OutlineNode> = Vec::with_capacity(symbols.len());
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut sibling_counts: HashMap<Option<String>, i64> = HashMap::new();

    for sym in symbols {
        let parent_id = if sym.parent.is_empty() {
            None
        } else {
            by_name.get(sym.parent.as_str()).and_then(|candidates| {
                candidates
                    .iter()
                    .rev()
                    .map(|&i| &nodes[i])
                    .find(|cand| cand.start_line <= sym.start_line && sym.end_line <= cand.end_line)
                    .map(|cand| cand.id.clone())
            })
        };

        let counter = sibling_counts.entry(parent_id.clone()).or_insert(0);
        let position = *counter;
        *counter += 1;

        by_name.entry(sym.name.as_str()).or_default().push(nodes.len());
        nodes.push(OutlineNode {
            id: node_id(path, sym.start_line, sym.end_line, &sym.name),
            parent_id,
            name: sym.name.clone(),
            kind: sym.kind.clone(),
            start_line: sym.start_line,
            end_line: sym.end_line,
            position,
        });
    }

    nodes
}

/// Nest flat nodes into trees. Nodes whose parent is absent become roots;
/// siblings are ordered by `position`, then start line.
pub fn nest(nodes: &[OutlineNode]) -> Vec<OutlineTree> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let mut children: HashMap<&str, Vec<&OutlineNode>> = HashMap::new();
    let mut roots: Vec<&OutlineNode> = Vec::new();

    for node in nodes {
        match node.parent_id.as_deref() {
            Some(parent) if ids.contains(parent) && parent != node.id => {
                children.entry(parent).or_default().push(node)
            }
            _ => roots.push(node),
        }
    }

    let mut visited = HashSet::new();
    build_level(roots, &children, &mut visited)
}

fn build_level<'a>(
    mut level: Vec<&'a OutlineNode>,
    children: &HashMap<&str, Vec<&'a OutlineNode>>,
    visited: &mut HashSet<&'a str>,
) -> Vec<OutlineTree> {
    level.sort_by_key(|n| (n.position, n.start_line));
    let mut out = Vec::with_capacity(level.len());
    for node in level {
        if !visited.insert(node.id.as_str()) {
            continue;
        }
        let kids = children.get(node.id.as_str()).cloned().unwrap_or_default();
        out.push(OutlineTree {
            id: node.id.clone(),
            name: node.name.clone(),
            kind: node.kind.clone(),
            start_line: node.start_line,
            end_line: node.end_line,
            children: build_level(kids, children, visited),
        });
    }
    out
}

/// Keep `depth` levels of the forest: `1` drops every child, `2` keeps
/// children but drops grandchildren, and so on. `0` keeps everything.
pub fn truncate_depth(forest: &mut [OutlineTree], depth: usize) {
    if depth == 0 {
        return;
    }
    for node in forest.iter_mut() {
        if depth <= 1 {
            node.children.clear();
        } else {
            truncate_depth(&mut node.children, depth - 1);
        }
    }
}
