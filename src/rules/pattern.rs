//! Rule path patterns and the index used to find every pattern matching a
//! concrete document path.
//!
//! Pattern syntax: `/`-separated segments where `{name}` binds exactly one
//! segment and a final `{name=**}` binds the remaining suffix (possibly
//! empty).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::rules::errors::CompileError;
use crate::rules::types::DocPath;

/// Path variable name -> bound value. A recursive wildcard binds the
/// matched suffix joined with `/`.
pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Wildcard(String),
    Recursive(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePattern {
    segments: Vec<Segment>,
}

impl RulePattern {
    pub fn parse(source: &str) -> Result<Self, CompileError> {
        let malformed = |reason: &str| CompileError::MalformedPattern {
            pattern: source.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = source.trim().trim_start_matches('/');
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(malformed("pattern has no segments"));
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                return Err(malformed("empty segment"));
            }
            if matches!(segments.last(), Some(Segment::Recursive(_))) {
                return Err(malformed("recursive wildcard must be the last segment"));
            }

            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(inner) => match inner.strip_suffix("=**") {
                    Some(name) => Segment::Recursive(name.to_string()),
                    None => Segment::Wildcard(inner.to_string()),
                },
                None => {
                    if raw.contains(['{', '}']) {
                        return Err(malformed(&format!("stray brace in segment `{raw}`")));
                    }
                    Segment::Literal(raw.to_string())
                }
            };

            if let Segment::Wildcard(name) | Segment::Recursive(name) = &segment {
                if !is_identifier(name) {
                    return Err(malformed(&format!("invalid variable name `{name}`")));
                }
                let taken = segments.iter().any(|s| match s {
                    Segment::Wildcard(n) | Segment::Recursive(n) => n == name,
                    Segment::Literal(_) => false,
                });
                if taken {
                    return Err(malformed(&format!("variable `{name}` is bound twice")));
                }
            }
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn binds(&self, variable: &str) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Wildcard(n) | Segment::Recursive(n) => n == variable,
            Segment::Literal(_) => false,
        })
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Recursive(_)))
    }

    /// The pattern with variable names erased, e.g. `/users/{}/{**}`. Two
    /// patterns with the same shape match exactly the same paths.
    pub fn shape(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => format!("/{lit}"),
                Segment::Wildcard(_) => "/{}".to_string(),
                Segment::Recursive(_) => "/{**}".to_string(),
            })
            .collect()
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Match a concrete path segment by segment, binding wildcard names.
    pub fn matches(&self, path: &DocPath) -> Option<Bindings> {
        let concrete = path.segments();
        let mut bindings = Bindings::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Recursive(name) => {
                    let rest = concrete.get(i..)?;
                    bindings.insert(name.clone(), rest.join("/"));
                    return Some(bindings);
                }
                Segment::Literal(lit) => {
                    if concrete.get(i)? != lit {
                        return None;
                    }
                }
                Segment::Wildcard(name) => {
                    bindings.insert(name.clone(), concrete.get(i)?.clone());
                }
            }
        }

        (concrete.len() == self.segments.len()).then_some(bindings)
    }
}

impl fmt::Display for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => write!(f, "/{lit}")?,
                Segment::Wildcard(name) => write!(f, "/{{{name}}}")?,
                Segment::Recursive(name) => write!(f, "/{{{name}=**}}")?,
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Literal-segment trie over compiled patterns. Single-segment wildcards
/// share one edge per level; recursive wildcards hang off the node where
/// the suffix starts.
#[derive(Debug, Default)]
pub struct PatternIndex {
    root: TrieNode,
}

#[derive(Debug, Default)]
struct TrieNode {
    literals: HashMap<String, TrieNode>,
    wildcard: Option<Box<TrieNode>>,
    /// Patterns ending exactly here.
    terminal: Vec<usize>,
    /// Recursive patterns whose suffix starts here.
    recursive: Vec<usize>,
}

impl PatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: &RulePattern, id: usize) {
        let mut node = &mut self.root;
        for segment in pattern.segments() {
            node = match segment {
                Segment::Literal(lit) => node.literals.entry(lit.clone()).or_default(),
                Segment::Wildcard(_) => node.wildcard.get_or_insert_with(Box::default).as_mut(),
                Segment::Recursive(_) => {
                    node.recursive.push(id);
                    return;
                }
            };
        }
        node.terminal.push(id);
    }

    /// Ids of every pattern that can match `path`, ascending.
    pub fn candidates(&self, path: &DocPath) -> Vec<usize> {
        let mut out = Vec::new();
        collect(&self.root, path.segments(), &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }
}

fn collect(node: &TrieNode, rest: &[String], out: &mut Vec<usize>) {
    out.extend_from_slice(&node.recursive);
    let Some((head, tail)) = rest.split_first() else {
        out.extend_from_slice(&node.terminal);
        return;
    };
    if let Some(child) = node.literals.get(head) {
        collect(child, tail, out);
    }
    if let Some(child) = &node.wildcard {
        collect(child, tail, out);
    }
}
