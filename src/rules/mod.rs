pub mod condition;
pub mod diff;
pub mod engine;
pub mod errors;
pub mod eval;
pub mod loader;
pub mod pattern;
pub mod policy;
pub mod types;
pub mod web;

use condition::Expr;
use pattern::{Bindings, PatternIndex, RulePattern};
use types::{DocPath, Operation};

/// Fully compiled rule table, loaded from KDL policy files.
/// Immutable after construction and shared by reference across concurrent
/// decisions; policy changes require a reload.
#[derive(Debug)]
pub struct RuleTable {
    /// Sorted most specific first.
    pub(crate) entries: Vec<RuleEntry>,
    /// Named predicates in definition order; `Expr::Predicate(i)` refers to slot `i`.
    pub(crate) predicates: Vec<NamedPredicate>,
    pub(crate) index: PatternIndex,
}

/// One path pattern with at most one predicate per operation.
#[derive(Debug)]
pub struct RuleEntry {
    /// Normalized pattern string, e.g. `/users/{userId}`.
    pub id: String,
    pub pattern: RulePattern,
    pub(crate) grants: [Option<Expr>; 5],
}

impl RuleEntry {
    pub fn predicate(&self, operation: Operation) -> Option<&Expr> {
        self.grants[operation.slot()].as_ref()
    }

    pub fn operations(&self) -> Vec<Operation> {
        Operation::ALL
            .into_iter()
            .filter(|op| self.grants[op.slot()].is_some())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NamedPredicate {
    pub name: String,
    pub expr: Expr,
}

impl RuleTable {
    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn predicates(&self) -> &[NamedPredicate] {
        &self.predicates
    }

    pub fn entry(&self, id: &str) -> Option<&RuleEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Every entry whose pattern matches `path`, most specific first, with
    /// the variables each one binds.
    pub fn matching(&self, path: &DocPath) -> Vec<(&RuleEntry, Bindings)> {
        self.index
            .candidates(path)
            .into_iter()
            .filter_map(|i| {
                let entry = &self.entries[i];
                entry.pattern.matches(path).map(|b| (entry, b))
            })
            .collect()
    }
}
