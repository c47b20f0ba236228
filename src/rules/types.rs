use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// A document: field name -> typed value.
pub type Snapshot = Map<String, Value>;

/// Top-level field keys whose values differ between two snapshots.
pub type AffectedKeys = BTreeSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Get,
        Operation::List,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Expand an operation name as written in policy source. `read` and
    /// `write` are shorthands for several operations.
    pub fn expand(name: &str) -> Option<&'static [Operation]> {
        match name {
            "get" => Some(&[Operation::Get]),
            "list" => Some(&[Operation::List]),
            "create" => Some(&[Operation::Create]),
            "update" => Some(&[Operation::Update]),
            "delete" => Some(&[Operation::Delete]),
            "read" => Some(&[Operation::Get, Operation::List]),
            "write" => Some(&[Operation::Create, Operation::Update, Operation::Delete]),
            _ => None,
        }
    }

    /// Operations whose predicates may inspect the field diff.
    pub fn computes_diff(&self) -> bool {
        matches!(self, Operation::Create | Operation::Update)
    }

    pub(crate) fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller. An unauthenticated caller is represented by the
/// absence of a `Principal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }
}

/// Concrete document path: "users/u1" -> ["users", "u1"]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// Leading and trailing `/` are ignored. Empty paths and empty
    /// segments (`a//b`) are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// Outcome of a single access decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub effect: Effect,
    /// Rule entry that produced the ALLOW, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    /// Evaluation failures recorded while deciding (failed document fetches).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl Decision {
    pub fn allow(rule: impl Into<String>) -> Self {
        Self {
            effect: Effect::Allow,
            matched_rule: Some(rule.into()),
            failures: Vec::new(),
        }
    }

    pub fn deny() -> Self {
        Self {
            effect: Effect::Deny,
            matched_rule: None,
            failures: Vec::new(),
        }
    }

    pub fn with_failures(mut self, failures: Vec<String>) -> Self {
        self.failures = failures;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub operation: Operation,
    /// e.g. "users/u1"
    pub path: String,
    #[serde(default)]
    pub principal: Option<Principal>,
    #[serde(default)]
    pub before: Option<Snapshot>,
    #[serde(default)]
    pub after: Option<Snapshot>,
    /// Point-in-time snapshots of other documents, served to `fetch()`.
    #[serde(default)]
    pub documents: HashMap<String, Snapshot>,
}

#[derive(Debug, Serialize)]
pub struct RuleSummary {
    pub id: String,
    pub operations: Vec<Operation>,
}

// ---------- Policy source types ----------

/// `allow "get" "list" if="..."`
#[derive(Debug, Clone)]
pub struct PolicyGrant {
    pub operations: Vec<Operation>,
    /// Raw predicate source; `None` grants unconditionally.
    pub condition: Option<String>,
}

/// A `match` block flattened to its full pattern.
#[derive(Debug, Clone)]
pub struct PolicyMatch {
    pub pattern: String,
    pub grants: Vec<PolicyGrant>,
}

#[derive(Debug, Clone)]
pub struct PredicateDef {
    pub name: String,
    pub body: String,
}

/// Intermediate result from parsing a single KDL file.
#[derive(Debug, Clone, Default)]
pub struct ParsedPolicy {
    pub predicates: Vec<PredicateDef>,
    pub matches: Vec<PolicyMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_path_parse() {
        let p = DocPath::parse("/users/u1/").unwrap();
        assert_eq!(p.segments(), &["users".to_string(), "u1".to_string()]);
        assert_eq!(p.to_string(), "users/u1");

        assert!(DocPath::parse("").is_none());
        assert!(DocPath::parse("/").is_none());
        assert!(DocPath::parse("users//u1").is_none());
    }

    #[test]
    fn test_operation_aliases() {
        assert_eq!(
            Operation::expand("read").unwrap(),
            &[Operation::Get, Operation::List]
        );
        assert_eq!(Operation::expand("write").unwrap().len(), 3);
        assert!(Operation::expand("fetch").is_none());
    }

    #[test]
    fn test_decision_serialization() {
        let allow = serde_json::to_value(Decision::allow("/users/{userId}")).unwrap();
        assert_eq!(
            allow,
            json!({ "effect": "allow", "matched_rule": "/users/{userId}" })
        );

        let deny = serde_json::to_value(Decision::deny()).unwrap();
        assert_eq!(deny, json!({ "effect": "deny" }));
    }

    #[test]
    fn test_decide_request_defaults() {
        let req: DecideRequest =
            serde_json::from_value(json!({ "operation": "list", "path": "users" })).unwrap();
        assert_eq!(req.operation, Operation::List);
        assert!(req.principal.is_none());
        assert!(req.before.is_none());
        assert!(req.documents.is_empty());
    }
}
