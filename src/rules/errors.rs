use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while compiling policy source into a rule table. Any of
/// these is fatal: a partially compiled table is never served.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(docguard::rules::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(docguard::rules::invalid_policy),
        help("Policy files contain `predicate` and `match` nodes; `match` blocks contain `allow` and nested `match` nodes")
    )]
    InvalidPolicy(String),

    #[error("Malformed pattern `{pattern}`: {reason}")]
    #[diagnostic(
        code(docguard::rules::malformed_pattern),
        help("Patterns are `/`-separated segments; `{{name}}` matches one segment, a final `{{name=**}}` matches the rest")
    )]
    MalformedPattern { pattern: String, reason: String },

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(docguard::rules::invalid_condition),
        help("Supported operators: ==, !=, <, <=, >, >=, +, -, &&, ||, !, in. Paths use dot notation (e.g. after.balance)")
    )]
    InvalidCondition(String),

    #[error("Unknown operation `{0}`")]
    #[diagnostic(
        code(docguard::rules::unknown_operation),
        help("Operations: get, list, create, update, delete, or the aliases read and write")
    )]
    UnknownOperation(String),

    #[error("Undefined predicate `{name}` referenced from `{referenced_from}`")]
    #[diagnostic(
        code(docguard::rules::undefined_predicate),
        help("Define the predicate with: predicate \"<name>\" \"<expression>\" before the rules that use it")
    )]
    UndefinedPredicate {
        name: String,
        referenced_from: String,
    },

    #[error("Predicate `{0}` is defined more than once")]
    #[diagnostic(code(docguard::rules::duplicate_predicate))]
    DuplicatePredicate(String),

    #[error("Cyclic predicate reference detected: {0}")]
    #[diagnostic(
        code(docguard::rules::predicate_cycle),
        help("Named predicates cannot call themselves, directly or through other predicates")
    )]
    PredicateCycle(String),

    #[error("Duplicate rule: `{operation}` is granted more than once on `{pattern}`")]
    #[diagnostic(
        code(docguard::rules::duplicate_rule),
        help("Combine the conditions into a single `allow` with `||`")
    )]
    DuplicateRule { pattern: String, operation: String },

    #[error("Variable `{variable}` is not bound by pattern `{pattern}`")]
    #[diagnostic(
        code(docguard::rules::unbound_variable),
        help("Bare identifiers refer to path variables; use principal, before, after or diff for request data")
    )]
    UnboundVariable { variable: String, pattern: String },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(docguard::rules::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(docguard::rules::io))]
    Io(#[from] std::io::Error),
}

/// Failure reported by a host-provided document source.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Raised during predicate evaluation. Never propagated: the affected
/// subexpression evaluates as absent and the failure is recorded on the
/// decision.
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("failed to fetch `{path}`: {source}")]
    Fetch {
        path: String,
        #[source]
        source: FetchError,
    },
}
