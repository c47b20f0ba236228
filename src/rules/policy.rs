use crate::rules::errors::CompileError;
use crate::rules::types::*;
use kdl::{KdlDocument, KdlNode};

/// Parse a KDL document string into policy source structs.
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, CompileError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| CompileError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "predicate" => {
                let args = string_args(node);
                let [name, body] = args.as_slice() else {
                    return Err(CompileError::InvalidPolicy(
                        "predicate node requires a name and an expression (e.g. predicate \"isSignedIn\" \"principal != null\")"
                            .into(),
                    ));
                };
                policy.predicates.push(PredicateDef {
                    name: name.clone(),
                    body: body.clone(),
                });
            }
            "match" => parse_match(node, "", &mut policy)?,
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

/// Flatten a `match` block and its nested blocks into `policy.matches`,
/// appending each nested pattern to its parent's.
fn parse_match(node: &KdlNode, prefix: &str, policy: &mut ParsedPolicy) -> Result<(), CompileError> {
    let segment = first_string_arg(node).ok_or_else(|| {
        CompileError::InvalidPolicy(
            "match node requires a pattern argument (e.g. match \"/users/{userId}\")".into(),
        )
    })?;
    let pattern = format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        segment.trim_start_matches('/')
    );

    let mut grants = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "allow" => grants.push(parse_allow(child, &pattern)?),
                "match" => parse_match(child, &pattern, policy)?,
                other => {
                    return Err(CompileError::InvalidPolicy(format!(
                        "unexpected child `{other}` in match `{pattern}` (expected `allow` or `match`)"
                    )));
                }
            }
        }
    }

    if !grants.is_empty() {
        policy.matches.push(PolicyMatch { pattern, grants });
    }
    Ok(())
}

/// `allow "get" "list" if="principal != null"`
fn parse_allow(node: &KdlNode, pattern: &str) -> Result<PolicyGrant, CompileError> {
    let names = string_args(node);
    if names.is_empty() {
        return Err(CompileError::InvalidPolicy(format!(
            "allow in match `{pattern}` names no operations (e.g. allow \"get\" if=\"principal != null\")"
        )));
    }

    let mut operations = Vec::new();
    for name in &names {
        let ops = Operation::expand(name)
            .ok_or_else(|| CompileError::UnknownOperation(name.clone()))?;
        operations.extend_from_slice(ops);
    }

    let condition = match node.get("if") {
        Some(value) => Some(
            value
                .as_string()
                .ok_or_else(|| {
                    CompileError::InvalidPolicy(format!(
                        "`if` in match `{pattern}` must be a string expression"
                    ))
                })?
                .to_string(),
        ),
        None => None,
    };

    Ok(PolicyGrant {
        operations,
        condition,
    })
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// All positional string arguments of a node.
fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}
