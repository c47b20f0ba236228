use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::rules::condition::{parse_condition, Expr, LitValue};
use crate::rules::errors::CompileError;
use crate::rules::pattern::{PatternIndex, RulePattern};
use crate::rules::policy::parse_kdl_document;
use crate::rules::types::*;
use crate::rules::{NamedPredicate, RuleEntry, RuleTable};

/// Load policy source from a `.kdl` file, or from every `.kdl` file in a
/// directory (in path order), and compile it into a single immutable
/// `RuleTable`.
pub fn load_policies(path: &Path) -> Result<RuleTable, CompileError> {
    let files = if path.is_dir() {
        kdl_files(std::fs::read_dir(path)?.map(|e| e.map(|e| e.path())))?
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(CompileError::InvalidPolicy(format!(
            "policy path `{}` does not exist",
            path.display()
        )));
    };

    let mut all_parsed = Vec::new();
    for file in &files {
        let contents =
            std::fs::read_to_string(file).map_err(|source| CompileError::PolicyLoad {
                path: file.display().to_string(),
                source,
            })?;
        all_parsed.push(parse_kdl_document(&contents)?);
    }

    let table = compile_policies(all_parsed)?;

    tracing::info!(
        files = files.len(),
        rules = table.entries.len(),
        predicates = table.predicates.len(),
        "Loaded access policies"
    );

    Ok(table)
}

/// Sorted `.kdl` paths from a directory listing. An entry that cannot be
/// read fails the whole load.
fn kdl_files(
    entries: impl IntoIterator<Item = io::Result<PathBuf>>,
) -> Result<Vec<PathBuf>, CompileError> {
    let mut files = entries.into_iter().collect::<Result<Vec<_>, _>>()?;
    files.retain(|p| p.extension().map(|ext| ext == "kdl").unwrap_or(false));
    files.sort();
    Ok(files)
}

/// Parse and compile a single KDL policy document.
pub fn compile_source(source: &str) -> Result<RuleTable, CompileError> {
    compile_policies(vec![parse_kdl_document(source)?])
}

/// Merge and compile parsed policies into a single `RuleTable`.
pub fn compile_policies(parsed: Vec<ParsedPolicy>) -> Result<RuleTable, CompileError> {
    let mut definitions: Vec<PredicateDef> = Vec::new();
    let mut matches: Vec<PolicyMatch> = Vec::new();
    for p in parsed {
        definitions.extend(p.predicates);
        matches.extend(p.matches);
    }

    let predicates = compile_predicates(definitions)?;
    let slots: HashMap<&str, usize> = predicates
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    // Merge grants per normalized pattern, keeping first-declaration order
    let mut entries: Vec<RuleEntry> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    // (shape, operation) already granted; `/users/{a}` and `/users/{b}` share a shape
    let mut granted: HashSet<(String, Operation)> = HashSet::new();
    for m in matches {
        let pattern = RulePattern::parse(&m.pattern)?;
        let id = pattern.to_string();
        let shape = pattern.shape();
        let pos = *by_id.entry(id.clone()).or_insert_with(|| {
            entries.push(RuleEntry {
                id: id.clone(),
                pattern: pattern.clone(),
                grants: Default::default(),
            });
            entries.len() - 1
        });

        for grant in m.grants {
            let mut expr = match &grant.condition {
                Some(source) => parse_condition(source)?,
                None => Expr::Literal(LitValue::Bool(true)),
            };
            if let Some(variable) = expr.variables().into_iter().find(|v| !pattern.binds(v)) {
                return Err(CompileError::UnboundVariable {
                    variable: variable.to_string(),
                    pattern: id,
                });
            }
            resolve_calls(&mut expr, &id, &|name| slots.get(name).copied())?;

            for op in grant.operations {
                if !granted.insert((shape.clone(), op)) {
                    return Err(CompileError::DuplicateRule {
                        pattern: id,
                        operation: op.to_string(),
                    });
                }
                entries[pos].grants[op.slot()] = Some(expr.clone());
            }
        }
    }

    entries.sort_by_key(|e| {
        (
            e.pattern.is_recursive(),
            std::cmp::Reverse(e.pattern.literal_count()),
            std::cmp::Reverse(e.pattern.segments().len()),
        )
    });

    let mut index = PatternIndex::new();
    for (i, entry) in entries.iter().enumerate() {
        index.insert(&entry.pattern, i);
    }

    Ok(RuleTable {
        entries,
        predicates,
        index,
    })
}

/// Parse named predicates and resolve their calls. A predicate may only
/// call predicates defined before it.
fn compile_predicates(definitions: Vec<PredicateDef>) -> Result<Vec<NamedPredicate>, CompileError> {
    let mut order: HashMap<String, usize> = HashMap::new();
    let mut parsed = Vec::with_capacity(definitions.len());
    for (i, def) in definitions.into_iter().enumerate() {
        if order.insert(def.name.clone(), i).is_some() {
            return Err(CompileError::DuplicatePredicate(def.name));
        }
        let expr = parse_condition(&def.body)?;
        parsed.push(NamedPredicate {
            name: def.name,
            expr,
        });
    }

    {
        // Call graph: name -> callees
        let mut calls: HashMap<&str, Vec<&str>> = HashMap::new();
        for p in &parsed {
            let callees = p.expr.called_predicates();
            for callee in &callees {
                if !order.contains_key(*callee) {
                    return Err(CompileError::UndefinedPredicate {
                        name: callee.to_string(),
                        referenced_from: p.name.clone(),
                    });
                }
            }
            calls.insert(p.name.as_str(), callees);
        }
        check_predicate_cycles(&parsed, &calls)?;
    }

    let mut resolved = Vec::with_capacity(parsed.len());
    for (i, mut p) in parsed.into_iter().enumerate() {
        // Acyclic, so any remaining reference to a later definition is a
        // forward reference.
        let name = p.name.clone();
        resolve_calls(&mut p.expr, &name, &|callee| {
            order.get(callee).copied().filter(|&slot| slot < i)
        })?;
        resolved.push(p);
    }
    Ok(resolved)
}

/// Rewrite every `Expr::Call` into `Expr::Predicate(slot)`.
fn resolve_calls(
    expr: &mut Expr,
    referenced_from: &str,
    lookup: &dyn Fn(&str) -> Option<usize>,
) -> Result<(), CompileError> {
    if let Expr::Call(name) = expr {
        let slot = lookup(name).ok_or_else(|| CompileError::UndefinedPredicate {
            name: name.clone(),
            referenced_from: referenced_from.to_string(),
        })?;
        *expr = Expr::Predicate(slot);
        return Ok(());
    }
    for child in expr.children_mut() {
        resolve_calls(child, referenced_from, lookup)?;
    }
    Ok(())
}

/// Check for cycles among named predicates using DFS.
fn check_predicate_cycles(
    predicates: &[NamedPredicate],
    calls: &HashMap<&str, Vec<&str>>,
) -> Result<(), CompileError> {
    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    for p in predicates {
        if !visited.contains(p.name.as_str()) {
            dfs_cycle_check(&p.name, calls, &mut visited, &mut stack)?;
        }
    }
    Ok(())
}

fn dfs_cycle_check<'a>(
    name: &'a str,
    calls: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Result<(), CompileError> {
    visited.insert(name);
    stack.push(name);

    if let Some(callees) = calls.get(name) {
        for &callee in callees {
            if let Some(start) = stack.iter().position(|&n| n == callee) {
                let mut path = stack[start..].to_vec();
                path.push(callee);
                return Err(CompileError::PredicateCycle(path.join(" -> ")));
            }
            if !visited.contains(callee) {
                dfs_cycle_check(callee, calls, visited, stack)?;
            }
        }
    }

    stack.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_basic() {
        let table = compile_source(
            r#"
predicate "isSignedIn" "principal != null"

match "/users/{userId}" {
    allow "get" if="isSignedIn()"
    allow "create" if="principal.id == userId"
}
"#,
        )
        .unwrap();
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.predicates().len(), 1);

        let entry = table.entry("/users/{userId}").unwrap();
        assert_eq!(entry.operations(), vec![Operation::Get, Operation::Create]);
        assert_eq!(entry.predicate(Operation::Get), Some(&Expr::Predicate(0)));
        assert!(entry.predicate(Operation::List).is_none());
    }

    #[test]
    fn test_allow_without_condition_is_unconditional() {
        let table = compile_source(r#"match "/public/{doc}" { allow "read"; }"#).unwrap();
        let entry = table.entry("/public/{doc}").unwrap();
        assert_eq!(
            entry.predicate(Operation::List),
            Some(&Expr::Literal(LitValue::Bool(true)))
        );
    }

    #[test]
    fn test_same_pattern_in_several_blocks_merges() {
        let table = compile_source(
            r#"
match "/users/{userId}" { allow "get"; }
match "users/{userId}/" { allow "list" if="false"; }
"#,
        )
        .unwrap();
        assert_eq!(table.entries().len(), 1);
        assert_eq!(
            table.entries()[0].operations(),
            vec![Operation::Get, Operation::List]
        );
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let err = compile_source(
            r#"
match "/users/{userId}" {
    allow "read"
    allow "get" if="false"
}
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::DuplicateRule { ref pattern, ref operation }
                if pattern == "/users/{userId}" && operation == "get"
        ));
    }

    #[test]
    fn test_duplicate_rule_with_renamed_variables_rejected() {
        let err = compile_source(
            r#"
match "/users/{userId}" { allow "get" if="principal.id == userId"; }
match "/users/{uid}" { allow "read" if="principal.id == uid"; }
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::DuplicateRule { ref pattern, ref operation }
                if pattern == "/users/{uid}" && operation == "get"
        ));

        // same shape, different operations
        let table = compile_source(
            r#"
match "/users/{userId}" { allow "get"; }
match "/users/{uid}" { allow "list"; }
"#,
        )
        .unwrap();
        assert_eq!(table.entries().len(), 2);

        // a recursive tail is a different shape from a single wildcard
        assert!(compile_source(
            r#"
match "/users/{userId}" { allow "get"; }
match "/users/{rest=**}" { allow "get"; }
"#,
        )
        .is_ok());
    }

    #[test]
    fn test_undefined_predicate() {
        let err = compile_source(r#"match "/a/{b}" { allow "get" if="isAdmin()"; }"#).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedPredicate { ref name, .. } if name == "isAdmin"));

        let err = compile_source(r#"predicate "a" "missing()""#).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UndefinedPredicate { ref name, ref referenced_from }
                if name == "missing" && referenced_from == "a"
        ));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let err = compile_source(
            r#"
predicate "a" "b()"
predicate "b" "true"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UndefinedPredicate { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_predicate_cycles_detected() {
        let err = compile_source(r#"predicate "a" "a()""#).unwrap_err();
        assert!(matches!(err, CompileError::PredicateCycle(ref path) if path == "a -> a"));

        let err = compile_source(
            r#"
predicate "a" "b() || true"
predicate "b" "c()"
predicate "c" "a()"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::PredicateCycle(ref path) if path == "a -> b -> c -> a"));
    }

    #[test]
    fn test_duplicate_predicate_rejected() {
        let err = compile_source(
            r#"
predicate "a" "true"
predicate "a" "false"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicatePredicate(ref n) if n == "a"));
    }

    #[test]
    fn test_unbound_variable_rejected() {
        let err = compile_source(r#"match "/users/{userId}" { allow "get" if="uid == principal.id"; }"#)
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnboundVariable { ref variable, .. } if variable == "uid"
        ));
    }

    #[test]
    fn test_malformed_pattern_and_condition() {
        let err = compile_source(r#"match "/a/{rest=**}/b" { allow "get"; }"#).unwrap_err();
        assert!(matches!(err, CompileError::MalformedPattern { .. }));

        let err = compile_source(r#"match "/a/{b}" { allow "get" if="principal =="; }"#).unwrap_err();
        assert!(matches!(err, CompileError::InvalidCondition(_)));
    }

    #[test]
    fn test_entries_sorted_by_specificity() {
        let table = compile_source(
            r#"
match "/{document=**}" { allow "get" if="false"; }
match "/users/{userId}" { allow "get"; }
match "/users/admin" { allow "get"; }
match "/users/{userId}/{rest=**}" { allow "get"; }
"#,
        )
        .unwrap();
        let ids: Vec<&str> = table.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "/users/admin",
                "/users/{userId}",
                "/users/{userId}/{rest=**}",
                "/{document=**}",
            ]
        );

        let path = DocPath::parse("users/admin").unwrap();
        let matched: Vec<&str> = table
            .matching(&path)
            .into_iter()
            .map(|(e, _)| e.id.as_str())
            .collect();
        assert_eq!(
            matched,
            vec![
                "/users/admin",
                "/users/{userId}",
                "/users/{userId}/{rest=**}",
                "/{document=**}",
            ]
        );
    }

    #[test]
    fn test_merge_multiple_files() {
        let p1 = parse_kdl_document(r#"predicate "isSignedIn" "principal != null""#).unwrap();
        let p2 = parse_kdl_document(r#"match "/games/{gameId}" { allow "read" if="isSignedIn()"; }"#)
            .unwrap();
        let table = compile_policies(vec![p1, p2]).unwrap();
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.predicates().len(), 1);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(
            dir.path().join("00_predicates.kdl"),
            r#"
predicate "isSignedIn" "principal != null"
"#,
        )
        .unwrap();

        std::fs::write(
            dir.path().join("10_users.kdl"),
            r#"
match "/users/{userId}" {
    allow "get" if="isSignedIn()"
    allow "update" if="principal.id == userId"
}
"#,
        )
        .unwrap();

        // Also write a non-KDL file that should be ignored
        std::fs::write(dir.path().join("README.md"), "not a policy").unwrap();

        let table = load_policies(dir.path()).unwrap();
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.predicates().len(), 1);
        assert!(table.entry("/users/{userId}").is_some());
    }

    #[test]
    fn test_load_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rules.kdl");
        std::fs::write(&file, r#"match "/tasks/{taskId}" { allow "read"; }"#).unwrap();

        let table = load_policies(&file).unwrap();
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn test_unreadable_directory_entry_fails_load() {
        let entries = vec![
            Ok(PathBuf::from("10_users.kdl")),
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            Ok(PathBuf::from("00_predicates.kdl")),
        ];
        let err = kdl_files(entries).unwrap_err();
        assert!(matches!(err, CompileError::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied));

        let files = kdl_files(vec![
            Ok(PathBuf::from("b.kdl")),
            Ok(PathBuf::from("notes.md")),
            Ok(PathBuf::from("a.kdl")),
        ])
        .unwrap();
        assert_eq!(files, vec![PathBuf::from("a.kdl"), PathBuf::from("b.kdl")]);
    }

    #[test]
    fn test_load_nonexistent_path() {
        let err = load_policies(Path::new("/nonexistent/path")).unwrap_err();
        assert!(matches!(err, CompileError::InvalidPolicy(_)));
    }
}
