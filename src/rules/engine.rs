use crate::rules::diff;
use crate::rules::eval::{DocumentFetcher, EvalContext, Evaluator, NoFetch};
use crate::rules::types::{AffectedKeys, Decision, DocPath, Operation, Principal, Snapshot};
use crate::rules::RuleTable;

/// Decide whether `principal` may perform `operation` on the document at
/// `path` (e.g. "users/u1"). Predicates that call `fetch()` or `exists()`
/// fail closed; use [`decide_with_fetcher`] to supply a document source.
pub fn decide(
    table: &RuleTable,
    operation: Operation,
    path: &str,
    principal: Option<&Principal>,
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
) -> Decision {
    decide_with_fetcher(table, operation, path, principal, before, after, &NoFetch)
}

/// ALLOW if any rule entry matching `path` has a predicate for `operation`
/// that evaluates to true. Entries are tried most specific first and the
/// first one that allows is reported; otherwise DENY.
pub fn decide_with_fetcher(
    table: &RuleTable,
    operation: Operation,
    path: &str,
    principal: Option<&Principal>,
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
    fetcher: &dyn DocumentFetcher,
) -> Decision {
    let Some(doc_path) = DocPath::parse(path) else {
        tracing::debug!(%operation, path, "denied: invalid document path");
        return Decision::deny();
    };

    let affected = if operation.computes_diff() {
        diff::diff(before, after)
    } else {
        AffectedKeys::new()
    };

    let mut failures = Vec::new();
    for (entry, bindings) in table.matching(&doc_path) {
        // No predicate for this operation contributes no ALLOW
        let Some(predicate) = entry.predicate(operation) else {
            continue;
        };

        let ctx = EvalContext {
            principal,
            bindings: &bindings,
            before,
            after,
            affected: &affected,
            fetcher,
        };
        let mut evaluator = Evaluator::new(ctx, table.predicates());
        let allowed = evaluator.check(predicate);
        failures.extend(evaluator.into_failures().iter().map(ToString::to_string));

        if allowed {
            tracing::debug!(
                %operation,
                path = %doc_path,
                principal = principal.map(|p| p.id.as_str()),
                rule = %entry.id,
                "allowed"
            );
            return Decision::allow(entry.id.clone()).with_failures(failures);
        }
    }

    tracing::debug!(
        %operation,
        path = %doc_path,
        principal = principal.map(|p| p.id.as_str()),
        "denied"
    );
    Decision::deny().with_failures(failures)
}
