//! Tree-walking evaluator for compiled predicate expressions.
//!
//! Evaluation never fails. Missing fields, type mismatches, arithmetic on
//! non-numbers and failed document fetches all produce an *absent* value,
//! and any comparison involving an absent value is itself absent. Only a
//! predicate that evaluates to boolean `true` grants access; `!` does not
//! turn an absent value into `true`.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::rules::condition::{BinOp, Expr, LitValue, Method};
use crate::rules::diff;
use crate::rules::errors::{EvaluationError, FetchError};
use crate::rules::pattern::Bindings;
use crate::rules::types::{AffectedKeys, DocPath, Principal, Snapshot};
use crate::rules::NamedPredicate;

/// Read-only access to other documents, supplied by the host. Results must
/// be point-in-time consistent with the request's snapshots.
pub trait DocumentFetcher: Send + Sync {
    /// `Ok(None)` means the document does not exist.
    fn fetch(&self, path: &DocPath) -> Result<Option<Snapshot>, FetchError>;
}

/// Document source for hosts that provide none; every fetch fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetch;

impl DocumentFetcher for NoFetch {
    fn fetch(&self, _path: &DocPath) -> Result<Option<Snapshot>, FetchError> {
        Err(FetchError::new("no document source configured"))
    }
}

/// In-memory document source.
#[derive(Debug, Default, Clone)]
pub struct StaticDocuments {
    documents: HashMap<DocPath, Snapshot>,
}

impl StaticDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `path` is not a valid document path.
    pub fn insert(&mut self, path: &str, snapshot: Snapshot) -> bool {
        match DocPath::parse(path) {
            Some(path) => {
                self.documents.insert(path, snapshot);
                true
            }
            None => false,
        }
    }

    /// Keys are taken in sorted order; when two keys name the same document
    /// (`users/u1` and `/users/u1/`) the first one wins.
    pub fn from_map(documents: HashMap<String, Snapshot>) -> Self {
        let mut documents: Vec<_> = documents.into_iter().collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Self::new();
        for (path, snapshot) in documents {
            match DocPath::parse(&path) {
                Some(doc_path) if out.documents.contains_key(&doc_path) => {
                    tracing::warn!(%path, "ignoring duplicate document path");
                }
                Some(doc_path) => {
                    out.documents.insert(doc_path, snapshot);
                }
                None => tracing::warn!(%path, "ignoring document with invalid path"),
            }
        }
        out
    }
}

impl DocumentFetcher for StaticDocuments {
    fn fetch(&self, path: &DocPath) -> Result<Option<Snapshot>, FetchError> {
        Ok(self.documents.get(path).cloned())
    }
}

/// Everything a predicate can observe about one request.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub principal: Option<&'a Principal>,
    pub bindings: &'a Bindings,
    pub before: Option<&'a Snapshot>,
    pub after: Option<&'a Snapshot>,
    pub affected: &'a AffectedKeys,
    pub fetcher: &'a dyn DocumentFetcher,
}

#[derive(Debug, Clone)]
enum Val<'a> {
    Absent,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Cow<'a, str>),
    List(Vec<Val<'a>>),
    Map(Cow<'a, Snapshot>),
    Principal(&'a Principal),
    Keys(&'a AffectedKeys),
}

pub struct Evaluator<'a> {
    ctx: EvalContext<'a>,
    predicates: &'a [NamedPredicate],
    failures: Vec<EvaluationError>,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: EvalContext<'a>, predicates: &'a [NamedPredicate]) -> Self {
        Self {
            ctx,
            predicates,
            failures: Vec::new(),
        }
    }

    /// True only if `expr` evaluates to boolean `true`.
    pub fn check(&mut self, expr: &'a Expr) -> bool {
        matches!(self.eval(expr), Val::Bool(true))
    }

    pub fn failures(&self) -> &[EvaluationError] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<EvaluationError> {
        self.failures
    }

    fn eval(&mut self, expr: &'a Expr) -> Val<'a> {
        match expr {
            Expr::Literal(lit) => match lit {
                LitValue::Null => Val::Null,
                LitValue::Int(n) => Val::Int(*n),
                LitValue::Float(f) => Val::Float(*f),
                LitValue::Str(s) => Val::Str(Cow::Borrowed(s)),
                LitValue::Bool(b) => Val::Bool(*b),
            },
            Expr::List(items) => Val::List(items.iter().map(|e| self.eval(e)).collect()),
            Expr::Principal => self.ctx.principal.map_or(Val::Null, Val::Principal),
            Expr::Before => self
                .ctx
                .before
                .map_or(Val::Null, |doc| Val::Map(Cow::Borrowed(doc))),
            Expr::After => self
                .ctx
                .after
                .map_or(Val::Null, |doc| Val::Map(Cow::Borrowed(doc))),
            Expr::Diff => Val::Keys(self.ctx.affected),
            Expr::Var(name) => self
                .ctx
                .bindings
                .get(name)
                .map_or(Val::Absent, |v| Val::Str(Cow::Borrowed(v))),
            Expr::Member { base, field } => member(self.eval(base), field),
            Expr::Method {
                receiver,
                method,
                args,
            } => {
                let receiver = self.eval(receiver);
                let args: Vec<Val<'a>> = args.iter().map(|e| self.eval(e)).collect();
                call_method(receiver, *method, args)
            }
            // Left to right, short-circuiting: the right operand is never
            // evaluated (or fetched) once the result is known. A non-boolean
            // operand keeps the result absent so `!` cannot flip it.
            Expr::BinOp {
                op: BinOp::And,
                left,
                right,
            } => match self.eval(left) {
                Val::Bool(false) => Val::Bool(false),
                Val::Bool(true) => match self.eval(right) {
                    Val::Bool(b) => Val::Bool(b),
                    _ => Val::Absent,
                },
                _ => Val::Absent,
            },
            Expr::BinOp {
                op: BinOp::Or,
                left,
                right,
            } => match self.eval(left) {
                Val::Bool(true) => Val::Bool(true),
                l => match (l, self.eval(right)) {
                    (_, Val::Bool(true)) => Val::Bool(true),
                    (Val::Bool(false), Val::Bool(false)) => Val::Bool(false),
                    _ => Val::Absent,
                },
            },
            // Comparing against the `null` literal is a presence check
            Expr::BinOp {
                op: op @ (BinOp::Eq | BinOp::Ne),
                left,
                right,
            } if is_null_literal(left) || is_null_literal(right) => {
                let other = if is_null_literal(left) { right } else { left };
                match self.eval(other) {
                    Val::Absent => Val::Absent,
                    v => {
                        let is_null = matches!(v, Val::Null);
                        Val::Bool(if *op == BinOp::Eq { is_null } else { !is_null })
                    }
                }
            }
            Expr::BinOp { op, left, right } => {
                let l = self.eval(left);
                let r = self.eval(right);
                binary(*op, &l, &r)
            }
            Expr::UnaryNot(inner) => match self.eval(inner) {
                Val::Bool(b) => Val::Bool(!b),
                _ => Val::Absent,
            },
            Expr::Neg(inner) => match self.eval(inner) {
                Val::Int(n) => n.checked_neg().map_or(Val::Absent, Val::Int),
                Val::Float(f) => Val::Float(-f),
                _ => Val::Absent,
            },
            Expr::In {
                element,
                collection,
            } => {
                let element = self.eval(element);
                let collection = self.eval(collection);
                contains(&collection, &element).map_or(Val::Absent, Val::Bool)
            }
            Expr::Call(name) => {
                tracing::warn!(predicate = %name, "unresolved predicate call");
                Val::Absent
            }
            Expr::Predicate(slot) => {
                let predicates = self.predicates;
                match predicates.get(*slot) {
                    // Same result as the body written inline, absent included
                    Some(predicate) => self.eval(&predicate.expr),
                    None => Val::Absent,
                }
            }
            Expr::Fetch(segments) => match self.document_path(segments) {
                Some(path) => match self.fetch(&path) {
                    Some(Some(doc)) => Val::Map(Cow::Owned(doc)),
                    _ => Val::Absent,
                },
                None => Val::Absent,
            },
            Expr::Exists(segments) => match self.document_path(segments) {
                Some(path) => self
                    .fetch(&path)
                    .map_or(Val::Absent, |doc| Val::Bool(doc.is_some())),
                None => Val::Absent,
            },
        }
    }

    fn document_path(&mut self, segments: &'a [Expr]) -> Option<DocPath> {
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            match self.eval(segment) {
                Val::Str(s) => parts.push(s.into_owned()),
                Val::Int(n) => parts.push(n.to_string()),
                _ => return None,
            }
        }
        DocPath::parse(&parts.join("/"))
    }

    /// `None` when the fetch failed; the failure is recorded.
    fn fetch(&mut self, path: &DocPath) -> Option<Option<Snapshot>> {
        match self.ctx.fetcher.fetch(path) {
            Ok(doc) => Some(doc),
            Err(source) => {
                tracing::warn!(%path, error = %source, "document fetch failed, failing closed");
                self.failures.push(EvaluationError::Fetch {
                    path: path.to_string(),
                    source,
                });
                None
            }
        }
    }
}

fn from_json(value: &Value) -> Val<'_> {
    match value {
        Value::Null => Val::Null,
        Value::Bool(b) => Val::Bool(*b),
        Value::Number(n) => number(n),
        Value::String(s) => Val::Str(Cow::Borrowed(s)),
        Value::Array(arr) => Val::List(arr.iter().map(from_json).collect()),
        Value::Object(map) => Val::Map(Cow::Borrowed(map)),
    }
}

fn from_owned_json<'a>(value: Value) -> Val<'a> {
    match value {
        Value::Null => Val::Null,
        Value::Bool(b) => Val::Bool(b),
        Value::Number(n) => number(&n),
        Value::String(s) => Val::Str(Cow::Owned(s)),
        Value::Array(arr) => Val::List(arr.into_iter().map(from_owned_json).collect()),
        Value::Object(map) => Val::Map(Cow::Owned(map)),
    }
}

fn number<'a>(n: &serde_json::Number) -> Val<'a> {
    if let Some(i) = n.as_i64() {
        Val::Int(i)
    } else if let Some(f) = n.as_f64() {
        Val::Float(f)
    } else {
        Val::Absent
    }
}

fn member<'a>(base: Val<'a>, field: &str) -> Val<'a> {
    match base {
        Val::Map(Cow::Borrowed(map)) => map.get(field).map_or(Val::Absent, from_json),
        Val::Map(Cow::Owned(mut map)) => map.remove(field).map_or(Val::Absent, from_owned_json),
        Val::Principal(p) => match field {
            "id" => Val::Str(Cow::Borrowed(&p.id)),
            "claims" => Val::Map(Cow::Borrowed(&p.claims)),
            _ => Val::Absent,
        },
        _ => Val::Absent,
    }
}

fn numeric_order(a: &Val<'_>, b: &Val<'_>) -> Option<Ordering> {
    match (a, b) {
        (Val::Int(x), Val::Int(y)) => Some(x.cmp(y)),
        (Val::Int(x), Val::Float(y)) => (*x as f64).partial_cmp(y),
        (Val::Float(x), Val::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Val::Float(x), Val::Float(y)) => x.partial_cmp(y),
        _ => None,
    }
}

fn is_null_literal(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal(LitValue::Null))
}

/// `None` when the operands are not comparable: absent, different types,
/// or a null value against a non-null one.
fn equals(a: &Val<'_>, b: &Val<'_>) -> Option<bool> {
    match (a, b) {
        (Val::Absent, _) | (_, Val::Absent) => None,
        (Val::Null, Val::Null) => Some(true),
        (Val::Null, _) | (_, Val::Null) => None,
        (Val::Bool(x), Val::Bool(y)) => Some(x == y),
        (Val::Str(x), Val::Str(y)) => Some(x == y),
        (Val::List(x), Val::List(y)) => Some(
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| equals(a, b) == Some(true)),
        ),
        (Val::Map(x), Val::Map(y)) => Some(diff::maps_equal(x, y)),
        (Val::Principal(x), Val::Principal(y)) => Some(x == y),
        (Val::Keys(x), Val::Keys(y)) => Some(x == y),
        _ => numeric_order(a, b).map(|o| o == Ordering::Equal),
    }
}

fn binary<'a>(op: BinOp, l: &Val<'a>, r: &Val<'a>) -> Val<'a> {
    match op {
        BinOp::Eq => equals(l, r).map_or(Val::Absent, Val::Bool),
        BinOp::Ne => equals(l, r).map_or(Val::Absent, |eq| Val::Bool(!eq)),
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
            let ordering = match (l, r) {
                (Val::Str(x), Val::Str(y)) => Some(x.cmp(y)),
                _ => numeric_order(l, r),
            };
            ordering.map_or(Val::Absent, |o| {
                Val::Bool(match op {
                    BinOp::Gt => o == Ordering::Greater,
                    BinOp::Lt => o == Ordering::Less,
                    BinOp::Ge => o != Ordering::Less,
                    _ => o != Ordering::Greater,
                })
            })
        }
        BinOp::Add | BinOp::Sub => arithmetic(op, l, r),
        // short-circuited in `Evaluator::eval`
        BinOp::And | BinOp::Or => Val::Absent,
    }
}

fn arithmetic<'a>(op: BinOp, l: &Val<'a>, r: &Val<'a>) -> Val<'a> {
    if let (Val::Int(x), Val::Int(y)) = (l, r) {
        let result = if op == BinOp::Add {
            x.checked_add(*y)
        } else {
            x.checked_sub(*y)
        };
        return result.map_or(Val::Absent, Val::Int);
    }
    let as_f64 = |v: &Val<'_>| match v {
        Val::Int(n) => Some(*n as f64),
        Val::Float(f) => Some(*f),
        _ => None,
    };
    match (as_f64(l), as_f64(r)) {
        (Some(x), Some(y)) => {
            let result = if op == BinOp::Add { x + y } else { x - y };
            if result.is_finite() {
                Val::Float(result)
            } else {
                Val::Absent
            }
        }
        _ => Val::Absent,
    }
}

/// Membership of `element` in a list, map (by key) or key set.
fn contains(collection: &Val<'_>, element: &Val<'_>) -> Option<bool> {
    if matches!(element, Val::Absent) {
        return None;
    }
    match (collection, element) {
        (Val::List(items), _) => Some(items.iter().any(|i| equals(i, element) == Some(true))),
        (Val::Map(map), Val::Str(key)) => Some(map.contains_key(&**key)),
        (Val::Keys(keys), Val::Str(key)) => Some(keys.contains(&**key)),
        (Val::Map(_) | Val::Keys(_), _) => Some(false),
        _ => None,
    }
}

fn call_method<'a>(receiver: Val<'a>, method: Method, args: Vec<Val<'a>>) -> Val<'a> {
    let arg = args.into_iter().next().unwrap_or(Val::Absent);
    match method {
        Method::Size => {
            let len = match &receiver {
                Val::Keys(keys) => keys.len(),
                Val::List(items) => items.len(),
                Val::Map(map) => map.len(),
                Val::Str(s) => s.chars().count(),
                _ => return Val::Absent,
            };
            i64::try_from(len).map_or(Val::Absent, Val::Int)
        }
        Method::Has => contains(&receiver, &arg).map_or(Val::Absent, Val::Bool),
        Method::HasOnly | Method::HasAny => {
            let Val::List(allowed) = &arg else {
                return Val::Absent;
            };
            let in_arg = |v: &Val<'_>| allowed.iter().any(|a| equals(a, v) == Some(true));
            match (&receiver, method) {
                (Val::Keys(keys), Method::HasOnly) => {
                    let allowed: AffectedKeys = allowed
                        .iter()
                        .filter_map(|a| match a {
                            Val::Str(s) => Some(s.to_string()),
                            _ => None,
                        })
                        .collect();
                    Val::Bool(diff::only_affects(keys, &allowed))
                }
                (Val::Keys(keys), _) => Val::Bool(
                    allowed
                        .iter()
                        .any(|a| matches!(a, Val::Str(s) if keys.contains(&**s))),
                ),
                (Val::List(items), Method::HasOnly) => Val::Bool(items.iter().all(in_arg)),
                (Val::List(items), _) => Val::Bool(items.iter().any(in_arg)),
                _ => Val::Absent,
            }
        }
    }
}
