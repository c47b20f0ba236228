use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::rules::engine;
use crate::rules::eval::StaticDocuments;
use crate::rules::types::{DecideRequest, RuleSummary};
use crate::rules::RuleTable;

pub fn router(table: Arc<RuleTable>) -> Router {
    Router::new()
        .route("/v1/decide", post(handle_decide))
        .route("/v1/rules", get(handle_rules))
        .route("/healthz", get(health))
        .with_state(table)
}

async fn handle_decide(
    State(table): State<Arc<RuleTable>>,
    Json(req): Json<DecideRequest>,
) -> impl IntoResponse {
    let documents = StaticDocuments::from_map(req.documents);
    let decision = engine::decide_with_fetcher(
        &table,
        req.operation,
        &req.path,
        req.principal.as_ref(),
        req.before.as_ref(),
        req.after.as_ref(),
        &documents,
    );
    Json(decision)
}

async fn handle_rules(State(table): State<Arc<RuleTable>>) -> impl IntoResponse {
    let rules: Vec<RuleSummary> = table
        .entries()
        .iter()
        .map(|entry| RuleSummary {
            id: entry.id.clone(),
            operations: entry.operations(),
        })
        .collect();
    Json(rules)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
