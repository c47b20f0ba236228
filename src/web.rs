//! HTTP host for the decision engine. Routes live in `rules::web`; this
//! module binds the listener and applies response headers.
use crate::rules::web::router;
use crate::rules::RuleTable;
use crate::settings::Settings;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::Router;
use miette::IntoDiagnostic;
use std::net::SocketAddr;
use std::sync::Arc;

// Decisions depend on request snapshots and must never be cached
async fn response_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    response
}

pub fn app(table: Arc<RuleTable>) -> Router {
    router(table).layer(middleware::from_fn(response_headers))
}

pub async fn serve(settings: &Settings, table: Arc<RuleTable>) -> miette::Result<()> {
    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, rules = table.entries().len(), "Decision API listening");
    axum::serve(listener, app(table)).await.into_diagnostic()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::loader::compile_source;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_responses_are_not_cacheable() {
        let table = compile_source(r#"match "/a/{id}" { allow "get"; }"#).unwrap();
        let response = app(Arc::new(table))
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()["cache-control"], "no-store");
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    }
}
