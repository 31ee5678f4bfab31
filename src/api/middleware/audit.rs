//! Audit logging middleware.
//!
//! Logs every API request with caller, method, path and response status.
//! Runs innermost, after identity has injected `CallerContext`.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::{ApiContext, CallerContext};
use crate::core_state::AccessSource;

/// Log API access for the audit trail.
/// Accesses `ApiContext` from request extensions.
pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let ctx = req.extensions().get::<ApiContext>().cloned();
    let source = req
        .extensions()
        .get::<CallerContext>()
        .map(|c| AccessSource::Api {
            user_id: c.user_id.clone(),
        });

    let response = next.run(req).await;

    if let (Some(ctx), Some(source)) = (ctx, source) {
        let status = response.status().as_u16();
        // Flushing may touch SQLite; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            ctx.core
                .log_access(source, &format!("{method} {path}"), &format!("status:{status}"));
        });
    }

    response
}
