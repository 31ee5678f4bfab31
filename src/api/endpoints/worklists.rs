//! Worklists and lab statistics.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, CallerContext};
use crate::authorization::Capability;
use crate::lifecycle::worklists::{self, LabStats};
use crate::lifecycle::OrderWithResult;
use crate::models::TestOrder;

#[derive(Deserialize)]
pub struct WorklistQuery {
    pub limit: Option<u32>,
}

/// `GET /api/worklists/pending-review`
pub async fn pending_review(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    query: Result<Query<WorklistQuery>, QueryRejection>,
) -> Result<Json<Vec<TestOrder>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Query(query) = query?;
    let orders = ctx
        .run_blocking(move |_, conn| worklists::pending_review(conn, query.limit))
        .await?;
    Ok(Json(orders))
}

/// `GET /api/worklists/critical`
pub async fn critical(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    query: Result<Query<WorklistQuery>, QueryRejection>,
) -> Result<Json<Vec<OrderWithResult>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Query(query) = query?;
    let results = ctx
        .run_blocking(move |_, conn| worklists::critical_results(conn, query.limit))
        .await?;
    Ok(Json(results))
}

/// `GET /api/stats`
pub async fn stats(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
) -> Result<Json<LabStats>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let stats = ctx.run_blocking(|_, conn| worklists::lab_stats(conn)).await?;
    Ok(Json(stats))
}
