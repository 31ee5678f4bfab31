//! Order endpoints: placement, lookups and every lifecycle action.
//!
//! Lifecycle writes take an optional `expected_version`; when present it must
//! match the order's current version or the call fails with `CONFLICT`.
//! The acting user is always the caller, never a body field.

use std::str::FromStr;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::{ApiError, ErrorDetail};
use crate::api::types::{parse_id, ApiContext, CallerContext};
use crate::authorization::Capability;
use crate::lifecycle::{worklists, BatchApproval, DraftInput, OrderWithResult};
use crate::models::enums::{OrderStatus, Priority};
use crate::models::{
    CriticalNotification, NewOrder, OrderFilter, ResultSet, StatusChange, TestOrder,
    MAX_PAGE_SIZE,
};
use crate::validator::Submission;

#[derive(Deserialize)]
pub struct OrderListQuery {
    pub patient_id: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Deserialize, Default)]
pub struct VersionRequest {
    pub expected_version: Option<i64>,
}

#[derive(Deserialize)]
pub struct CollectRequest {
    /// Defaults to the time of the request.
    pub collected_at: Option<DateTime<Utc>>,
    pub expected_version: Option<i64>,
}

#[derive(Deserialize)]
pub struct DraftRequest {
    pub values: Submission,
    pub interpretation: Option<String>,
    #[serde(default)]
    pub inconclusive: bool,
    pub expected_version: Option<i64>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub expected_version: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct NotifyRequest {
    /// Who was told, e.g. the ordering clinician.
    pub recipient: Option<String>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct BatchApproveRequest {
    pub order_ids: Vec<Uuid>,
}

/// One entry of a batch approval response: the approved order, or the error
/// that order alone would have returned.
#[derive(Serialize)]
pub struct BatchOutcome {
    pub order_id: Uuid,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OrderWithResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl From<BatchApproval> for BatchOutcome {
    fn from(batch: BatchApproval) -> Self {
        match batch.outcome {
            Ok(result) => Self {
                order_id: batch.order_id,
                approved: true,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                let (_, detail) = ApiError::from(e).status_and_detail();
                Self {
                    order_id: batch.order_id,
                    approved: false,
                    result: None,
                    error: Some(detail),
                }
            }
        }
    }
}

pub async fn create(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> Result<(StatusCode, Json<TestOrder>), ApiError> {
    caller.require(Capability::OrderTests)?;
    let Json(input) = payload?;
    let order = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn)
                .create_order(&input, &caller.user_id, Utc::now())
        })
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn list(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    query: Result<Query<OrderListQuery>, QueryRejection>,
) -> Result<Json<Vec<TestOrder>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Query(query) = query?;
    let filter = OrderFilter {
        patient_id: query
            .patient_id
            .as_deref()
            .map(|id| parse_id(id, "patient"))
            .transpose()?,
        status: parse_enum::<OrderStatus>(query.status.as_deref())?,
        priority: parse_enum::<Priority>(query.priority.as_deref())?,
        limit: Some(query.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)),
    };
    let orders = ctx
        .run_blocking(move |_, conn| worklists::list_orders(conn, &filter))
        .await?;
    Ok(Json(orders))
}

pub async fn detail(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<TestOrder>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let id = parse_id(&id, "order")?;
    let order = ctx
        .run_blocking(move |_, conn| worklists::get_order(conn, &id))
        .await?;
    Ok(Json(order))
}

pub async fn history(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StatusChange>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let id = parse_id(&id, "order")?;
    let changes = ctx
        .run_blocking(move |_, conn| worklists::order_history(conn, &id))
        .await?;
    Ok(Json(changes))
}

pub async fn result(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<ResultSet>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let id = parse_id(&id, "order")?;
    let set = ctx
        .run_blocking(move |_, conn| worklists::result_set(conn, &id))
        .await?;
    Ok(Json(set))
}

// ── Lifecycle actions ───────────────────────────────────────

pub async fn collect(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<CollectRequest>, JsonRejection>,
) -> Result<Json<TestOrder>, ApiError> {
    caller.require(Capability::CollectSamples)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let order = ctx
        .run_blocking(move |core, conn| {
            let now = Utc::now();
            core.lifecycle(conn).collect(
                id,
                &caller.user_id,
                request.collected_at.unwrap_or(now),
                request.expected_version,
                now,
            )
        })
        .await?;
    Ok(Json(order))
}

pub async fn begin_processing(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<VersionRequest>, JsonRejection>,
) -> Result<Json<TestOrder>, ApiError> {
    caller.require(Capability::EnterResults)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let order = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn).begin_processing(
                id,
                &caller.user_id,
                request.expected_version,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(order))
}

pub async fn save_draft(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<DraftRequest>, JsonRejection>,
) -> Result<Json<OrderWithResult>, ApiError> {
    caller.require(Capability::EnterResults)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let draft = DraftInput {
        values: request.values,
        interpretation: request.interpretation,
        inconclusive: request.inconclusive,
    };
    let saved = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn).save_draft(
                id,
                &draft,
                &caller.user_id,
                request.expected_version,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(saved))
}

pub async fn submit(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<VersionRequest>, JsonRejection>,
) -> Result<Json<OrderWithResult>, ApiError> {
    caller.require(Capability::EnterResults)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let submitted = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn).submit_for_review(
                id,
                &caller.user_id,
                request.expected_version,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(submitted))
}

pub async fn approve(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<VersionRequest>, JsonRejection>,
) -> Result<Json<OrderWithResult>, ApiError> {
    caller.require(Capability::ApproveResults)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let approved = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn)
                .approve(id, &caller.user_id, request.expected_version, Utc::now())
        })
        .await?;
    Ok(Json(approved))
}

pub async fn cancel(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<OrderWithResult>, ApiError> {
    caller.require(Capability::CancelOrders)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let cancelled = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn).cancel(
                id,
                &caller.user_id,
                &request.reason,
                request.expected_version,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(cancelled))
}

fn parse_enum<T>(raw: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.filter(|s| !s.is_empty())
        .map(T::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Approve several orders at once. Answers 200 with one outcome per order in
/// request order, whether or not each approval succeeded.
pub async fn approve_batch(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<BatchApproveRequest>, JsonRejection>,
) -> Result<Json<Vec<BatchOutcome>>, ApiError> {
    caller.require(Capability::ApproveResults)?;
    let Json(request) = payload?;
    let outcomes = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn)
                .approve_batch(&request.order_ids, &caller.user_id, Utc::now())
        })
        .await?;
    Ok(Json(outcomes.into_iter().map(BatchOutcome::from).collect()))
}

pub async fn critical_notified(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CriticalNotification>), ApiError> {
    caller.require(Capability::EnterResults)?;
    let id = parse_id(&id, "order")?;
    let Json(request) = payload?;
    let notification = ctx
        .run_blocking(move |core, conn| {
            core.lifecycle(conn).record_critical_notification(
                id,
                &caller.user_id,
                request.recipient.as_deref(),
                request.note.as_deref(),
                Utc::now(),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}
