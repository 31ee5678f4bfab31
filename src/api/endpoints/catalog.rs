//! Test catalog endpoints. Reads are open to every role; writes need
//! `ManageCatalog`.

use std::str::FromStr;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::{parse_id, ApiContext, CallerContext};
use crate::authorization::Capability;
use crate::catalog;
use crate::models::enums::TestCategory;
use crate::models::{DefinitionFilter, DefinitionInput, TestDefinition};

#[derive(Deserialize)]
pub struct CatalogQuery {
    pub category: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDefinitionRequest {
    pub code: String,
    #[serde(flatten)]
    pub definition: DefinitionInput,
}

#[derive(Deserialize)]
pub struct ReviseDefinitionRequest {
    pub expected_version: Option<i64>,
    #[serde(flatten)]
    pub definition: DefinitionInput,
}

/// `GET /api/test-definitions`: current version of every test.
pub async fn list(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    query: Result<Query<CatalogQuery>, QueryRejection>,
) -> Result<Json<Vec<TestDefinition>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Query(query) = query?;
    let category = query
        .category
        .as_deref()
        .map(TestCategory::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let definitions = ctx
        .run_blocking(move |_, conn| catalog::list_current(conn, &DefinitionFilter { category }))
        .await?;
    Ok(Json(definitions))
}

pub async fn create(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<CreateDefinitionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TestDefinition>), ApiError> {
    caller.require(Capability::ManageCatalog)?;
    let Json(request) = payload?;
    let definition = ctx
        .run_blocking(move |_, conn| {
            catalog::create_definition(
                conn,
                &request.code,
                &request.definition,
                &caller.user_id,
                Utc::now(),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

pub async fn revise(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(code): Path<String>,
    payload: Result<Json<ReviseDefinitionRequest>, JsonRejection>,
) -> Result<Json<TestDefinition>, ApiError> {
    caller.require(Capability::ManageCatalog)?;
    let Json(request) = payload?;
    let definition = ctx
        .run_blocking(move |_, conn| {
            catalog::revise_definition(
                conn,
                &code,
                &request.definition,
                request.expected_version,
                &caller.user_id,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(definition))
}

pub async fn current(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(code): Path<String>,
) -> Result<Json<TestDefinition>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let definition = ctx
        .run_blocking(move |_, conn| catalog::get_current(conn, &code))
        .await?;
    Ok(Json(definition))
}

pub async fn history(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(code): Path<String>,
) -> Result<Json<Vec<TestDefinition>>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let versions = ctx
        .run_blocking(move |_, conn| catalog::history(conn, &code))
        .await?;
    Ok(Json(versions))
}

/// `GET /api/test-definitions/:id`: any version, current or superseded.
pub async fn detail(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<TestDefinition>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let id = parse_id(&id, "test definition")?;
    let definition = ctx
        .run_blocking(move |_, conn| catalog::get_definition(conn, &id))
        .await?;
    Ok(Json(definition))
}
