//! Patient endpoints.
//!
//! - `POST /api/patients`: register
//! - `GET /api/patients`: search, one page at a time
//! - `GET /api/patients/:id`
//! - `PUT /api/patients/:id/contact`
//! - `PUT /api/patients/:id/status`: deactivate / reactivate

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
use crate::models::enums::PatientStatus;
use crate::models::{ContactInfo, NewPatient, Patient, PatientQuery};
use crate::patients::{self, PatientPage};

#[derive(Deserialize)]
pub struct PatientSearchQuery {
    pub q: Option<String>,
    pub status: Option<String>,
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: PatientStatus,
}

pub async fn create(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<NewPatient>, JsonRejection>,
) -> Result<(StatusCode, Json<Patient>), ApiError> {
    caller.require(Capability::RegisterPatients)?;
    let Json(input) = payload?;
    let patient = ctx
        .run_blocking(move |_, conn| patients::register_patient(conn, &input, Utc::now()))
        .await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

pub async fn search(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    query: Result<Query<PatientSearchQuery>, QueryRejection>,
) -> Result<Json<PatientPage>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .map(PatientStatus::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let query = PatientQuery {
        text: query.q.filter(|q| !q.trim().is_empty()),
        status,
        after: query.after,
        limit: query.limit,
    };
    let page = ctx
        .run_blocking(move |_, conn| patients::find_patients(conn, &query))
        .await?;
    Ok(Json(page))
}

pub async fn detail(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<Patient>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let id = parse_id(&id, "patient")?;
    let patient = ctx
        .run_blocking(move |_, conn| patients::get_patient(conn, &id))
        .await?;
    Ok(Json(patient))
}

pub async fn update_contact(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<ContactInfo>, JsonRejection>,
) -> Result<Json<Patient>, ApiError> {
    caller.require(Capability::RegisterPatients)?;
    let id = parse_id(&id, "patient")?;
    let Json(contact) = payload?;
    let patient = ctx
        .run_blocking(move |_, conn| patients::update_contact(conn, &id, contact, Utc::now()))
        .await?;
    Ok(Json(patient))
}

pub async fn set_status(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Patient>, ApiError> {
    caller.require(Capability::RegisterPatients)?;
    let id = parse_id(&id, "patient")?;
    let Json(request) = payload?;
    let patient = ctx
        .run_blocking(move |_, conn| {
            patients::set_status(conn, &id, request.status, Utc::now())
        })
        .await?;
    Ok(Json(patient))
}
