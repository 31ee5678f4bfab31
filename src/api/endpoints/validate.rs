//! `POST /api/validate`: evaluate values against a definition version
//! without touching any order. Lets the entry screen show flags as the
//! technician types.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, CallerContext};
use crate::authorization::Capability;
use crate::catalog;
use crate::core_state::CoreError;
use crate::models::enums::Gender;
use crate::validator::{self, Evaluation, Submission, ValidationError};

#[derive(Deserialize)]
pub struct ValidateRequest {
    /// A specific version; otherwise `test_code` selects the current one.
    pub test_definition_id: Option<Uuid>,
    pub test_code: Option<String>,
    pub values: Submission,
    pub gender: Option<Gender>,
    #[serde(default)]
    pub inconclusive: bool,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub test_definition_id: Uuid,
    pub definition_version: i64,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    /// First mandatory parameter still without a value.
    pub missing_mandatory: Option<String>,
}

pub async fn preview(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidateResponse>, ApiError> {
    caller.require(Capability::ReadRecords)?;
    let Json(request) = payload?;
    let response = ctx
        .run_blocking(move |_, conn| {
            let definition = match (&request.test_definition_id, &request.test_code) {
                (Some(id), _) => catalog::get_definition(conn, id)?,
                (None, Some(code)) => catalog::get_current(conn, code)?,
                (None, None) => {
                    return Err(CoreError::from(ValidationError::new(
                        "test_definition_id",
                        "either test_definition_id or test_code is required",
                    )))
                }
            };
            let evaluation = validator::evaluate(
                &definition,
                &request.values,
                request.gender,
                request.inconclusive,
            )?;
            let missing_mandatory = validator::check_mandatory(&definition, &evaluation.entries)
                .err()
                .map(|e| e.field);
            Ok(ValidateResponse {
                test_definition_id: definition.id,
                definition_version: definition.version,
                evaluation,
                missing_mandatory,
            })
        })
        .await?;
    Ok(Json(response))
}
