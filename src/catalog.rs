//! Versioned test catalog.
//!
//! A definition version is never edited. Revising a test writes version N+1
//! and retires N, so orders placed against N keep evaluating against N.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;
use uuid::Uuid;

use crate::core_state::CoreError;
use crate::db::{self, write_transaction};
use crate::models::enums::{ParameterKind, SampleType, TestCategory};
use crate::models::{DefinitionFilter, DefinitionInput, Parameter, TestDefinition};
use crate::validator::{validate_parameters, ValidationError};

static TEST_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9_-]{0,19}$").unwrap());

const SEED_AUTHOR: &str = "system";

/// Upper-case and check a catalog code.
pub fn normalize_code(raw: &str) -> Result<String, ValidationError> {
    let code = raw.trim().to_uppercase();
    if !TEST_CODE.is_match(&code) {
        return Err(ValidationError::new(
            "code",
            "must be 1-20 letters, digits, '-' or '_'",
        ));
    }
    Ok(code)
}

/// Add a new test to the catalog as version 1.
pub fn create_definition(
    conn: &Connection,
    code: &str,
    input: &DefinitionInput,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<TestDefinition, CoreError> {
    let code = normalize_code(code)?;
    validate_input(input)?;

    let tx = write_transaction(conn)?;
    if !db::list_definition_versions(&tx, &code)?.is_empty() {
        return Err(CoreError::Conflict(format!(
            "test code {code} already exists; revise it instead"
        )));
    }
    let definition = build_definition(code, 1, input, created_by, now);
    db::insert_test_definition(&tx, &definition)?;
    tx.commit().map_err(db::DatabaseError::from)?;

    tracing::info!(code = %definition.code, "Created test definition");
    Ok(definition)
}

/// Write the next version of `code` and retire the current one.
///
/// `expected_version`, when given, must equal the current version number.
pub fn revise_definition(
    conn: &Connection,
    code: &str,
    input: &DefinitionInput,
    expected_version: Option<i64>,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<TestDefinition, CoreError> {
    let code = normalize_code(code)?;
    validate_input(input)?;

    let tx = write_transaction(conn)?;
    let current = db::get_current_definition(&tx, &code)?
        .ok_or_else(|| CoreError::not_found("TestDefinition", &code))?;
    if let Some(expected) = expected_version {
        if expected != current.version {
            return Err(CoreError::Conflict(format!(
                "{code} is at version {}, not {expected}",
                current.version
            )));
        }
    }

    db::mark_superseded(&tx, &current.id)?;
    let definition = build_definition(code, current.version + 1, input, created_by, now);
    db::insert_test_definition(&tx, &definition)?;
    tx.commit().map_err(db::DatabaseError::from)?;

    tracing::info!(
        code = %definition.code,
        version = definition.version,
        "Revised test definition"
    );
    Ok(definition)
}

pub fn get_definition(conn: &Connection, id: &Uuid) -> Result<TestDefinition, CoreError> {
    db::get_test_definition(conn, id)?.ok_or_else(|| CoreError::not_found("TestDefinition", id))
}

pub fn get_current(conn: &Connection, code: &str) -> Result<TestDefinition, CoreError> {
    let code = code.trim().to_uppercase();
    db::get_current_definition(conn, &code)?
        .ok_or_else(|| CoreError::not_found("TestDefinition", &code))
}

pub fn list_current(
    conn: &Connection,
    filter: &DefinitionFilter,
) -> Result<Vec<TestDefinition>, CoreError> {
    Ok(db::list_current_definitions(conn, filter)?)
}

/// All versions of `code`, oldest first.
pub fn history(conn: &Connection, code: &str) -> Result<Vec<TestDefinition>, CoreError> {
    let code = code.trim().to_uppercase();
    let versions = db::list_definition_versions(conn, &code)?;
    if versions.is_empty() {
        return Err(CoreError::not_found("TestDefinition", &code));
    }
    Ok(versions)
}

fn validate_input(input: &DefinitionInput) -> Result<(), ValidationError> {
    if input.name.trim().is_empty() {
        return Err(ValidationError::new("name", "is required"));
    }
    validate_parameters(&input.parameters)
}

fn build_definition(
    code: String,
    version: i64,
    input: &DefinitionInput,
    created_by: &str,
    now: DateTime<Utc>,
) -> TestDefinition {
    TestDefinition {
        id: Uuid::new_v4(),
        code,
        version,
        name: input.name.trim().to_string(),
        category: input.category,
        sample_type: input.sample_type,
        is_current: true,
        parameters: input
            .parameters
            .iter()
            .map(|p| Parameter {
                name: p.name.trim().to_string(),
                ..p.clone()
            })
            .collect(),
        created_by: created_by.to_string(),
        created_at: now,
    }
}

// ═══════════════════════════════════════════════════════════
// Default catalog
// ═══════════════════════════════════════════════════════════

fn numeric(name: &str, unit: &str, range: &str, critical: &str) -> Parameter {
    Parameter {
        name: name.into(),
        unit: Some(unit.into()).filter(|u: &String| !u.is_empty()),
        kind: ParameterKind::Numeric,
        reference_range: Some(range.into()),
        critical_values: Some(critical.into()),
        mandatory: true,
    }
}

fn categorical(name: &str, expected: &str, critical: Option<&str>, mandatory: bool) -> Parameter {
    Parameter {
        name: name.into(),
        unit: None,
        kind: ParameterKind::Categorical,
        reference_range: Some(expected.into()),
        critical_values: critical.map(str::to_string),
        mandatory,
    }
}

fn default_catalog() -> Vec<(&'static str, DefinitionInput)> {
    vec![
        (
            "CBC",
            DefinitionInput {
                name: "Complete Blood Count".into(),
                category: TestCategory::Hematology,
                sample_type: SampleType::Blood,
                parameters: vec![
                    numeric("WBC", "10^3/uL", "4.0-11.0", "<2.0 or >30.0"),
                    numeric("RBC", "10^6/uL", "4.2-5.4", "<2.5 or >7.0"),
                    numeric("Hemoglobin", "g/dL", "12.0-16.0", "<7.0 or >20.0"),
                    numeric("Hematocrit", "%", "36-46", "<20 or >60"),
                    numeric("Platelets", "10^3/uL", "150-450", "<50 or >1000"),
                ],
            },
        ),
        (
            "BMP",
            DefinitionInput {
                name: "Basic Metabolic Panel".into(),
                category: TestCategory::Chemistry,
                sample_type: SampleType::Serum,
                parameters: vec![
                    numeric("Glucose", "mg/dL", "70-100", "<40 or >400"),
                    numeric("BUN", "mg/dL", "7-20", ">100"),
                    numeric("Creatinine", "mg/dL", "0.6-1.2", ">5.0"),
                    numeric("Sodium", "mEq/L", "136-145", "<120 or >160"),
                    numeric("Potassium", "mEq/L", "3.5-5.1", "<2.5 or >6.5"),
                    numeric("Chloride", "mEq/L", "98-107", "<80 or >120"),
                    numeric("CO2", "mEq/L", "22-29", "<10 or >40"),
                ],
            },
        ),
        (
            "LIPID",
            DefinitionInput {
                name: "Lipid Panel".into(),
                category: TestCategory::Chemistry,
                sample_type: SampleType::Serum,
                parameters: vec![
                    numeric("Total Cholesterol", "mg/dL", "<200", ">400"),
                    numeric("HDL Cholesterol", "mg/dL", ">40 (M), >50 (F)", "<20"),
                    numeric("LDL Cholesterol", "mg/dL", "<100", ">300"),
                    numeric("Triglycerides", "mg/dL", "<150", ">1000"),
                ],
            },
        ),
        (
            "UA",
            DefinitionInput {
                name: "Urinalysis".into(),
                category: TestCategory::Chemistry,
                sample_type: SampleType::Urine,
                parameters: vec![
                    categorical("Color", "Yellow", None, false),
                    categorical("Clarity", "Clear", None, false),
                    numeric("Specific Gravity", "", "1.003-1.030", "<1.001 or >1.035"),
                    numeric("pH", "", "4.6-8.0", "<4.0 or >9.0"),
                    categorical("Protein", "Negative", Some(">300"), true),
                    categorical("Blood", "Negative", Some("3+ or 4+"), true),
                    categorical("Leukocyte Esterase", "Negative", Some("3+ or 4+"), true),
                ],
            },
        ),
    ]
}

/// Load the default panels when the catalog is empty. Returns how many
/// definitions were written.
pub fn seed_default_catalog(conn: &Connection, now: DateTime<Utc>) -> Result<usize, CoreError> {
    let tx = write_transaction(conn)?;
    if db::count_test_definitions(&tx)? > 0 {
        return Ok(0);
    }
    let panels = default_catalog();
    for (code, input) in &panels {
        validate_input(input)?;
        let definition = build_definition(code.to_string(), 1, input, SEED_AUTHOR, now);
        db::insert_test_definition(&tx, &definition)?;
    }
    tx.commit().map_err(db::DatabaseError::from)?;
    Ok(panels.len())
}
