//! Result validation: turns submitted parameter values into flagged result
//! entries against the bound test definition version.

pub mod range;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::enums::{Gender, OverallStatus, ParameterKind, ResultFlag};
use crate::models::{Parameter, ResultEntry, TestDefinition};

use range::{CriticalThresholds, RangeSpec, ReferenceRange};

/// A rejected input, naming the offending field or parameter.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A value as the client sent it; numbers may arrive as JSON numbers or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmittedValue {
    Number(f64),
    Text(String),
}

impl SubmittedValue {
    fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(t) => t.trim().to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(t) if t.trim().is_empty())
    }
}

/// Values keyed by parameter name.
pub type Submission = BTreeMap<String, SubmittedValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub entries: Vec<ResultEntry>,
    pub overall_status: OverallStatus,
}

/// Flag every submitted value and derive the overall status.
///
/// The whole submission is rejected on the first unknown parameter or
/// malformed number. Blank values are treated as not yet entered.
pub fn evaluate(
    definition: &TestDefinition,
    values: &Submission,
    gender: Option<Gender>,
    inconclusive: bool,
) -> Result<Evaluation, ValidationError> {
    let mut claimed = HashSet::new();
    for name in values.keys() {
        let Some(param) = definition.parameter(name) else {
            return Err(ValidationError::new(
                name.as_str(),
                format!(
                    "not a parameter of {} version {}",
                    definition.code, definition.version
                ),
            ));
        };
        if !claimed.insert(param.name.as_str()) {
            return Err(ValidationError::new(
                param.name.as_str(),
                "submitted more than once under different spellings",
            ));
        }
    }

    let mut entries = Vec::new();
    for param in &definition.parameters {
        let submitted = values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&param.name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_blank());
        if let Some(value) = submitted {
            entries.push(evaluate_parameter(param, value, gender)?);
        }
    }

    let overall_status = overall_status(&entries, inconclusive);
    Ok(Evaluation {
        entries,
        overall_status,
    })
}

/// `critical` beats everything, then an explicit inconclusive marker, then
/// `abnormal` if anything is outside its range.
pub fn overall_status(entries: &[ResultEntry], inconclusive: bool) -> OverallStatus {
    if entries.iter().any(|e| e.flag.is_critical()) {
        OverallStatus::Critical
    } else if inconclusive {
        OverallStatus::Inconclusive
    } else if entries.iter().any(|e| e.flag.is_abnormal()) {
        OverallStatus::Abnormal
    } else {
        OverallStatus::Normal
    }
}

/// First mandatory parameter of `definition` without an entry.
pub fn check_mandatory(
    definition: &TestDefinition,
    entries: &[ResultEntry],
) -> Result<(), ValidationError> {
    let missing = definition
        .parameters
        .iter()
        .filter(|p| p.mandatory)
        .find(|p| !entries.iter().any(|e| e.parameter.eq_ignore_ascii_case(&p.name)));
    match missing {
        Some(param) => Err(ValidationError::new(
            param.name.as_str(),
            "mandatory parameter has no value",
        )),
        None => Ok(()),
    }
}

fn evaluate_parameter(
    param: &Parameter,
    value: &SubmittedValue,
    gender: Option<Gender>,
) -> Result<ResultEntry, ValidationError> {
    let invalid = |msg: String| ValidationError::new(param.name.as_str(), msg);

    let range = param
        .reference_range
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(RangeSpec::parse)
        .transpose()
        .map_err(invalid)?;
    let critical = param
        .critical_values
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(CriticalThresholds::parse)
        .transpose()
        .map_err(invalid)?
        .unwrap_or_default();
    let selected = range.as_ref().map(|r| r.select(gender));

    let text = value.as_text();
    let (numeric_value, flag) = match param.kind {
        ParameterKind::Numeric => {
            let n = parse_number(value)
                .ok_or_else(|| invalid(format!("expected a number, got {text:?}")))?;
            let flag = critical
                .classify(n)
                .or_else(|| selected.and_then(|r| r.classify(n)))
                .unwrap_or(ResultFlag::Normal);
            (Some(n), flag)
        }
        ParameterKind::Categorical => {
            let n = parse_number(value);
            let flag = categorical_flag(&text, n, selected, &critical);
            (n, flag)
        }
    };

    Ok(ResultEntry {
        parameter: param.name.clone(),
        value: text,
        numeric_value,
        unit: param.unit.clone(),
        flag,
        reference_range: param.reference_range.clone(),
        critical_values: param.critical_values.clone(),
    })
}

fn categorical_flag(
    text: &str,
    numeric: Option<f64>,
    range: Option<&ReferenceRange>,
    critical: &CriticalThresholds,
) -> ResultFlag {
    if critical.matches_text(text) {
        return ResultFlag::CriticalHigh;
    }
    if let Some(flag) = numeric.and_then(|n| critical.classify(n)) {
        return flag;
    }
    match range {
        None => ResultFlag::Normal,
        Some(ReferenceRange::Expected(expected)) => {
            if expected.eq_ignore_ascii_case(text) {
                ResultFlag::Normal
            } else {
                ResultFlag::Abnormal
            }
        }
        Some(numeric_range) => numeric
            .and_then(|n| numeric_range.classify(n))
            .unwrap_or(ResultFlag::Abnormal),
    }
}

fn parse_number(value: &SubmittedValue) -> Option<f64> {
    let n = match value {
        SubmittedValue::Number(n) => *n,
        SubmittedValue::Text(t) => t.trim().parse::<f64>().ok()?,
    };
    n.is_finite().then_some(n)
}

/// Check a catalog parameter list before it is stored: unique non-blank
/// names, parseable range texts, and numeric ranges on numeric parameters.
pub fn validate_parameters(parameters: &[Parameter]) -> Result<(), ValidationError> {
    if parameters.is_empty() {
        return Err(ValidationError::new(
            "parameters",
            "a test definition needs at least one parameter",
        ));
    }

    let mut seen = HashSet::new();
    for (i, param) in parameters.iter().enumerate() {
        let name = param.name.trim();
        if name.is_empty() {
            return Err(ValidationError::new(
                format!("parameters[{i}].name"),
                "parameter name is required",
            ));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(ValidationError::new(name, "duplicate parameter name"));
        }

        if let Some(text) = param.reference_range.as_deref().filter(|t| !t.trim().is_empty()) {
            let spec = RangeSpec::parse(text).map_err(|e| ValidationError::new(name, e))?;
            if param.kind == ParameterKind::Numeric && !spec.is_numeric() {
                return Err(ValidationError::new(
                    name,
                    format!("reference range {text:?} is not numeric"),
                ));
            }
        }
        if let Some(text) = param.critical_values.as_deref().filter(|t| !t.trim().is_empty()) {
            let critical =
                CriticalThresholds::parse(text).map_err(|e| ValidationError::new(name, e))?;
            if param.kind == ParameterKind::Numeric && !critical.is_numeric() {
                return Err(ValidationError::new(
                    name,
                    format!("critical values {text:?} are not numeric thresholds"),
                ));
            }
        }
    }
    Ok(())
}
