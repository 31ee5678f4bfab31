use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ParameterKind, SampleType, TestCategory};

/// One frozen version of a catalog test. Orders bind to `id`, so later
/// revisions of the same `code` never reach already-issued orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: Uuid,
    pub code: String,
    pub version: i64,
    pub name: String,
    pub category: TestCategory,
    pub sample_type: SampleType,
    pub is_current: bool,
    pub parameters: Vec<Parameter>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl TestDefinition {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub unit: Option<String>,
    pub kind: ParameterKind,
    pub reference_range: Option<String>,
    pub critical_values: Option<String>,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

/// Body of a catalog create or revise request; `code` comes separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionInput {
    pub name: String,
    pub category: TestCategory,
    pub sample_type: SampleType,
    pub parameters: Vec<Parameter>,
}

impl From<&TestDefinition> for DefinitionInput {
    fn from(definition: &TestDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            category: definition.category,
            sample_type: definition.sample_type,
            parameters: definition.parameters.clone(),
        }
    }
}
