use uuid::Uuid;

use super::enums::{OrderStatus, PatientStatus, Priority, TestCategory};

/// Default page size for patient search.
pub const DEFAULT_PAGE_SIZE: u32 = 25;
/// Upper bound on any single page.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct PatientQuery {
    /// Case-insensitive substring over patient number, names and phone.
    pub text: Option<String>,
    pub status: Option<PatientStatus>,
    /// Keyset cursor: only patients registered after this sequence number.
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

impl PatientQuery {
    pub fn page_size(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub patient_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub priority: Option<Priority>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub category: Option<TestCategory>,
}
