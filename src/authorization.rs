//! Role-based capability checks.
//!
//! Roles come from the external identity provider; this module only decides
//! whether a role may invoke a class of operation. Business rules (who may
//! approve whose results, which transitions are legal) live in the lifecycle
//! engine, not here.
//!
//! Default-deny: a capability not listed for a role is refused.

use serde::Serialize;

use crate::models::enums::Role;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// A class of gateway operation guarded by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadRecords,
    RegisterPatients,
    ManageCatalog,
    OrderTests,
    CollectSamples,
    EnterResults,
    ApproveResults,
    CancelOrders,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadRecords => "read_records",
            Self::RegisterPatients => "register_patients",
            Self::ManageCatalog => "manage_catalog",
            Self::OrderTests => "order_tests",
            Self::CollectSamples => "collect_samples",
            Self::EnterResults => "enter_results",
            Self::ApproveResults => "approve_results",
            Self::CancelOrders => "cancel_orders",
        }
    }
}

/// Result of an authorization check: kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub role: Role,
    pub capability: Capability,
}

// ═══════════════════════════════════════════════════════════
// Capability matrix
// ═══════════════════════════════════════════════════════════

/// Roles granted each capability.
fn granted_roles(capability: Capability) -> &'static [Role] {
    use Role::*;
    match capability {
        Capability::ReadRecords => &[SuperAdmin, Admin, LabTechnician, Doctor, Nurse, Receptionist],
        Capability::RegisterPatients => &[SuperAdmin, Admin, Receptionist, Nurse, Doctor],
        Capability::ManageCatalog => &[SuperAdmin, Admin],
        Capability::OrderTests => &[SuperAdmin, Admin, Doctor, Nurse, Receptionist],
        Capability::CollectSamples => &[SuperAdmin, Admin, Nurse, LabTechnician],
        Capability::EnterResults => &[SuperAdmin, Admin, LabTechnician],
        Capability::ApproveResults => &[SuperAdmin, Admin, LabTechnician, Doctor],
        Capability::CancelOrders => &[SuperAdmin, Admin, Doctor, Nurse, LabTechnician],
    }
}

/// Check whether `role` may exercise `capability`.
pub fn check_capability(role: Role, capability: Capability) -> AccessDecision {
    AccessDecision {
        allowed: granted_roles(capability).contains(&role),
        role,
        capability,
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
