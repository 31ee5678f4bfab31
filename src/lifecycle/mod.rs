//! Order lifecycle engine.
//!
//! ```text
//! ordered → collected → processing → draft_result → pending_review → approved
//!    └──────────┴────────────┴─────────────┴──────────────┴──→ cancelled
//! ```
//!
//! Every write holds the order's guard from `OrderLocks` for the duration of
//! one `BEGIN IMMEDIATE` transaction, and the row update is conditional on the
//! version read inside that transaction. Two writers racing on one order
//! therefore run one after the other, and the loser sees the winner's state.

pub mod locks;
pub mod worklists;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::core_state::CoreError;
use crate::db::{self, write_transaction};
use crate::models::enums::{
    ApprovalPolicy, OrderStatus, OverallStatus, PatientStatus, ResultStatus,
};
use crate::models::{
    Collection, CriticalNotification, NewOrder, ResultSet, StatusChange, TestDefinition,
    TestOrder, MAX_PAGE_SIZE,
};
use crate::validator::{self, Submission, ValidationError};

use locks::OrderLocks;

// ═══════════════════════════════════════════════════════════
// Transition table
// ═══════════════════════════════════════════════════════════

/// States reachable from `from` in one step.
pub fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        Ordered => &[Collected, Cancelled],
        Collected => &[Processing, Cancelled],
        Processing => &[DraftResult, Cancelled],
        DraftResult => &[DraftResult, PendingReview, Cancelled],
        PendingReview => &[Approved, Cancelled],
        Approved | Cancelled => &[],
    }
}

/// Refuse any step not in the table. A second approval of the same order is
/// reported as a conflict: it lost a race rather than asked for nonsense.
pub fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), CoreError> {
    if allowed_transitions(from).contains(&to) {
        return Ok(());
    }
    if from == OrderStatus::Approved && to == OrderStatus::Approved {
        return Err(CoreError::Conflict("order is already approved".into()));
    }
    Err(CoreError::InvalidTransition { from, to })
}

// ═══════════════════════════════════════════════════════════
// Inputs and outputs
// ═══════════════════════════════════════════════════════════

/// Values for a draft save.
#[derive(Debug, Clone, Default)]
pub struct DraftInput {
    pub values: Submission,
    pub interpretation: Option<String>,
    /// Technician marks the run as ambiguous.
    pub inconclusive: bool,
}

/// An order together with its result set, as returned by result writes.
#[derive(Debug, Clone, Serialize)]
pub struct OrderWithResult {
    pub order: TestOrder,
    pub result: Option<ResultSet>,
}

/// One order's outcome within a batch approval.
#[derive(Debug)]
pub struct BatchApproval {
    pub order_id: Uuid,
    pub outcome: Result<OrderWithResult, CoreError>,
}

// ═══════════════════════════════════════════════════════════
// LifecycleEngine
// ═══════════════════════════════════════════════════════════

pub struct LifecycleEngine<'a> {
    conn: &'a Connection,
    locks: &'a OrderLocks,
    policy: ApprovalPolicy,
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(conn: &'a Connection, locks: &'a OrderLocks, policy: ApprovalPolicy) -> Self {
        Self {
            conn,
            locks,
            policy,
        }
    }

    /// Place an order against one specific, current definition version.
    pub fn create_order(
        &self,
        input: &NewOrder,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TestOrder, CoreError> {
        let clinician = input.ordering_clinician.trim();
        if clinician.is_empty() {
            return Err(ValidationError::new("ordering_clinician", "is required").into());
        }

        let tx = write_transaction(self.conn)?;
        let patient = db::get_patient(&tx, &input.patient_id)?
            .ok_or_else(|| CoreError::not_found("Patient", input.patient_id))?;
        if patient.status != PatientStatus::Active {
            return Err(CoreError::Conflict(format!(
                "patient {} is inactive",
                patient.patient_number
            )));
        }
        let definition = db::get_test_definition(&tx, &input.test_definition_id)?
            .ok_or_else(|| CoreError::not_found("TestDefinition", input.test_definition_id))?;
        if !definition.is_current {
            return Err(CoreError::Conflict(format!(
                "{} version {} has been superseded",
                definition.code, definition.version
            )));
        }

        let seq = db::next_sequence(&tx, "order")?;
        let order = TestOrder {
            id: Uuid::new_v4(),
            order_number: db::format_identifier("ORD", seq),
            patient_id: patient.id,
            test_definition_id: definition.id,
            test_code: definition.code.clone(),
            definition_version: definition.version,
            priority: input.priority,
            ordering_clinician: clinician.to_string(),
            status: OrderStatus::Ordered,
            collection: None,
            sample_id: None,
            cancel_reason: None,
            version: 1,
            ordered_at: now,
            updated_at: now,
            approved_at: None,
            turnaround_minutes: None,
        };
        db::insert_order(&tx, &order)?;
        db::insert_status_change(
            &tx,
            &StatusChange {
                order_id: order.id,
                from_status: None,
                to_status: OrderStatus::Ordered,
                actor: actor.to_string(),
                note: None,
                changed_at: now,
            },
        )?;
        tx.commit().map_err(db::DatabaseError::from)?;

        tracing::info!(
            order_number = %order.order_number,
            test = %order.test_code,
            priority = %order.priority,
            "Order created"
        );
        Ok(order)
    }

    /// Record specimen collection and assign a sample id.
    pub fn collect(
        &self,
        order_id: Uuid,
        collected_by: &str,
        collected_at: DateTime<Utc>,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<TestOrder, CoreError> {
        let collected_by = collected_by.trim();
        if collected_by.is_empty() {
            return Err(ValidationError::new("collected_by", "is required").into());
        }
        if collected_at > now {
            return Err(ValidationError::new("collected_at", "cannot be in the future").into());
        }

        self.with_order(order_id, expected_version, |conn, order| {
            ensure_transition(order.status, OrderStatus::Collected)?;
            if collected_at < order.ordered_at {
                return Err(ValidationError::new(
                    "collected_at",
                    "cannot precede the order time",
                )
                .into());
            }
            let definition = load_definition(conn, order)?;
            let sample_type = definition.sample_type.as_str();
            let seq = db::next_sequence(conn, &format!("sample_{sample_type}"))?;
            order.sample_id = Some(db::format_identifier(&sample_prefix(sample_type), seq));
            order.collection = Some(Collection {
                collected_by: collected_by.to_string(),
                collected_at,
            });
            advance(conn, order, OrderStatus::Collected, collected_by, None, now)?;
            Ok(order.clone())
        })
    }

    pub fn begin_processing(
        &self,
        order_id: Uuid,
        actor: &str,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<TestOrder, CoreError> {
        self.with_order(order_id, expected_version, |conn, order| {
            ensure_transition(order.status, OrderStatus::Processing)?;
            advance(conn, order, OrderStatus::Processing, actor, None, now)?;
            Ok(order.clone())
        })
    }

    /// Evaluate and store a draft. Saving again overwrites the same result
    /// set. A collected order is moved through processing on the way.
    pub fn save_draft(
        &self,
        order_id: Uuid,
        input: &DraftInput,
        technician: &str,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<OrderWithResult, CoreError> {
        let technician = technician.trim();
        if technician.is_empty() {
            return Err(ValidationError::new("performed_by", "is required").into());
        }

        self.with_order(order_id, expected_version, |conn, order| {
            if !order.status.accepts_results() {
                return Err(CoreError::Conflict(format!(
                    "order {} is {} and does not accept results",
                    order.order_number,
                    order.status.as_str()
                )));
            }

            let existing = db::get_result_set_for_order(conn, &order.id)?;
            if let Some(set) = &existing {
                ensure_owner(set, technician)?;
            }

            let definition = load_definition(conn, order)?;
            let gender = db::get_patient(conn, &order.patient_id)?.map(|p| p.gender);
            let evaluation =
                validator::evaluate(&definition, &input.values, gender, input.inconclusive)?;

            if order.status == OrderStatus::Collected {
                advance(conn, order, OrderStatus::Processing, technician, None, now)?;
            }
            if order.status == OrderStatus::DraftResult {
                // Overwrite keeps the state; only version and timestamp move.
                order.updated_at = now;
                db::update_order(conn, order)?;
            } else {
                advance(conn, order, OrderStatus::DraftResult, technician, None, now)?;
            }

            let interpretation = input
                .interpretation
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let set = match existing {
                Some(mut set) => {
                    set.entries = evaluation.entries;
                    set.overall_status = evaluation.overall_status;
                    set.interpretation = interpretation;
                    set.updated_at = now;
                    set
                }
                None => ResultSet {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    entries: evaluation.entries,
                    overall_status: evaluation.overall_status,
                    interpretation,
                    status: ResultStatus::Draft,
                    performed_by: technician.to_string(),
                    reviewed_by: None,
                    approved_by: None,
                    drafted_at: now,
                    submitted_at: None,
                    approved_at: None,
                    updated_at: now,
                },
            };
            db::save_result_set(conn, &set)?;

            tracing::debug!(
                order_number = %order.order_number,
                overall = %set.overall_status,
                entries = set.entries.len(),
                "Draft saved"
            );
            Ok(OrderWithResult {
                order: order.clone(),
                result: Some(set),
            })
        })
    }

    /// Hand the draft to a reviewer once every mandatory parameter has a value.
    pub fn submit_for_review(
        &self,
        order_id: Uuid,
        technician: &str,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<OrderWithResult, CoreError> {
        self.with_order(order_id, expected_version, |conn, order| {
            ensure_transition(order.status, OrderStatus::PendingReview)?;
            let mut set = require_result_set(conn, order)?;
            ensure_owner(&set, technician.trim())?;

            let definition = load_definition(conn, order)?;
            validator::check_mandatory(&definition, &set.entries)?;

            set.status = ResultStatus::PendingReview;
            set.submitted_at = Some(now);
            set.updated_at = now;
            db::save_result_set(conn, &set)?;
            advance(conn, order, OrderStatus::PendingReview, technician, None, now)?;

            Ok(OrderWithResult {
                order: order.clone(),
                result: Some(set),
            })
        })
    }

    /// Finalize. The approval timestamp and the result set are frozen from
    /// here on.
    pub fn approve(
        &self,
        order_id: Uuid,
        approver: &str,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<OrderWithResult, CoreError> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(ValidationError::new("approved_by", "is required").into());
        }

        self.with_order(order_id, expected_version, |conn, order| {
            ensure_transition(order.status, OrderStatus::Approved)?;
            let mut set = require_result_set(conn, order)?;
            if self.policy == ApprovalPolicy::Distinct && set.performed_by == approver {
                return Err(ValidationError::new(
                    "approved_by",
                    "must differ from the technician who performed the test",
                )
                .into());
            }

            set.status = ResultStatus::Approved;
            set.reviewed_by = Some(approver.to_string());
            set.approved_by = Some(approver.to_string());
            set.approved_at = Some(now);
            set.updated_at = now;
            db::save_result_set(conn, &set)?;

            order.approved_at = Some(now);
            order.turnaround_minutes = Some((now - order.ordered_at).num_minutes());
            advance(conn, order, OrderStatus::Approved, approver, None, now)?;

            tracing::info!(
                order_number = %order.order_number,
                turnaround_minutes = order.turnaround_minutes,
                "Order approved"
            );
            Ok(OrderWithResult {
                order: order.clone(),
                result: Some(set),
            })
        })
    }

    /// Cancel from any non-terminal state, voiding unapproved results.
    pub fn cancel(
        &self,
        order_id: Uuid,
        actor: &str,
        reason: &str,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<OrderWithResult, CoreError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::new("reason", "is required").into());
        }

        self.with_order(order_id, expected_version, |conn, order| {
            ensure_transition(order.status, OrderStatus::Cancelled)?;

            let mut result = db::get_result_set_for_order(conn, &order.id)?;
            if let Some(set) = result.as_mut() {
                if matches!(set.status, ResultStatus::Draft | ResultStatus::PendingReview) {
                    set.status = ResultStatus::Voided;
                    set.updated_at = now;
                    db::save_result_set(conn, set)?;
                }
            }

            order.cancel_reason = Some(reason.to_string());
            advance(
                conn,
                order,
                OrderStatus::Cancelled,
                actor,
                Some(reason.to_string()),
                now,
            )?;

            tracing::info!(order_number = %order.order_number, "Order cancelled");
            Ok(OrderWithResult {
                order: order.clone(),
                result,
            })
        })
    }

    /// Approve each order in turn. Every order succeeds or fails on its own:
    /// one failure neither stops the batch nor undoes earlier approvals.
    pub fn approve_batch(
        &self,
        order_ids: &[Uuid],
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchApproval>, CoreError> {
        if order_ids.is_empty() {
            return Err(ValidationError::new("order_ids", "must not be empty").into());
        }
        if order_ids.len() > MAX_PAGE_SIZE as usize {
            return Err(ValidationError::new(
                "order_ids",
                format!("at most {MAX_PAGE_SIZE} orders per batch"),
            )
            .into());
        }

        let outcomes: Vec<BatchApproval> = order_ids
            .iter()
            .map(|&order_id| BatchApproval {
                order_id,
                outcome: self.approve(order_id, approver, None, now),
            })
            .collect();

        let approved = outcomes.iter().filter(|b| b.outcome.is_ok()).count();
        tracing::info!(
            approved,
            failed = outcomes.len() - approved,
            "Batch approval finished"
        );
        Ok(outcomes)
    }

    /// Record that the responsible clinician was told about a critical
    /// result. The set leaves the critical worklist. Recording it twice, or
    /// for a set that is not critical, is a conflict.
    pub fn record_critical_notification(
        &self,
        order_id: Uuid,
        actor: &str,
        recipient: Option<&str>,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CriticalNotification, CoreError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(ValidationError::new("notified_by", "is required").into());
        }

        self.with_order(order_id, None, |conn, order| {
            let set = require_result_set(conn, order)?;
            if set.status == ResultStatus::Voided || set.overall_status != OverallStatus::Critical
            {
                return Err(CoreError::Conflict(format!(
                    "results for order {} are not critical",
                    order.order_number
                )));
            }
            if let Some(done) = db::get_critical_notification(conn, &set.id)? {
                return Err(CoreError::Conflict(format!(
                    "critical results for order {} were already notified by {}",
                    order.order_number, done.notified_by
                )));
            }

            let notification = CriticalNotification {
                result_set_id: set.id,
                order_id: order.id,
                notified_by: actor.to_string(),
                recipient: non_blank(recipient),
                note: non_blank(note),
                notified_at: now,
            };
            db::insert_critical_notification(conn, &notification)?;

            tracing::info!(order_number = %order.order_number, "Critical result notified");
            Ok(notification)
        })
    }

    /// Run `f` with the order's guard held and a write transaction open. The
    /// transaction commits only if `f` succeeds.
    fn with_order<T>(
        &self,
        order_id: Uuid,
        expected_version: Option<i64>,
        f: impl FnOnce(&Connection, &mut TestOrder) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let _guard = self.locks.acquire(order_id)?;
        let tx = write_transaction(self.conn)?;

        let mut order = db::get_order(&tx, &order_id)?
            .ok_or_else(|| CoreError::not_found("TestOrder", order_id))?;
        if let Some(expected) = expected_version {
            if expected != order.version {
                return Err(CoreError::Conflict(format!(
                    "order {} is at version {}, not {expected}",
                    order.order_number, order.version
                )));
            }
        }

        let conn: &Connection = &tx;
        let out = f(conn, &mut order)?;
        tx.commit().map_err(db::DatabaseError::from)?;
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

/// Write the order in its new state and append the history row.
fn advance(
    conn: &Connection,
    order: &mut TestOrder,
    to: OrderStatus,
    actor: &str,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let from = order.status;
    order.status = to;
    order.updated_at = now;
    db::update_order(conn, order)?;
    db::insert_status_change(
        conn,
        &StatusChange {
            order_id: order.id,
            from_status: Some(from),
            to_status: to,
            actor: actor.to_string(),
            note,
            changed_at: now,
        },
    )?;
    tracing::debug!(order_number = %order.order_number, %from, %to, "Order transition");
    Ok(())
}

fn load_definition(conn: &Connection, order: &TestOrder) -> Result<TestDefinition, CoreError> {
    db::get_test_definition(conn, &order.test_definition_id)?
        .ok_or_else(|| CoreError::not_found("TestDefinition", order.test_definition_id))
}

fn require_result_set(conn: &Connection, order: &TestOrder) -> Result<ResultSet, CoreError> {
    db::get_result_set_for_order(conn, &order.id)?
        .ok_or_else(|| CoreError::not_found("ResultSet", order.id))
}

/// Only the technician who started the result set may edit or submit it.
fn ensure_owner(set: &ResultSet, technician: &str) -> Result<(), CoreError> {
    if set.performed_by != technician {
        return Err(CoreError::Conflict(format!(
            "results are being entered by {}",
            set.performed_by
        )));
    }
    Ok(())
}

fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// `blood` → `BLO`, `csf` → `CSF`.
fn sample_prefix(sample_type: &str) -> String {
    sample_type.chars().take(3).collect::<String>().to_uppercase()
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
