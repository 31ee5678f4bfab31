//! Read side of the order lifecycle: lookups, worklists and lab statistics.
//! None of these take an order lock.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use super::OrderWithResult;
use crate::core_state::CoreError;
use crate::db;
use crate::models::enums::OrderStatus;
use crate::models::{OrderFilter, ResultSet, StatusChange, TestOrder, MAX_PAGE_SIZE};

pub fn get_order(conn: &Connection, id: &Uuid) -> Result<TestOrder, CoreError> {
    db::get_order(conn, id)?.ok_or_else(|| CoreError::not_found("TestOrder", id))
}

pub fn list_orders(conn: &Connection, filter: &OrderFilter) -> Result<Vec<TestOrder>, CoreError> {
    Ok(db::list_orders(conn, filter)?)
}

/// Recorded transitions, oldest first.
pub fn order_history(conn: &Connection, id: &Uuid) -> Result<Vec<StatusChange>, CoreError> {
    get_order(conn, id)?;
    Ok(db::get_status_history(conn, id)?)
}

pub fn result_set(conn: &Connection, order_id: &Uuid) -> Result<ResultSet, CoreError> {
    get_order(conn, order_id)?;
    db::get_result_set_for_order(conn, order_id)?
        .ok_or_else(|| CoreError::not_found("ResultSet", order_id))
}

/// Orders waiting for a reviewer, most urgent first.
pub fn pending_review(conn: &Connection, limit: Option<u32>) -> Result<Vec<TestOrder>, CoreError> {
    list_orders(
        conn,
        &OrderFilter {
            status: Some(OrderStatus::PendingReview),
            limit: Some(limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)),
            ..Default::default()
        },
    )
}

/// Live result sets with a critical value, newest first, each with its order.
pub fn critical_results(
    conn: &Connection,
    limit: Option<u32>,
) -> Result<Vec<OrderWithResult>, CoreError> {
    let limit = limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
    db::list_critical_result_sets(conn, limit)?
        .into_iter()
        .map(|set| {
            Ok(OrderWithResult {
                order: get_order(conn, &set.order_id)?,
                result: Some(set),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct LabStats {
    pub total_orders: i64,
    pub orders_by_status: BTreeMap<&'static str, i64>,
    pub results_by_overall_status: BTreeMap<&'static str, i64>,
    /// Mean ordered-to-approved minutes over approved orders.
    pub average_turnaround_minutes: Option<f64>,
}

pub fn lab_stats(conn: &Connection) -> Result<LabStats, CoreError> {
    let orders_by_status: BTreeMap<&'static str, i64> = db::count_orders_by_status(conn)?
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();
    let results_by_overall_status = db::count_results_by_overall_status(conn)?
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();
    Ok(LabStats {
        total_orders: orders_by_status.values().sum(),
        orders_by_status,
        results_by_overall_status,
        average_turnaround_minutes: db::average_turnaround_minutes(conn)?,
    })
}
