use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const RESULT_SET_COLUMNS: &str = "id, order_id, overall_status, interpretation, status,
     performed_by, reviewed_by, approved_by, drafted_at, submitted_at, approved_at, updated_at";

/// Write a result set and replace its entries. Approved sets are rejected by
/// the schema triggers.
pub fn save_result_set(conn: &Connection, set: &ResultSet) -> Result<(), DatabaseError> {
    // Entries go first: the delete trigger checks the stored status, which
    // must still be the pre-approval one when a set is being approved.
    conn.execute(
        "DELETE FROM result_entries WHERE result_set_id = ?1",
        params![set.id.to_string()],
    )?;
    conn.execute(
        "INSERT INTO result_sets (id, order_id, overall_status, interpretation, status,
         performed_by, reviewed_by, approved_by, drafted_at, submitted_at, approved_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             overall_status = excluded.overall_status,
             interpretation = excluded.interpretation,
             status = excluded.status,
             performed_by = excluded.performed_by,
             reviewed_by = excluded.reviewed_by,
             approved_by = excluded.approved_by,
             submitted_at = excluded.submitted_at,
             approved_at = excluded.approved_at,
             updated_at = excluded.updated_at",
        params![
            set.id.to_string(),
            set.order_id.to_string(),
            set.overall_status.as_str(),
            set.interpretation,
            set.status.as_str(),
            set.performed_by,
            set.reviewed_by,
            set.approved_by,
            format_timestamp(&set.drafted_at),
            set.submitted_at.as_ref().map(format_timestamp),
            set.approved_at.as_ref().map(format_timestamp),
            format_timestamp(&set.updated_at),
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO result_entries (result_set_id, position, parameter, value, numeric_value,
         unit, flag, reference_range, critical_values)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (position, entry) in set.entries.iter().enumerate() {
        stmt.execute(params![
            set.id.to_string(),
            position as i64,
            entry.parameter,
            entry.value,
            entry.numeric_value,
            entry.unit,
            entry.flag.as_str(),
            entry.reference_range,
            entry.critical_values,
        ])?;
    }
    Ok(())
}

pub fn get_result_set_for_order(
    conn: &Connection,
    order_id: &Uuid,
) -> Result<Option<ResultSet>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {RESULT_SET_COLUMNS} FROM result_sets WHERE order_id = ?1"),
            params![order_id.to_string()],
            result_set_row_from_rusqlite,
        )
        .optional()?;
    row.map(|r| result_set_from_row(conn, r)).transpose()
}

/// Live result sets carrying at least one critical value that nobody has
/// recorded as communicated yet, newest first.
pub fn list_critical_result_sets(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<ResultSet>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESULT_SET_COLUMNS} FROM result_sets
         WHERE overall_status = 'critical' AND status != 'voided'
           AND id NOT IN (SELECT result_set_id FROM critical_notifications)
         ORDER BY updated_at DESC
         LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], result_set_row_from_rusqlite)?;

    let mut sets = Vec::new();
    for row in rows {
        sets.push(result_set_from_row(conn, row?)?);
    }
    Ok(sets)
}

/// A second notification for the same set violates the primary key.
pub fn insert_critical_notification(
    conn: &Connection,
    notification: &CriticalNotification,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO critical_notifications
         (result_set_id, order_id, notified_by, recipient, note, notified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            notification.result_set_id.to_string(),
            notification.order_id.to_string(),
            notification.notified_by,
            notification.recipient,
            notification.note,
            format_timestamp(&notification.notified_at),
        ],
    )?;
    Ok(())
}

pub fn get_critical_notification(
    conn: &Connection,
    result_set_id: &Uuid,
) -> Result<Option<CriticalNotification>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT result_set_id, order_id, notified_by, recipient, note, notified_at
             FROM critical_notifications WHERE result_set_id = ?1",
            params![result_set_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(set_id, order_id, notified_by, recipient, note, notified_at)| -> Result<_, DatabaseError> {
            Ok(CriticalNotification {
                result_set_id: parse_uuid(&set_id)?,
                order_id: parse_uuid(&order_id)?,
                notified_by,
                recipient,
                note,
                notified_at: parse_timestamp(&notified_at)?,
            })
        },
    )
    .transpose()
}

pub fn count_results_by_overall_status(
    conn: &Connection,
) -> Result<Vec<(OverallStatus, i64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT overall_status, COUNT(*) FROM result_sets
         WHERE status != 'voided'
         GROUP BY overall_status ORDER BY overall_status",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts = Vec::new();
    for row in rows {
        let (status, count) = row?;
        counts.push((OverallStatus::from_str(&status)?, count));
    }
    Ok(counts)
}

fn load_entries(conn: &Connection, result_set_id: &str) -> Result<Vec<ResultEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT parameter, value, numeric_value, unit, flag, reference_range, critical_values
         FROM result_entries WHERE result_set_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![result_set_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (parameter, value, numeric_value, unit, flag, reference_range, critical_values) = row?;
        entries.push(ResultEntry {
            parameter,
            value,
            numeric_value,
            unit,
            flag: ResultFlag::from_str(&flag)?,
            reference_range,
            critical_values,
        });
    }
    Ok(entries)
}

// Internal row type for ResultSet mapping
struct ResultSetRow {
    id: String,
    order_id: String,
    overall_status: String,
    interpretation: Option<String>,
    status: String,
    performed_by: String,
    reviewed_by: Option<String>,
    approved_by: Option<String>,
    drafted_at: String,
    submitted_at: Option<String>,
    approved_at: Option<String>,
    updated_at: String,
}

fn result_set_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<ResultSetRow, rusqlite::Error> {
    Ok(ResultSetRow {
        id: row.get(0)?,
        order_id: row.get(1)?,
        overall_status: row.get(2)?,
        interpretation: row.get(3)?,
        status: row.get(4)?,
        performed_by: row.get(5)?,
        reviewed_by: row.get(6)?,
        approved_by: row.get(7)?,
        drafted_at: row.get(8)?,
        submitted_at: row.get(9)?,
        approved_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn result_set_from_row(conn: &Connection, row: ResultSetRow) -> Result<ResultSet, DatabaseError> {
    let entries = load_entries(conn, &row.id)?;
    Ok(ResultSet {
        id: parse_uuid(&row.id)?,
        order_id: parse_uuid(&row.order_id)?,
        entries,
        overall_status: OverallStatus::from_str(&row.overall_status)?,
        interpretation: row.interpretation,
        status: ResultStatus::from_str(&row.status)?,
        performed_by: row.performed_by,
        reviewed_by: row.reviewed_by,
        approved_by: row.approved_by,
        drafted_at: parse_timestamp(&row.drafted_at)?,
        submitted_at: parse_optional_timestamp(row.submitted_at)?,
        approved_at: parse_optional_timestamp(row.approved_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}
