use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::format_timestamp;
use crate::db::sqlite::write_transaction;
use crate::db::DatabaseError;

/// One buffered access record: (timestamp, source, action, entity).
pub type AuditRow = (String, String, String, String);

/// Insert a batch of audit entries into the audit_log table. All or nothing.
pub fn insert_audit_entries(conn: &Connection, entries: &[AuditRow]) -> Result<(), DatabaseError> {
    let tx = write_transaction(conn)?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO audit_log (timestamp, source, action, entity) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (timestamp, source, action, entity) in entries {
            stmt.execute(params![timestamp, source, action, entity])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Delete audit entries recorded before `cutoff`.
pub fn prune_audit_log(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM audit_log WHERE timestamp < ?1",
        params![format_timestamp(cutoff)],
    )?;
    Ok(deleted)
}
