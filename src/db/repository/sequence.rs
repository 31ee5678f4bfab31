use rusqlite::{params, Connection};

use crate::db::DatabaseError;

/// Atomically advance the named counter and return its new value (starting at 1).
pub fn next_sequence(conn: &Connection, name: &str) -> Result<i64, DatabaseError> {
    let value = conn.query_row(
        "INSERT INTO sequences (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(value)
}

/// Render `prefix` + zero-padded six-digit number, e.g. `P000042`.
pub fn format_identifier(prefix: &str, value: i64) -> String {
    format!("{prefix}{value:06}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn sequences_are_independent_and_monotonic() {
        let conn = open_memory_database().unwrap();
        assert_eq!(next_sequence(&conn, "patient").unwrap(), 1);
        assert_eq!(next_sequence(&conn, "patient").unwrap(), 2);
        assert_eq!(next_sequence(&conn, "order").unwrap(), 1);
        assert_eq!(next_sequence(&conn, "patient").unwrap(), 3);
    }

    #[test]
    fn identifiers_are_zero_padded() {
        assert_eq!(format_identifier("P", 1), "P000001");
        assert_eq!(format_identifier("ORD", 123456), "ORD123456");
        assert_eq!(format_identifier("P", 1234567), "P1234567");
    }
}
