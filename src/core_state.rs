//! Shared application state.
//!
//! `CoreState` is created once at startup, wrapped in `Arc`, and handed to
//! every request handler. It owns no connection: each operation opens its own,
//! so reads never queue behind one another. Writes to an order serialize
//! through `order_locks`.

use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::Connection;

use crate::catalog;
use crate::config::{ConfigError, ServerConfig};
use crate::db::{self, DatabaseError};
use crate::lifecycle::locks::{LockError, OrderLocks};
use crate::lifecycle::LifecycleEngine;
use crate::models::enums::OrderStatus;
use crate::validator::ValidationError;

/// Maximum audit buffer size before flush.
const AUDIT_BUFFER_CAPACITY: usize = 100;

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

pub struct CoreState {
    config: ServerConfig,
    order_locks: OrderLocks,
    /// Audit log for all API access events.
    audit: AuditLogger,
}

impl CoreState {
    /// Build state without touching the filesystem.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            order_locks: OrderLocks::new(config.store_timeout),
            config,
            audit: AuditLogger::new(),
        }
    }

    /// Create the data directory, migrate the database and seed the default
    /// catalog when it is empty.
    pub fn open(config: ServerConfig) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let state = Self::new(config);
        let conn = state.open_db()?;
        let seeded = catalog::seed_default_catalog(&conn, Utc::now())?;
        if seeded > 0 {
            tracing::info!(seeded, "Seeded default test catalog");
            state.log_access(AccessSource::System, "seed_catalog", "test_definitions");
        }
        tracing::info!(path = %state.config.db_path().display(), "Database ready");
        Ok(state)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open a fresh connection with the configured busy timeout.
    pub fn open_db(&self) -> Result<Connection, CoreError> {
        Ok(db::open_database(
            &self.config.db_path(),
            self.config.store_timeout,
        )?)
    }

    /// Lifecycle engine over `conn`, sharing this state's order locks.
    pub fn lifecycle<'a>(&'a self, conn: &'a Connection) -> LifecycleEngine<'a> {
        LifecycleEngine::new(conn, &self.order_locks, self.config.approval_policy)
    }

    // ── Audit logging ───────────────────────────────────────

    /// Log an access event. Auto-flushes to DB when buffer is full.
    pub fn log_access(&self, source: AccessSource, action: &str, entity: &str) {
        let needs_flush = self.audit.log(source, action, entity);
        if needs_flush {
            if let Err(e) = self.flush_and_prune_audit() {
                tracing::warn!("Auto-flush audit failed: {e}");
            }
        }
    }

    /// Flush audit buffer to DB and prune entries past the retention window.
    pub fn flush_and_prune_audit(&self) -> Result<(), CoreError> {
        let conn = self.open_db()?;
        self.audit.flush_to_db(&conn)?;
        let cutoff = Utc::now() - Duration::days(self.config.audit_retention_days);
        if let Err(e) = db::prune_audit_log(&conn, &cutoff) {
            tracing::warn!("Failed to prune audit log: {e}");
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Error types
// ═══════════════════════════════════════════════════════════

/// Errors from store, lifecycle and validation operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Internal lock error")]
    LockPoisoned,
    #[error("Database error: {0}")]
    Database(DatabaseError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Safe to retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<DatabaseError> for CoreError {
    fn from(err: DatabaseError) -> Self {
        if err.is_busy() {
            return Self::Timeout("database is busy".into());
        }
        if err.is_conflict() {
            return Self::Conflict(err.to_string());
        }
        match err {
            DatabaseError::NotFound { entity_type, id } => Self::NotFound {
                entity: entity_type,
                id,
            },
            stale @ DatabaseError::VersionConflict { .. } => Self::Conflict(stale.to_string()),
            other => Self::Database(other),
        }
    }
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(_) => Self::Timeout(err.to_string()),
            LockError::LockPoisoned => Self::LockPoisoned,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Access source tracking
// ═══════════════════════════════════════════════════════════

/// Identifies who caused a data access, for audit logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessSource {
    /// An authenticated API caller.
    Api { user_id: String },
    /// The server itself (startup, seeding).
    System,
}

impl std::fmt::Display for AccessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api { user_id } => write!(f, "api:{user_id}"),
            Self::System => write!(f, "system"),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Audit logger
// ═══════════════════════════════════════════════════════════

/// In-memory audit log buffer. Entries are flushed to SQLite
/// when the buffer reaches capacity or on explicit flush.
pub struct AuditLogger {
    buffer: Mutex<Vec<AuditEntry>>,
}

/// A single audit log entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub source: AccessSource,
    pub action: String,
    pub entity: String,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(AUDIT_BUFFER_CAPACITY)),
        }
    }

    /// Log an access event to the in-memory buffer.
    /// Returns `true` if the buffer has reached flush threshold.
    pub fn log(&self, source: AccessSource, action: &str, entity: &str) -> bool {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(AuditEntry {
                timestamp: Utc::now(),
                source,
                action: action.to_string(),
                entity: entity.to_string(),
            });
            buf.len() >= AUDIT_BUFFER_CAPACITY
        } else {
            false
        }
    }

    /// Drain all buffered entries (for flush to SQLite).
    pub fn drain(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|mut buf| buf.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put entries that failed to persist back at the front of the buffer.
    fn requeue(&self, entries: Vec<AuditEntry>) {
        if let Ok(mut buf) = self.buffer.lock() {
            let newer = std::mem::replace(&mut *buf, entries);
            buf.extend(newer);
        }
    }

    /// Flush buffered entries to SQLite. On failure the entries stay buffered
    /// for the next flush.
    pub fn flush_to_db(&self, conn: &Connection) -> Result<usize, CoreError> {
        let entries = self.drain();
        if entries.is_empty() {
            return Ok(0);
        }

        let rows: Vec<db::AuditRow> = entries
            .iter()
            .map(|e| {
                (
                    e.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                    e.source.to_string(),
                    e.action.clone(),
                    e.entity.clone(),
                )
            })
            .collect();

        let count = rows.len();
        if let Err(e) = db::insert_audit_entries(conn, &rows) {
            self.requeue(entries);
            return Err(e.into());
        }

        tracing::debug!(count, "Flushed audit entries to database");
        Ok(count)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn buffered(logger: &AuditLogger) -> Vec<AuditEntry> {
        logger.buffer.lock().unwrap().clone()
    }

    fn temp_config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            data_dir: dir.path().join("data"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn open_creates_directory_and_seeds_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let state = CoreState::open(temp_config(&dir)).unwrap();
        assert!(state.config().db_path().exists());

        let conn = state.open_db().unwrap();
        assert!(db::count_test_definitions(&conn).unwrap() >= 4);

        let seeded = buffered(&state.audit);
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].source, AccessSource::System);
        assert_eq!(seeded[0].action, "seed_catalog");
    }

    #[test]
    fn reopening_does_not_seed_twice() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let state = CoreState::open(temp_config(&dir)).unwrap();
            db::count_test_definitions(&state.open_db().unwrap()).unwrap()
        };
        let state = CoreState::open(temp_config(&dir)).unwrap();
        let second = db::count_test_definitions(&state.open_db().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn busy_database_maps_to_timeout() {
        let busy = DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        let err = CoreError::from(busy);
        assert!(matches!(err, CoreError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn stale_version_maps_to_conflict() {
        let err = CoreError::from(DatabaseError::VersionConflict {
            entity_type: "TestOrder".into(),
            id: "x".into(),
            expected: 3,
        });
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        let err = CoreError::from(DatabaseError::NotFound {
            entity_type: "Patient".into(),
            id: "abc".into(),
        });
        assert_eq!(err.to_string(), "Patient not found: abc");
    }

    #[test]
    fn lock_timeout_is_retryable() {
        let err = CoreError::from(LockError::Timeout(uuid::Uuid::nil()));
        assert!(err.is_retryable());
    }

    #[test]
    fn access_source_display() {
        assert_eq!(AccessSource::System.to_string(), "system");
        assert_eq!(
            AccessSource::Api {
                user_id: "tech-7".into()
            }
            .to_string(),
            "api:tech-7"
        );
    }

    #[test]
    fn audit_logger_records_and_drains() {
        let logger = AuditLogger::new();
        logger.log(AccessSource::System, "seed_catalog", "test_definitions");
        assert_eq!(buffered(&logger)[0].action, "seed_catalog");

        assert_eq!(logger.drain().len(), 1);
        assert!(buffered(&logger).is_empty());
    }

    #[test]
    fn audit_log_returns_true_at_capacity() {
        let logger = AuditLogger::new();
        for i in 0..(AUDIT_BUFFER_CAPACITY - 1) {
            assert!(!logger.log(AccessSource::System, &format!("action_{i}"), "entity"));
        }
        assert!(logger.log(AccessSource::System, "action_final", "entity"));
    }

    #[test]
    fn audit_flush_to_db_persists_entries() {
        let conn = open_memory_database().unwrap();
        let logger = AuditLogger::new();
        logger.log(
            AccessSource::Api {
                user_id: "dr-1".into(),
            },
            "GET /api/orders",
            "orders",
        );
        logger.log(AccessSource::System, "seed_catalog", "test_definitions");

        assert_eq!(logger.flush_to_db(&conn).unwrap(), 2);
        assert!(buffered(&logger).is_empty());

        let sources: Vec<String> = conn
            .prepare("SELECT source FROM audit_log ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sources, vec!["api:dr-1", "system"]);
    }

    #[test]
    fn flush_on_empty_buffer_is_noop() {
        let conn = open_memory_database().unwrap();
        assert_eq!(AuditLogger::new().flush_to_db(&conn).unwrap(), 0);
    }

    #[test]
    fn state_flush_writes_to_its_database() {
        let dir = tempfile::tempdir().unwrap();
        let state = CoreState::open(temp_config(&dir)).unwrap();
        state.log_access(
            AccessSource::Api {
                user_id: "dr-1".into(),
            },
            "GET /api/orders",
            "orders",
        );
        state.flush_and_prune_audit().unwrap();
        assert!(buffered(&state.audit).is_empty());

        let count: i64 = state
            .open_db()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))
            .unwrap();
        // seed_catalog plus the request
        assert_eq!(count, 2);
    }

    #[test]
    fn failed_flush_keeps_entries_buffered() {
        let conn = open_memory_database().unwrap();
        let logger = AuditLogger::new();
        logger.log(AccessSource::System, "first", "orders");
        logger.log(AccessSource::System, "second", "orders");

        conn.execute_batch("DROP TABLE audit_log").unwrap();
        assert!(logger.flush_to_db(&conn).is_err());
        logger.log(AccessSource::System, "third", "orders");

        let actions: Vec<String> = buffered(&logger).into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["first", "second", "third"]);
    }

    #[test]
    fn failed_flush_is_retried_on_next_flush() {
        let dir = tempfile::tempdir().unwrap();
        let state = CoreState::open(temp_config(&dir)).unwrap();
        let conn = state.open_db().unwrap();
        conn.execute_batch("ALTER TABLE audit_log RENAME TO audit_log_away")
            .unwrap();
        assert!(state.flush_and_prune_audit().is_err());
        assert_eq!(buffered(&state.audit).len(), 1);

        conn.execute_batch("ALTER TABLE audit_log_away RENAME TO audit_log")
            .unwrap();
        state.flush_and_prune_audit().unwrap();
        assert!(buffered(&state.audit).is_empty());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
