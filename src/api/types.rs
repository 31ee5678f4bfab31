//! Shared types for the API layer.

use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::authorization::{check_capability, Capability};
use crate::core_state::{CoreError, CoreState};
use crate::models::enums::Role;

// ═══════════════════════════════════════════════════════════
// API context: shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }

    /// Run store work on the blocking pool with a fresh connection.
    ///
    /// The whole call is bounded by the configured request timeout; a request
    /// that exceeds it gets a retryable `Timeout` rather than hanging.
    pub async fn run_blocking<T, F>(&self, work: F) -> Result<T, ApiError>
    where
        F: FnOnce(&CoreState, &Connection) -> Result<T, CoreError> + Send + 'static,
        T: Send + 'static,
    {
        let core = self.core.clone();
        let limit = core.config().request_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let conn = core.open_db()?;
            work(&core, &conn)
        });

        match tokio::time::timeout(limit, task).await {
            Err(_) => {
                tracing::warn!(?limit, "Request exceeded store timeout");
                Err(ApiError::Timeout("the store did not answer in time".into()))
            }
            Ok(Err(join)) => Err(ApiError::Internal(format!("blocking task failed: {join}"))),
            Ok(Ok(result)) => result.map_err(ApiError::from),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Caller context: injected by identity middleware
// ═══════════════════════════════════════════════════════════

/// Identity asserted by the upstream identity provider.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: String,
    pub role: Role,
}

impl CallerContext {
    /// Refuse the request unless this caller's role carries `capability`.
    pub fn require(&self, capability: Capability) -> Result<(), ApiError> {
        let decision = check_capability(self.role, capability);
        if decision.allowed {
            return Ok(());
        }
        tracing::warn!(
            user_id = %self.user_id,
            role = %decision.role,
            capability = decision.capability.as_str(),
            "Capability denied"
        );
        Err(ApiError::Forbidden(capability))
    }
}

/// Parse a path id, naming what it should identify on failure.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| ApiError::BadRequest(format!("Invalid {what} ID: {e}")))
}
