//! HTTP API gateway.
//!
//! Exposes the registry, catalog, lifecycle and validator as JSON endpoints.
//! Routes are nested under `/api/` and, except for `/api/health`, pass
//! through Identity → Audit → Handler.
//!
//! The router is composable: `api_router()` returns a `Router` that can be
//! mounted on any axum server instance.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer, ServerError};
pub use types::ApiContext;
