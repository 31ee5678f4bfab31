//! API middleware stack.
//!
//! Execution order (outermost → innermost):
//! 1. Identity: rejects callers without a known id and role
//! 2. Audit logger: records caller, route and status

pub mod audit;
pub mod identity;
