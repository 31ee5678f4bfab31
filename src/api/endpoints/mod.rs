//! API endpoint handlers.
//!
//! Handlers parse and authorize, then hand the store work to
//! `ApiContext::run_blocking`. Business rules stay in the service modules.

pub mod catalog;
pub mod health;
pub mod orders;
pub mod patients;
pub mod validate;
pub mod worklists;
