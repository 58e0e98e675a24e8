//! Microsoft Graph module
//!
//! Token management, query composition, result reconciliation and the HTTP
//! client for the Graph mail and calendar collections.

pub mod auth;
pub mod client;
pub mod query;
pub mod reconcile;
pub mod token_cache;
pub mod token_manager;
pub mod types;
