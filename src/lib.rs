//! Attachment Server
//!
//! Resumable chunked uploads for contract attachments, backed by SQLite
//! session records and a local staging area.

pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
