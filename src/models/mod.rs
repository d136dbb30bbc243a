//! Core data models for the chunked upload service.
//!
//! `upload` holds the in-flight shapes that travel with each chunk request;
//! `file_record` is the durable row written once a merge has finished. Records
//! map to SQLite via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file_record;
pub mod upload;
