//! Upload pipeline and catalog services.
//!
//! Chunks flow `upload_service` → `chunk_store` / `session_registry` →
//! `merge_engine` → `metadata_recorder`; `catalog_service` serves the
//! recorded files afterwards.

pub mod catalog_service;
pub mod chunk_store;
pub mod merge_engine;
pub mod metadata_recorder;
pub mod session_registry;
pub mod sweeper;
pub mod upload_service;
