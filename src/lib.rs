//! Chunked file upload service.
//!
//! Clients send a file as independently transmitted chunks; once every chunk
//! is staged the file is merged in index order, recorded in SQLite, and served
//! back through a small catalog API.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::Router;

pub use state::AppState;

/// Build the application router with its state attached.
pub fn create_app(state: AppState, max_chunk_bytes: usize) -> Router {
    routes::routes::routes(max_chunk_bytes).with_state(state)
}
