// lib.rs - Main library file that exports all modules
pub mod compose;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod services;
pub mod storage;
pub mod verify;

use std::sync::Arc;

use orchestrator::Orchestrator;
use registry::ConnectionRegistry;
use storage::LocalObjectStore;

/// Shared application state: database pool, subscriber registry, pipeline
/// orchestrator, and the object store.
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<LocalObjectStore>,
}
