//! HTTP front end of the pulsemon metrics server.
//!
//! [`app::build_http_app`] assembles the axum router over an
//! [`state::AppState`]; [`state::init_storage`] picks the storage backend
//! from configuration, and [`saver::SnapshotSaver`] persists the in-memory
//! backend on a fixed cadence.

pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod saver;
pub mod state;
