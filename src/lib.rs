pub mod alert;
pub mod circuit;
pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod migration;
pub mod models;
mod monitor;
pub mod ports;
pub mod probe;
pub mod retry;
pub mod session_store;
pub mod sessions;
pub mod state_db;
pub mod switcher;
pub mod threshold;

use std::sync::Arc;

use controller::RollbackController;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RollbackController>,
}
