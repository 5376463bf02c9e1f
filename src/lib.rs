//! Shelfkeeper library lending server
//!
//! A REST JSON API over a small library's inventory: members borrow and
//! return copies of books, staff manage the inventory, and everyone can
//! read loan history and the most-borrowed report. Every borrow and return
//! runs as one transaction under a per-book row lock.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
