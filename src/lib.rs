//! Aegis API gateway library
//!
//! Exposes the request pipeline and its services so the server binary and
//! the integration tests build the same application.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod services;

#[cfg(test)]
pub mod testing;

pub use config::AppSettings;
pub use error::AppError;
pub use models::AppState;
