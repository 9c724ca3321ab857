//! HTTP surface: transfer submission with streamed progress, and health probes.

pub mod auth;
pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
