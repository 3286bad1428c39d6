//! Demo HTTP API
//!
//! News endpoints served behind the request logging filter.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{AppState, ApiServer};
