//! HTTP API Module
//!
//! REST API for replicated writes and member administration.

mod http;

pub use http::{AppState, HttpServer};
