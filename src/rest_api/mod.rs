//! REST API for operators
//!
//! Health, Prometheus metrics and read-mostly access to application
//! containers through the active backend.

mod dto;
mod handlers;
mod server;

pub use dto::{ContainerListResponse, ErrorResponse, HealthResponse, LogsQuery};
pub use server::{router, run_server};
