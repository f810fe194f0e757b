//! Operator REST API
//!
//! Health, Prometheus metrics and a read-only view of the managed clusters.

mod dto;
mod handlers;
mod server;

pub use dto::{ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse};
pub use server::{router, run_server, ApiState};
