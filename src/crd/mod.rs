//! Custom Resource Definitions for the PD operator
//!
//! This module defines the `ManagedCluster` CRD and its spec/status types.

mod managed_cluster;
pub mod types;


pub use managed_cluster::{
    ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, PdSpec, SpecValidationError,
};
pub use types::*;
