//! PD operator: Kubernetes operator and bootstrap discovery service for
//! placement-driver clusters
//!
//! The controller reconciles `ManagedCluster` resources into Services and a
//! StatefulSet, mirrors member health into status and rolls out upgrades one
//! ordinal at a time. The discovery service tells every starting member
//! whether to found the cluster or join it.

pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod rest_api;
pub mod telemetry;

pub use crate::error::{Error, Result};
