//! On-disk form of a container, written at shutdown and replayed at start.

use std::collections::HashMap;
use std::time::Duration;

use burrow_shared::protocol::LimitsSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pools::Subnet;

/// The kernel-visible resources a live container owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub uid: u32,
    pub subnet: Subnet,
    /// Host ports currently mapped into the container.
    #[serde(default)]
    pub ports: Vec<u32>,
}

impl Resources {
    pub fn new(uid: u32, subnet: Subnet) -> Self {
        Self {
            uid,
            subnet,
            ports: Vec::new(),
        }
    }
}

/// Everything needed to resume a container with the same handle and
/// reclaimed resources after a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub handle: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub grace_time: Duration,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub resources: Resources,
    /// Ids of processes that were live at snapshot time.
    #[serde(default)]
    pub processes: Vec<u32>,
    /// Scheme of the provider that materialized the rootfs; empty is the
    /// default provider.
    #[serde(default)]
    pub rootfs_provider: String,
    #[serde(default)]
    pub limits: LimitsSummary,
}
