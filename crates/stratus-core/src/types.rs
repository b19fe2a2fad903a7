//! Shared types used across Stratus crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Stable, cluster-unique identifier of a node.
pub type NodeId = String;

/// Identifier of one deployed copy of an application version.
pub type InstanceId = String;

/// Identifier of an application.
pub type ApplicationId = String;

/// Identifier of an application version.
pub type VersionId = String;

/// Identifier of a job tree (one workflow run).
pub type TreeId = String;

/// Role a node declares when it reports to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Holds authoritative cluster/job state and makes scheduling decisions.
    Controller,
    /// Runs application instance processes.
    ExecutorHost,
    /// Directs external traffic to running instances.
    Router,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Controller => "controller",
            NodeRole::ExecutorHost => "executor_host",
            NodeRole::Router => "router",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(NodeRole::Controller),
            "executor_host" | "executor-host" => Ok(NodeRole::ExecutorHost),
            "router" => Ok(NodeRole::Router),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
