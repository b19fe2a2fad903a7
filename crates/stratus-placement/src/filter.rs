//! Pluggable placement filters, applied after the built-in role, runtime
//! and anti-affinity checks.

use serde_json::Value;

use stratus_state::NodeRecord;

use crate::error::{PluginError, PluginResult};
use crate::placer::InstanceRequirements;

pub trait PlacementFilter: Send + Sync {
    fn id(&self) -> &str;

    /// Whether `node` may receive an instance with `req`.
    fn admits(&self, node: &NodeRecord, req: &InstanceRequirements) -> bool;
}

/// Rejects nodes whose stats report `draining = true`.
#[derive(Debug, Clone, Default)]
pub struct NotDraining;

impl NotDraining {
    pub const ID: &'static str = "not-draining";

    pub fn from_params(params: &Value) -> PluginResult<Self> {
        match params {
            Value::Null => Ok(Self),
            Value::Object(map) if map.is_empty() => Ok(Self),
            _ => Err(PluginError::InvalidParams {
                id: Self::ID.to_string(),
                reason: "takes no parameters".to_string(),
            }),
        }
    }
}

impl PlacementFilter for NotDraining {
    fn id(&self) -> &str {
        Self::ID
    }

    fn admits(&self, node: &NodeRecord, _req: &InstanceRequirements) -> bool {
        !matches!(node.stats.get("draining"), Some(Value::Bool(true)))
    }
}
