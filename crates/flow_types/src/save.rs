// Save Game - Persisted execution state
//
// Only fields a node explicitly declares as save state end up here, next to the
// lifecycle state of every node and the property bag of each instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeActivationState, NodeGuid};

/// Saved state of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSaveData {
    pub guid: NodeGuid,
    #[serde(default)]
    pub state: NodeActivationState,
    /// Node-declared save fields
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Saved state of one graph instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInstanceSave {
    /// Instance identifier, reused when the instance is restored
    pub instance_id: String,
    /// Template the instance was created from
    pub asset_path: String,
    /// False for a preloaded instance whose Start nodes have not fired yet
    #[serde(default = "default_started")]
    pub started: bool,
    #[serde(default)]
    pub nodes: Vec<NodeSaveData>,
    #[serde(default)]
    pub active_nodes: Vec<NodeGuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

fn default_started() -> bool {
    true
}

impl GraphInstanceSave {
    /// Get the saved record of a node
    pub fn node(&self, guid: NodeGuid) -> Option<&NodeSaveData> {
        self.nodes.iter().find(|n| n.guid == guid)
    }
}

/// A root flow started by some owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFlowSave {
    pub owner: String,
    pub asset_path: String,
    pub instance_id: String,
}

/// Complete save game for a flow subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSaveData {
    #[serde(default)]
    pub root_flows: Vec<RootFlowSave>,
    #[serde(default)]
    pub instances: Vec<GraphInstanceSave>,
}

impl FlowSaveData {
    /// Find a saved instance by id
    pub fn instance(&self, instance_id: &str) -> Option<&GraphInstanceSave> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    /// Remove a saved instance by id
    pub fn take_instance(&mut self, instance_id: &str) -> Option<GraphInstanceSave> {
        let index = self
            .instances
            .iter()
            .position(|i| i.instance_id == instance_id)?;
        Some(self.instances.remove(index))
    }
}
