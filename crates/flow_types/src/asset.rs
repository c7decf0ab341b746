// Flow Asset - Read-only graph templates
//
// A template describes nodes, their configuration and the connections between
// their pins. Templates are stored as JSON or TOML files and shared between any
// number of live graph instances, which never mutate them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ConnectedPin, SignalMode};

// ─────────────────────────────────────────────────────────────────────────────
// Node Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Stable identity of a node within a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeGuid(pub Uuid);

impl NodeGuid {
    /// Create a new random guid
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeGuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Template
// ─────────────────────────────────────────────────────────────────────────────

/// A node placed in a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Stable node identity
    pub guid: NodeGuid,
    /// Node type (references a registered factory, e.g. "Flow/LogicalOR")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Designer-set signal mode
    #[serde(default)]
    pub signal_mode: SignalMode,
    /// Preload this node's content when the instance starts
    #[serde(default)]
    pub preload: bool,
    /// Node-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NodeTemplate {
    /// Create a node template with a fresh guid
    pub fn new(node_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            guid: NodeGuid::new(),
            node_type: node_type.into(),
            signal_mode: SignalMode::Enabled,
            preload: false,
            config,
        }
    }

    /// Set the signal mode
    pub fn with_signal_mode(mut self, mode: SignalMode) -> Self {
        self.signal_mode = mode;
        self
    }

    /// Mark the node for preloading
    pub fn preloaded(mut self) -> Self {
        self.preload = true;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// A directed edge from an output pin to an input pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source: "node_guid.pin_name"
    pub from: String,
    /// Destination: "node_guid.pin_name"
    pub to: String,
}

impl Connection {
    /// Create a new connection
    pub fn new(from_node: NodeGuid, from_pin: &str, to_node: NodeGuid, to_pin: &str) -> Self {
        Self {
            from: format!("{}.{}", from_node, from_pin),
            to: format!("{}.{}", to_node, to_pin),
        }
    }

    /// Parse the "from" field into a node and pin
    pub fn source(&self) -> Option<ConnectedPin> {
        parse_endpoint(&self.from)
    }

    /// Parse the "to" field into a node and pin
    pub fn target(&self) -> Option<ConnectedPin> {
        parse_endpoint(&self.to)
    }
}

fn parse_endpoint(endpoint: &str) -> Option<ConnectedPin> {
    let (node, pin) = endpoint.split_once('.')?;
    if pin.is_empty() {
        return None;
    }
    let node = node.parse().ok()?;
    Some(ConnectedPin::new(node, pin))
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow Asset
// ─────────────────────────────────────────────────────────────────────────────

/// Complete graph template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAsset {
    /// Asset path, the identity of the template (e.g. "quests/intro")
    #[serde(default)]
    pub path: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Nodes in this template
    #[serde(default)]
    pub nodes: Vec<NodeTemplate>,
    /// Connections between node pins
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Custom input events this graph accepts from its owner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_inputs: Vec<String>,
    /// Custom output events this graph exposes to its owner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_outputs: Vec<String>,
    /// Exposed input properties and their defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl FlowAsset {
    /// Create a new empty template
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = asset_name(&path).to_string();
        Self {
            path,
            name,
            nodes: Vec::new(),
            connections: Vec::new(),
            custom_inputs: Vec::new(),
            custom_outputs: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a node, returning its guid
    pub fn add_node(&mut self, node: NodeTemplate) -> NodeGuid {
        let guid = node.guid;
        self.nodes.push(node);
        guid
    }

    /// Connect an output pin to an input pin
    pub fn connect(&mut self, from_node: NodeGuid, from_pin: &str, to_node: NodeGuid, to_pin: &str) {
        self.connections
            .push(Connection::new(from_node, from_pin, to_node, to_pin));
    }

    /// Get a node by guid
    pub fn get_node(&self, guid: NodeGuid) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.guid == guid)
    }

    /// Get all nodes of a type
    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a NodeTemplate> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    /// Check whether a custom output event is declared
    pub fn has_custom_output(&self, event_name: &str) -> bool {
        self.custom_outputs.iter().any(|e| e == event_name)
    }

    /// Check whether a custom input event is declared
    pub fn has_custom_input(&self, event_name: &str) -> bool {
        self.custom_inputs.iter().any(|e| e == event_name)
    }

    /// Short name derived from the path
    pub fn asset_name(&self) -> &str {
        asset_name(&self.path)
    }
}

/// Last segment of an asset path, without extension
pub fn asset_name(path: &str) -> &str {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    file.split_once('.').map(|(stem, _)| stem).unwrap_or(file)
}
