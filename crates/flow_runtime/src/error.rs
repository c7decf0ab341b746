//! Error types for the flow runtime.

use flow_types::NodeGuid;

use crate::NodeRef;

/// Errors that can occur while loading, instancing or restoring flows
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    #[error("Flow asset not found: {0}")]
    AssetNotFound(String),

    #[error("Failed to parse flow asset {path}: {message}")]
    AssetParse { path: String, message: String },

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid configuration for node {node} ({node_type}): {message}")]
    InvalidNodeConfig {
        node: NodeGuid,
        node_type: String,
        message: String,
    },

    #[error("Root flow {asset} already running for owner {owner}")]
    RootFlowAlreadyExists { owner: String, asset: String },

    #[error("No root flow {asset} running for owner {owner}")]
    RootFlowNotFound { owner: String, asset: String },

    #[error("Sub-graph node {0} already owns a nested instance")]
    SubFlowAlreadyExists(NodeRef),

    #[error("Sub-graph node {0} has no nested instance")]
    SubFlowNotFound(NodeRef),

    #[error("Graph instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Graph instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("Node {node} not found in instance {instance}")]
    NodeNotFound { instance: String, node: NodeGuid },

    #[error("Saved instance not found: {0}")]
    SavedInstanceNotFound(String),

    #[error("Sub-flow nesting depth {depth} exceeds the limit of {limit}")]
    RecursionLimit { depth: u32, limit: u32 },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Result type for flow runtime operations
pub type FlowResult<T> = Result<T, FlowError>;
