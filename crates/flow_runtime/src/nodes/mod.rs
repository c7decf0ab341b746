//! Built-in Flow nodes
//!
//! Every built-in type registers under a `Flow/` type id. Node configuration is
//! read from the node template's JSON `config`, a missing config meaning all
//! defaults.

mod custom_input;
mod custom_output;
mod logical_or;
mod route;
mod sub_graph;

pub use custom_input::CustomInputNode;
pub use custom_output::CustomOutputNode;
pub use logical_or::{LogicalOrConfig, LogicalOrNode, DISABLE_PIN, ENABLE_PIN, RESET_PIN};
pub use route::{FinishNode, LogNode, RerouteNode, StartNode};
pub use sub_graph::{PropertyBinding, SubGraphConfig, SubGraphNode, FINISH_PIN, START_PIN};

use flow_types::NodeTemplate;
use serde::de::DeserializeOwned;

use crate::{FlowNode, NodeRegistry};

pub const START_NODE: &str = "Flow/Start";
pub const FINISH_NODE: &str = "Flow/Finish";
pub const CUSTOM_INPUT_NODE: &str = "Flow/CustomInput";
pub const CUSTOM_OUTPUT_NODE: &str = "Flow/CustomOutput";
pub const REROUTE_NODE: &str = "Flow/Reroute";
pub const LOG_NODE: &str = "Flow/Log";
pub const LOGICAL_OR_NODE: &str = "Flow/LogicalOR";
pub const SUB_GRAPH_NODE: &str = "Flow/SubGraph";

/// Pin names shared by several built-in nodes
pub const IN_PIN: &str = "In";
pub const OUT_PIN: &str = "Out";

/// Register every built-in node type
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    registry.register_fn(START_NODE, "Route", |_| boxed(StartNode::new()));
    registry.register_fn(FINISH_NODE, "Route", |_| boxed(FinishNode::new()));
    registry.register_fn(REROUTE_NODE, "Route", |_| boxed(RerouteNode::new()));
    registry.register_fn(CUSTOM_INPUT_NODE, "Route", |t| {
        boxed(CustomInputNode::from_config(&t.config)?)
    });
    registry.register_fn(CUSTOM_OUTPUT_NODE, "Route", |t| {
        boxed(CustomOutputNode::from_config(&t.config)?)
    });
    registry.register_fn(SUB_GRAPH_NODE, "Route", |t| {
        boxed(SubGraphNode::new(parse_config(t)?))
    });
    registry.register_fn(LOGICAL_OR_NODE, "Operators", |t| {
        boxed(LogicalOrNode::new(parse_config(t)?))
    });
    registry.register_fn(LOG_NODE, "Utils", |t| {
        boxed(LogNode::from_config(&t.config)?)
    });
}

fn boxed<N: FlowNode>(node: N) -> Result<Box<dyn FlowNode>, String> {
    Ok(Box::new(node))
}

/// Deserialize a node config, treating `null` as all defaults
pub(crate) fn parse_config<T>(template: &NodeTemplate) -> Result<T, String>
where
    T: DeserializeOwned + Default,
{
    if template.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(template.config.clone()).map_err(|e| e.to_string())
}

/// Read a string field of a config object, `""` when absent
pub(crate) fn config_string(config: &serde_json::Value, key: &str) -> Result<String, String> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("'{}' must be a string, got {}", key, other)),
    }
}
