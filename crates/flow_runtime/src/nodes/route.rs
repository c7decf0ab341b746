// Route nodes - graph entry, exit and plumbing

use std::any::Any;

use flow_types::{Pin, PinActivationType};
use serde_json::Value;
use tracing::info;

use super::{config_string, IN_PIN, OUT_PIN};
use crate::{EntryPoint, FlowNode, NodeContext};

/// Fire the first output and complete the activation
fn pass_on(ctx: &mut NodeContext<'_>) {
    ctx.trigger_output(OUT_PIN, PinActivationType::Default);
    ctx.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Start
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point fired when the graph instance starts
pub struct StartNode {
    outputs: Vec<Pin>,
}

impl StartNode {
    pub fn new() -> Self {
        Self {
            outputs: vec![Pin::new(OUT_PIN)],
        }
    }
}

impl Default for StartNode {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowNode for StartNode {
    fn input_pins(&self) -> &[Pin] {
        &[]
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn entry_point(&self) -> Option<EntryPoint> {
        Some(EntryPoint::Start)
    }

    fn execute_input(&mut self, _ctx: &mut NodeContext<'_>, _pin: &str) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Finish
// ─────────────────────────────────────────────────────────────────────────────

/// Finishes the enclosing graph instance
pub struct FinishNode {
    inputs: Vec<Pin>,
}

impl FinishNode {
    pub fn new() -> Self {
        Self {
            inputs: vec![Pin::new(IN_PIN)],
        }
    }
}

impl Default for FinishNode {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowNode for FinishNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &[]
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, _pin: &str) {
        ctx.finish();
        ctx.finish_graph();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reroute
// ─────────────────────────────────────────────────────────────────────────────

pub struct RerouteNode {
    inputs: Vec<Pin>,
    outputs: Vec<Pin>,
}

impl RerouteNode {
    pub fn new() -> Self {
        Self {
            inputs: vec![Pin::new(IN_PIN)],
            outputs: vec![Pin::new(OUT_PIN)],
        }
    }
}

impl Default for RerouteNode {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowNode for RerouteNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, _pin: &str) {
        pass_on(ctx);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log
// ─────────────────────────────────────────────────────────────────────────────

/// Writes a message to the runtime log, then continues
pub struct LogNode {
    message: String,
    inputs: Vec<Pin>,
    outputs: Vec<Pin>,
}

impl LogNode {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            inputs: vec![Pin::new(IN_PIN)],
            outputs: vec![Pin::new(OUT_PIN)],
        }
    }

    pub fn from_config(config: &Value) -> Result<Self, String> {
        Ok(Self::new(config_string(config, "message")?))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl FlowNode for LogNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, _pin: &str) {
        info!(
            instance = %ctx.instance_id(),
            node = %ctx.node_guid(),
            "{}",
            self.message
        );
        pass_on(ctx);
    }

    fn output_property(&self, name: &str) -> Option<Value> {
        (name == "Message").then(|| Value::String(self.message.clone()))
    }

    fn description(&self) -> String {
        self.message.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeAction;
    use flow_types::{FlowAsset, NodeGuid};
    use serde_json::json;

    #[test]
    fn test_finish_node_finishes_graph() {
        let asset = FlowAsset::new("test/route");
        let mut ctx = NodeContext::detached(NodeGuid::new(), &asset);
        FinishNode::new().execute_input(&mut ctx, IN_PIN);
        assert_eq!(ctx.actions(), &[NodeAction::Finish, NodeAction::FinishGraph]);
    }

    #[test]
    fn test_log_node_config() {
        let node = LogNode::from_config(&json!({ "message": "door opened" })).unwrap();
        assert_eq!(node.message(), "door opened");
        assert_eq!(node.output_property("Message"), Some(json!("door opened")));
        assert!(LogNode::from_config(&json!({ "message": 3 })).is_err());
        assert_eq!(LogNode::from_config(&Value::Null).unwrap().message(), "");
    }

    #[test]
    fn test_start_is_entry_point() {
        let start = StartNode::new();
        assert_eq!(start.entry_point(), Some(EntryPoint::Start));
        assert!(start.input_pins().is_empty());
        assert_eq!(start.output_pins()[0], OUT_PIN);
    }
}
