// Custom Input - entry point fired by a named event from the owning context

use std::any::Any;

use flow_types::Pin;
use serde_json::Value;

#[cfg(feature = "diagnostics")]
use flow_types::ValidationLog;

use super::{config_string, OUT_PIN};
use crate::{EntryPoint, FlowNode, NodeContext};

pub struct CustomInputNode {
    event_name: String,
    outputs: Vec<Pin>,
}

impl CustomInputNode {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            outputs: vec![Pin::new(OUT_PIN)],
        }
    }

    pub fn from_config(config: &Value) -> Result<Self, String> {
        Ok(Self::new(config_string(config, "event_name")?))
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

impl FlowNode for CustomInputNode {
    fn input_pins(&self) -> &[Pin] {
        &[]
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn entry_point(&self) -> Option<EntryPoint> {
        if self.event_name.is_empty() {
            return None;
        }
        Some(EntryPoint::CustomInput(self.event_name.clone()))
    }

    fn execute_input(&mut self, _ctx: &mut NodeContext<'_>, _pin: &str) {}

    fn description(&self) -> String {
        self.event_name.clone()
    }

    #[cfg(feature = "diagnostics")]
    fn validate(&self, ctx: &NodeContext<'_>, log: &mut ValidationLog) {
        if self.event_name.is_empty() {
            log.error(Some(ctx.node_guid()), "Event Name is empty!");
        } else if !ctx.asset().has_custom_input(&self.event_name) {
            log.warning(
                Some(ctx.node_guid()),
                format!("Custom input '{}' is not declared by the graph", self.event_name),
            );
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
