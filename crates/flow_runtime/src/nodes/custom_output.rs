// Custom Output - named exit point of the enclosing graph

use std::any::Any;

use flow_types::{Pin, SignalMode};
use serde_json::Value;

#[cfg(feature = "diagnostics")]
use flow_types::ValidationLog;

use super::{config_string, IN_PIN};
use crate::{FlowNode, NodeContext};

pub struct CustomOutputNode {
    event_name: String,
    inputs: Vec<Pin>,
}

impl CustomOutputNode {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            inputs: vec![Pin::new(IN_PIN)],
        }
    }

    pub fn from_config(config: &Value) -> Result<Self, String> {
        Ok(Self::new(config_string(config, "event_name")?))
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

impl FlowNode for CustomOutputNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &[]
    }

    fn allowed_signal_modes(&self) -> &'static [SignalMode] {
        &[SignalMode::Enabled, SignalMode::Disabled]
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, _pin: &str) {
        if !self.event_name.is_empty()
            && ctx.asset().has_custom_output(&self.event_name)
            && ctx.is_instance()
        {
            ctx.trigger_custom_output(self.event_name.clone());
        }
        ctx.finish();
    }

    fn description(&self) -> String {
        self.event_name.clone()
    }

    #[cfg(feature = "diagnostics")]
    fn validate(&self, ctx: &NodeContext<'_>, log: &mut ValidationLog) {
        if self.event_name.is_empty() {
            log.error(Some(ctx.node_guid()), "Event Name is empty!");
        } else if !ctx.asset().has_custom_output(&self.event_name) {
            log.warning(
                Some(ctx.node_guid()),
                format!("Custom output '{}' is not declared by the graph", self.event_name),
            );
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
