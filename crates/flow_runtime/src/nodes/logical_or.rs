// Logical OR - fires its output when any numbered input is activated
//
// The gate counts executions and disables itself once the execution limit is
// reached. Cleanup resets the count but never the enabled flag.

use std::any::Any;

use flow_types::{is_numbered_pin, Pin, PinActivationType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[cfg(feature = "diagnostics")]
use flow_types::ValidationLog;

use super::OUT_PIN;
use crate::{FlowNode, NodeContext};

pub const ENABLE_PIN: &str = "Enable";
pub const DISABLE_PIN: &str = "Disable";
pub const RESET_PIN: &str = "Reset";

/// Template configuration of a Logical OR node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalOrConfig {
    pub enabled: bool,
    /// Executions before the gate disables itself, 0 = unlimited
    pub execution_limit: u32,
    /// Adds a Reset input and a Reset output
    pub once: bool,
    /// Number of numbered inputs
    pub input_count: usize,
}

impl Default for LogicalOrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            execution_limit: 1,
            once: false,
            input_count: 2,
        }
    }
}

#[derive(Deserialize)]
struct LogicalOrSave {
    enabled: bool,
    #[serde(default)]
    execution_count: u32,
}

pub struct LogicalOrNode {
    enabled: bool,
    execution_limit: u32,
    execution_count: u32,
    once: bool,
    inputs: Vec<Pin>,
    outputs: Vec<Pin>,
}

impl Default for LogicalOrNode {
    fn default() -> Self {
        Self::new(LogicalOrConfig::default())
    }
}

impl LogicalOrNode {
    pub fn new(config: LogicalOrConfig) -> Self {
        let mut inputs = Vec::with_capacity(config.input_count + 3);
        let mut outputs = vec![Pin::new(OUT_PIN)];
        if config.once {
            inputs.push(Pin::new(RESET_PIN));
            outputs.push(Pin::new(RESET_PIN));
        }
        inputs.extend((0..config.input_count).map(Pin::numbered));
        inputs.push(Pin::with_tooltip(ENABLE_PIN, "Enabling resets Execution Count"));
        inputs.push(Pin::with_tooltip(DISABLE_PIN, "Disabling resets Execution Count"));

        Self {
            enabled: config.enabled,
            execution_limit: config.execution_limit,
            execution_count: 0,
            once: config.once,
            inputs,
            outputs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    pub fn execution_limit(&self) -> u32 {
        self.execution_limit
    }

    /// Number of numbered inputs
    pub fn numbered_input_count(&self) -> usize {
        self.inputs.iter().filter(|p| p.is_numbered()).count()
    }

    /// Append a numbered input, for structural edits before instancing
    pub fn add_numbered_input(&mut self) -> &Pin {
        let index = self.numbered_input_count();
        let position = self
            .inputs
            .iter()
            .rposition(|p| p.is_numbered())
            .map(|i| i + 1)
            .unwrap_or(usize::from(self.once));
        self.inputs.insert(position, Pin::numbered(index));
        &self.inputs[position]
    }

    fn reset_counter(&mut self) {
        self.execution_count = 0;
    }
}

impl FlowNode for LogicalOrNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, pin: &str) {
        match pin {
            ENABLE_PIN => {
                if !self.enabled {
                    self.reset_counter();
                    self.enabled = true;
                }
            }
            DISABLE_PIN => {
                if self.enabled {
                    self.enabled = false;
                    self.force_finish(ctx);
                }
            }
            RESET_PIN if self.once => {
                self.reset_counter();
                self.enabled = true;
                ctx.trigger_output(RESET_PIN, PinActivationType::Default);
            }
            _ if self.enabled && is_numbered_pin(pin) => {
                self.execution_count += 1;
                if self.execution_limit > 0 && self.execution_count == self.execution_limit {
                    self.enabled = false;
                }
                ctx.trigger_output(OUT_PIN, PinActivationType::Forced);
                ctx.finish();
            }
            _ => {}
        }
    }

    fn cleanup(&mut self, _ctx: &mut NodeContext<'_>) {
        self.reset_counter();
    }

    fn force_finish(&mut self, ctx: &mut NodeContext<'_>) {
        ctx.trigger_output(OUT_PIN, PinActivationType::Forced);
        ctx.finish();
    }

    fn save_state(&self, _ctx: &NodeContext<'_>) -> Value {
        json!({
            "enabled": self.enabled,
            "execution_count": self.execution_count,
        })
    }

    fn load_state(&mut self, data: &Value) -> Result<(), serde_json::Error> {
        if data.is_null() {
            return Ok(());
        }
        let saved = LogicalOrSave::deserialize(data)?;
        self.enabled = saved.enabled;
        self.execution_count = saved.execution_count;
        Ok(())
    }

    fn output_property(&self, name: &str) -> Option<Value> {
        match name {
            "ExecutionCount" => Some(json!(self.execution_count)),
            "Enabled" => Some(json!(self.enabled)),
            _ => None,
        }
    }

    fn description(&self) -> String {
        match self.execution_limit {
            0 => "Unlimited".to_string(),
            limit => format!("Limit: {}", limit),
        }
    }

    #[cfg(feature = "diagnostics")]
    fn validate(&self, ctx: &NodeContext<'_>, log: &mut ValidationLog) {
        if self.numbered_input_count() == 0 {
            log.error(Some(ctx.node_guid()), "Logical OR has no numbered inputs");
        }
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

    fn gate(limit: u32) -> LogicalOrNode {
        LogicalOrNode::new(LogicalOrConfig {
            execution_limit: limit,
            ..Default::default()
        })
    }

    /// Run one input and return the actions it produced
    fn run(node: &mut LogicalOrNode, pin: &str) -> Vec<NodeAction> {
        let asset = FlowAsset::new("test/or");
        let mut ctx = NodeContext::detached(NodeGuid::new(), &asset);
        node.execute_input(&mut ctx, pin);
        ctx.into_actions()
    }

    fn fired(actions: &[NodeAction]) -> bool {
        actions.iter().any(|a| {
            matches!(
                a,
                NodeAction::TriggerOutput { pin, activation: PinActivationType::Forced } if pin == OUT_PIN
            )
        })
    }

    #[test]
    fn test_default_pins() {
        let node = LogicalOrNode::default();
        let names: Vec<_> = node.input_pins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["0", "1", ENABLE_PIN, DISABLE_PIN]);
        assert_eq!(node.output_pins().len(), 1);
        assert!(node.is_enabled());
        assert_eq!(node.execution_limit(), 1);
    }

    #[test]
    fn test_limit_disables_after_n_executions() {
        let mut node = gate(3);
        for _ in 0..3 {
            assert!(fired(&run(&mut node, "0")));
        }
        assert!(!node.is_enabled());
        assert_eq!(node.execution_count(), 3);

        let actions = run(&mut node, "1");
        assert!(actions.is_empty());
        assert_eq!(node.execution_count(), 3);
    }

    #[test]
    fn test_unlimited_gate_never_disables() {
        let mut node = gate(0);
        for _ in 0..100 {
            assert!(fired(&run(&mut node, "1")));
        }
        assert!(node.is_enabled());
        assert_eq!(node.execution_count(), 100);
    }

    #[test]
    fn test_enable_is_idempotent() {
        let mut node = gate(5);
        run(&mut node, "0");
        run(&mut node, "0");
        assert!(run(&mut node, ENABLE_PIN).is_empty());
        assert_eq!(node.execution_count(), 2);

        run(&mut node, DISABLE_PIN);
        run(&mut node, ENABLE_PIN);
        assert!(node.is_enabled());
        assert_eq!(node.execution_count(), 0);
    }

    #[test]
    fn test_disable_is_idempotent() {
        let mut node = gate(5);
        let first = run(&mut node, DISABLE_PIN);
        assert!(fired(&first));
        assert!(first.contains(&NodeAction::Finish));

        let second = run(&mut node, DISABLE_PIN);
        assert!(second.is_empty());
        assert!(!node.is_enabled());
    }

    #[test]
    fn test_cleanup_resets_count_only() {
        let mut node = gate(2);
        run(&mut node, "0");
        run(&mut node, "0");
        assert!(!node.is_enabled());

        let asset = FlowAsset::new("test/or");
        let mut ctx = NodeContext::detached(NodeGuid::new(), &asset);
        node.cleanup(&mut ctx);
        assert_eq!(node.execution_count(), 0);
        assert!(!node.is_enabled());
    }

    #[test]
    fn test_once_adds_reset_pins() {
        let mut node = LogicalOrNode::new(LogicalOrConfig {
            once: true,
            ..Default::default()
        });
        assert_eq!(node.input_pins()[0], RESET_PIN);
        assert_eq!(node.output_pins()[1], RESET_PIN);

        run(&mut node, "0");
        assert!(!node.is_enabled());

        let actions = run(&mut node, RESET_PIN);
        assert!(node.is_enabled());
        assert_eq!(node.execution_count(), 0);
        assert_eq!(
            actions,
            vec![NodeAction::TriggerOutput {
                pin: RESET_PIN.to_string(),
                activation: PinActivationType::Default,
            }]
        );
    }

    #[test]
    fn test_add_numbered_input() {
        let mut node = LogicalOrNode::default();
        assert_eq!(node.add_numbered_input().name, "2");
        let names: Vec<_> = node.input_pins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["0", "1", "2", ENABLE_PIN, DISABLE_PIN]);
    }

    #[test]
    fn test_save_and_load_state() {
        let asset = FlowAsset::new("test/or");
        let ctx = NodeContext::detached(NodeGuid::new(), &asset);
        let mut node = gate(4);
        run(&mut node, "0");
        let saved = node.save_state(&ctx);

        let mut restored = gate(4);
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.execution_count(), 1);
        assert!(restored.is_enabled());
        assert!(restored.load_state(&json!({ "enabled": "yes" })).is_err());
    }
}
