//! Signal Propagation
//!
//! Synchronous, depth-first. An output pin fires every connected input pin in
//! connection order; each input handler runs to completion, including all
//! propagation it triggers, before the next target is visited.

use flow_types::{NodeActivationState, NodeGuid, PinActivationType, SignalMode};
use tracing::{debug, warn};

use crate::{
    EntryPoint, FlowError, FlowEvent, FlowSubsystem, InstanceOwner, NodeAction, NodeRef,
    RuntimeSeverity,
};

impl FlowSubsystem {
    /// Activate an input pin of a node
    ///
    /// Pass-through hops are not recorded in the pin history.
    pub(crate) fn activate_input(
        &mut self,
        instance_id: &str,
        node: NodeGuid,
        pin: &str,
        activation: PinActivationType,
    ) {
        if self.propagation_depth >= self.settings.max_propagation_depth {
            let limit = self.settings.max_propagation_depth;
            self.log_runtime(
                RuntimeSeverity::Error,
                instance_id,
                Some(node),
                format!("Propagation depth limit of {} reached, dropping activation of {}", limit, pin),
            );
            return;
        }

        let nested = self.nested_of(instance_id, node);
        let Some(instance) = self.instances.live.get_mut(instance_id) else {
            debug!(instance = %instance_id, node = %node, pin, "Instance is not live, activation dropped");
            return;
        };
        let Some(target) = instance.node_mut(node) else {
            warn!(instance = %instance_id, node = %node, pin, "Node not found, activation dropped");
            return;
        };
        if !target.has_input(pin) {
            warn!(instance = %instance_id, node = %node, pin, "Input pin not found, activation dropped");
            return;
        }

        #[cfg(feature = "diagnostics")]
        if activation != PinActivationType::PassThrough {
            target.record_input(pin, activation);
        }
        #[cfg(not(feature = "diagnostics"))]
        let _ = activation;

        if !target.signal_mode_allowed() {
            warn!(
                instance = %instance_id,
                node = %node,
                node_type = %target.node_type(),
                mode = %target.signal_mode(),
                "Signal mode not allowed for this node type, activation dropped"
            );
            return;
        }

        match target.signal_mode() {
            SignalMode::Disabled => {
                debug!(instance = %instance_id, node = %node, pin, "Node disabled, activation dropped");
            }
            SignalMode::PassThrough => {
                let first_output = target.first_output().map(str::to_string);
                instance.mark_active(node);
                self.propagation_depth += 1;
                if let Some(output) = first_output {
                    self.trigger_output(instance_id, node, &output, PinActivationType::PassThrough);
                }
                self.finish_node(instance_id, node);
                self.propagation_depth -= 1;
            }
            SignalMode::Enabled => {
                instance.mark_active(node);
                let Some((_, actions)) = instance.with_node(node, nested, |n, ctx| {
                    n.behavior_mut().execute_input(ctx, pin)
                }) else {
                    return;
                };
                self.propagation_depth += 1;
                self.apply_actions(instance_id, node, actions);
                self.propagation_depth -= 1;
            }
        }
    }

    /// Fire an output pin of a node into every connected input pin
    pub(crate) fn trigger_output(
        &mut self,
        instance_id: &str,
        node: NodeGuid,
        pin: &str,
        activation: PinActivationType,
    ) {
        let Some(instance) = self.instances.live.get_mut(instance_id) else {
            debug!(instance = %instance_id, node = %node, pin, "Instance is not live, output dropped");
            return;
        };
        let Some(source) = instance.node_mut(node) else {
            return;
        };
        if !source.has_output(pin) {
            warn!(instance = %instance_id, node = %node, pin, "Output pin not found, signal dropped");
            return;
        }
        if activation == PinActivationType::Default && source.signal_mode() == SignalMode::Disabled {
            debug!(instance = %instance_id, node = %node, pin, "Node disabled, output dropped");
            return;
        }

        #[cfg(feature = "diagnostics")]
        if activation != PinActivationType::PassThrough {
            source.record_output(pin, activation);
        }

        let targets = instance.connections().targets(node, pin).to_vec();
        debug!(
            instance = %instance_id,
            node = %node,
            pin,
            %activation,
            targets = targets.len(),
            "Output triggered"
        );
        for target in targets {
            self.activate_input(instance_id, target.node, &target.pin, activation);
        }
    }

    /// Fire an entry node: activate, trigger its first output and complete
    pub(crate) fn fire_entry(&mut self, instance_id: &str, node: NodeGuid) {
        let Some(instance) = self.instances.live.get_mut(instance_id) else {
            return;
        };
        let Some(first_output) = instance
            .node(node)
            .and_then(|n| n.first_output())
            .map(str::to_string)
        else {
            return;
        };
        instance.mark_active(node);
        self.trigger_output(instance_id, node, &first_output, PinActivationType::Default);
        self.finish_node(instance_id, node);
    }

    /// Fire every Custom Input node listening for `event_name`
    pub(crate) fn fire_custom_input(&mut self, instance_id: &str, event_name: &str) {
        let entries = match self.instances.live.get(instance_id) {
            Some(instance) => instance.entry_nodes(&EntryPoint::CustomInput(event_name.to_string())),
            None => return,
        };
        if entries.is_empty() {
            warn!(instance = %instance_id, event = event_name, "No Custom Input node handles this event");
        }
        for node in entries {
            self.fire_entry(instance_id, node);
        }
    }

    /// Complete a node's current activation
    pub(crate) fn finish_node(&mut self, instance_id: &str, node: NodeGuid) {
        let Some(instance) = self.instances.live.get_mut(instance_id) else {
            return;
        };
        if instance.mark_finished(node, NodeActivationState::Completed) {
            debug!(instance = %instance_id, node = %node, "Node finished");
            self.publish(FlowEvent::NodeFinished {
                instance: instance_id.to_string(),
                node,
            });
        }
    }

    /// Apply the actions a node handler recorded, in order
    pub(crate) fn apply_actions(&mut self, instance_id: &str, node: NodeGuid, actions: Vec<NodeAction>) {
        for action in actions {
            match action {
                NodeAction::TriggerOutput { pin, activation } => {
                    self.trigger_output(instance_id, node, &pin, activation);
                }
                NodeAction::Finish => self.finish_node(instance_id, node),
                NodeAction::FinishGraph => self.on_graph_finished(instance_id),
                NodeAction::CreateSubFlow {
                    asset,
                    properties,
                    preload_only,
                } => {
                    let owner = NodeRef::new(instance_id, node);
                    if let Err(e) = self.create_sub_flow(owner, &asset, properties, preload_only) {
                        self.log_runtime(RuntimeSeverity::Error, instance_id, Some(node), e.to_string());
                        // A live nested instance keeps running; anything else would hang the node
                        let keeps_running = matches!(e, FlowError::SubFlowAlreadyExists(_));
                        if !preload_only && !keeps_running {
                            self.finish_node(instance_id, node);
                        }
                    }
                }
                NodeAction::RemoveSubFlow { policy } => {
                    self.remove_sub_flow(&NodeRef::new(instance_id, node), policy);
                }
                NodeAction::ReattachSubFlow { saved_instance } => {
                    let owner = NodeRef::new(instance_id, node);
                    if let Err(e) = self.reattach_sub_flow(owner, &saved_instance) {
                        self.log_runtime(RuntimeSeverity::Error, instance_id, Some(node), e.to_string());
                    }
                }
                NodeAction::TriggerCustomEvent { event_name } => {
                    self.route_custom_event(&NodeRef::new(instance_id, node), &event_name);
                }
                NodeAction::TriggerCustomOutput { event_name } => {
                    self.raise_custom_output(instance_id, &event_name);
                }
                NodeAction::LogError(message) => {
                    self.log_runtime(RuntimeSeverity::Error, instance_id, Some(node), message);
                }
            }
        }
    }

    /// Forward a custom event from a sub-graph node into its nested instance
    fn route_custom_event(&mut self, owner: &NodeRef, event_name: &str) {
        let Some(nested) = self.instances.sub_flows.get(owner).cloned() else {
            warn!(node = %owner, event = event_name, "No nested instance to receive custom event");
            return;
        };
        self.fire_custom_input(&nested, event_name);
    }

    /// Deliver a custom output to whoever owns the instance
    fn raise_custom_output(&mut self, instance_id: &str, event_name: &str) {
        let Some(owner) = self
            .instances
            .live
            .get(instance_id)
            .map(|i| i.owner().clone())
        else {
            return;
        };

        self.publish(FlowEvent::CustomOutput {
            instance: instance_id.to_string(),
            event_name: event_name.to_string(),
        });

        match owner {
            InstanceOwner::SubGraph(node) => {
                self.trigger_output(&node.instance, node.node, event_name, PinActivationType::Default);
            }
            InstanceOwner::Root { owner } => {
                debug!(instance = %instance_id, owner = %owner, event = event_name, "Custom output reached root");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flow_types::{FlowAsset, NodeTemplate};
    use serde_json::json;

    use crate::nodes::{
        LogicalOrNode, CUSTOM_INPUT_NODE, CUSTOM_OUTPUT_NODE, FINISH_NODE, IN_PIN, LOGICAL_OR_NODE,
        OUT_PIN, REROUTE_NODE, START_NODE,
    };
    use crate::{
        FlowEvent, FlowSettings, FlowSubsystem, InMemoryAssetLoader, NodeRegistry,
        RuntimeSeverity,
    };

    use super::*;

    fn subsystem_with(loader: InMemoryAssetLoader, settings: FlowSettings) -> FlowSubsystem {
        FlowSubsystem::new(
            Arc::new(settings),
            Arc::new(NodeRegistry::with_builtins()),
            Arc::new(loader),
        )
    }

    fn unlimited_gate() -> NodeTemplate {
        NodeTemplate::new(LOGICAL_OR_NODE, json!({ "execution_limit": 0 }))
    }

    fn gate_count(flows: &FlowSubsystem, id: &str, gate: NodeGuid) -> u32 {
        flows
            .instance(id)
            .and_then(|i| i.node(gate))
            .and_then(|n| n.downcast_ref::<LogicalOrNode>())
            .map(|or| or.execution_count())
            .unwrap_or_default()
    }

    #[test]
    fn test_fan_out_fires_in_connection_order() {
        let mut asset = FlowAsset::new("test/fan_out");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let a = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        let b = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        let c = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        asset.connect(start, OUT_PIN, b, IN_PIN);
        asset.connect(start, OUT_PIN, c, IN_PIN);
        asset.connect(start, OUT_PIN, a, IN_PIN);
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let mut events = flows.subscribe();
        flows.start_root_flow("world", "test/fan_out").unwrap();

        let mut finished = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::NodeFinished { node, .. } = event {
                if node != start {
                    finished.push(node);
                }
            }
        }
        assert_eq!(finished, vec![b, c, a]);
    }

    #[test]
    fn test_duplicate_connection_fires_twice() {
        let mut asset = FlowAsset::new("test/duplicate");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let gate = asset.add_node(unlimited_gate());
        asset.connect(start, OUT_PIN, gate, "0");
        asset.connect(start, OUT_PIN, gate, "0");
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/duplicate").unwrap();
        assert_eq!(gate_count(&flows, &id, gate), 2);
    }

    #[test]
    fn test_disabled_node_drops_activation() {
        let mut asset = FlowAsset::new("test/disabled");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let gate = asset.add_node(unlimited_gate().with_signal_mode(SignalMode::Disabled));
        asset.connect(start, OUT_PIN, gate, "0");
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/disabled").unwrap();
        assert_eq!(gate_count(&flows, &id, gate), 0);
        let state = flows.instance(&id).and_then(|i| i.node(gate)).map(|n| n.state());
        assert_eq!(state, Some(NodeActivationState::NeverActivated));
    }

    #[test]
    fn test_pass_through_skips_handler() {
        let mut asset = FlowAsset::new("test/pass_through");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let skipped = asset.add_node(unlimited_gate().with_signal_mode(SignalMode::PassThrough));
        let counter = asset.add_node(unlimited_gate());
        asset.connect(start, OUT_PIN, skipped, "0");
        asset.connect(skipped, OUT_PIN, counter, "0");
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/pass_through").unwrap();
        assert_eq!(gate_count(&flows, &id, skipped), 0);
        assert_eq!(gate_count(&flows, &id, counter), 1);

        #[cfg(feature = "diagnostics")]
        {
            let instance = flows.instance(&id).unwrap();
            assert!(instance.node(skipped).unwrap().output_records(OUT_PIN).is_empty());
            let records = instance.node(counter).unwrap().output_records(OUT_PIN);
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].activation_type, PinActivationType::Forced);

            let entered = instance.node(skipped).unwrap().input_records("0");
            assert_eq!(entered.len(), 1);
            assert_eq!(entered[0].activation_type, PinActivationType::Default);
            // Reached through the pass-through hop
            assert!(instance.node(counter).unwrap().input_records("0").is_empty());
        }
    }

    #[cfg(feature = "diagnostics")]
    #[test]
    fn test_input_records_keep_activation_type() {
        let mut asset = FlowAsset::new("test/forced");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let gate = asset.add_node(unlimited_gate());
        let hop = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        asset.connect(start, OUT_PIN, gate, "0");
        asset.connect(gate, OUT_PIN, hop, IN_PIN);
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/forced").unwrap();
        flows.trigger_input(&id, hop, IN_PIN).unwrap();

        let instance = flows.instance(&id).unwrap();
        let gate_in = instance.node(gate).unwrap().input_records("0");
        assert_eq!(gate_in.len(), 1);
        assert_eq!(gate_in[0].activation_type, PinActivationType::Default);

        let hop_in: Vec<_> = instance
            .node(hop)
            .unwrap()
            .input_records(IN_PIN)
            .iter()
            .map(|r| r.activation_type)
            .collect();
        assert_eq!(hop_in, vec![PinActivationType::Forced, PinActivationType::Default]);
    }

    #[test]
    fn test_disallowed_signal_mode_drops_activation() {
        let mut asset = FlowAsset::new("test/disallowed");
        asset.custom_outputs.push("Done".to_string());
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let output = asset.add_node(
            NodeTemplate::new(CUSTOM_OUTPUT_NODE, json!({ "event_name": "Done" }))
                .with_signal_mode(SignalMode::PassThrough),
        );
        asset.connect(start, OUT_PIN, output, IN_PIN);
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let mut events = flows.subscribe();
        flows.start_root_flow("world", "test/disallowed").unwrap();
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, FlowEvent::CustomOutput { .. }));
        }
    }

    #[test]
    fn test_root_custom_output_and_input() {
        let mut asset = FlowAsset::new("test/custom");
        asset.custom_inputs.push("Ping".to_string());
        asset.custom_outputs.push("Pong".to_string());
        let input = asset.add_node(NodeTemplate::new(CUSTOM_INPUT_NODE, json!({ "event_name": "Ping" })));
        let output = asset.add_node(NodeTemplate::new(CUSTOM_OUTPUT_NODE, json!({ "event_name": "Pong" })));
        asset.connect(input, OUT_PIN, output, IN_PIN);
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/custom").unwrap();
        let mut events = flows.subscribe();
        flows.trigger_root_custom_input("world", "test/custom", "Ping").unwrap();

        let mut outputs = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::CustomOutput { instance, event_name } = event {
                assert_eq!(instance, id);
                outputs.push(event_name);
            }
        }
        assert_eq!(outputs, vec!["Pong"]);
    }

    #[test]
    fn test_propagation_depth_guard() {
        let mut asset = FlowAsset::new("test/loop");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let a = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        let b = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        asset.connect(start, OUT_PIN, a, IN_PIN);
        asset.connect(a, OUT_PIN, b, IN_PIN);
        asset.connect(b, OUT_PIN, a, IN_PIN);
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let settings = FlowSettings {
            max_propagation_depth: 8,
            ..Default::default()
        };
        let mut flows = subsystem_with(loader, settings);
        flows.start_root_flow("world", "test/loop").unwrap();

        let errors: Vec<_> = flows
            .runtime_log()
            .iter()
            .filter(|m| m.severity == RuntimeSeverity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Propagation depth limit"));
    }

    #[test]
    fn test_unknown_input_pin_is_dropped() {
        let mut asset = FlowAsset::new("test/unknown_pin");
        asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let gate = asset.add_node(unlimited_gate());
        let finish = asset.add_node(NodeTemplate::new(FINISH_NODE, json!(null)));
        let loader = InMemoryAssetLoader::new();
        loader.insert(asset);

        let mut flows = subsystem_with(loader, FlowSettings::default());
        let id = flows.start_root_flow("world", "test/unknown_pin").unwrap();
        flows.trigger_input(&id, gate, "Nope").unwrap();
        assert_eq!(gate_count(&flows, &id, gate), 0);

        flows.trigger_input(&id, finish, IN_PIN).unwrap();
        assert!(flows.instance(&id).is_none());
    }
}
