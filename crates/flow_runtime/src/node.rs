//! Node Behavior and Execution Context
//!
//! A node is a [`FlowNode`] trait object plus the per-instance bookkeeping the
//! runtime keeps around it ([`NodeInstance`]). Handlers never touch other nodes
//! or the sub-flow manager directly: they record [`NodeAction`]s on the
//! [`NodeContext`] and the subsystem applies them, in order, once the handler
//! returns.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use flow_types::{
    FinishPolicy, FlowAsset, NodeActivationState, NodeGuid, Pin, PinActivationType, SignalMode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "diagnostics")]
use flow_types::{PinRecord, ValidationLog};

use crate::InstanceOwner;

// ─────────────────────────────────────────────────────────────────────────────
// Node Reference
// ─────────────────────────────────────────────────────────────────────────────

/// Identifies a node inside a live graph instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub instance: String,
    pub node: NodeGuid,
}

impl NodeRef {
    pub fn new(instance: impl Into<String>, node: NodeGuid) -> Self {
        Self {
            instance: instance.into(),
            node,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.node)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Actions
// ─────────────────────────────────────────────────────────────────────────────

/// Side effect requested by a node handler
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// Fire one of the node's output pins
    TriggerOutput {
        pin: String,
        activation: PinActivationType,
    },
    /// Mark the node's current activation as completed
    Finish,
    /// Finish the enclosing graph instance
    FinishGraph,
    /// Create (or start a preloaded) nested instance owned by this node
    CreateSubFlow {
        asset: String,
        properties: HashMap<String, String>,
        preload_only: bool,
    },
    /// Remove the nested instance owned by this node
    RemoveSubFlow { policy: FinishPolicy },
    /// Reattach a previously saved nested instance to this node
    ReattachSubFlow { saved_instance: String },
    /// Forward a custom event into this node's nested instance
    TriggerCustomEvent { event_name: String },
    /// Raise a custom output on the enclosing graph instance
    TriggerCustomOutput { event_name: String },
    /// Report a runtime error
    LogError(String),
}

/// Graph entry points fired by the subsystem rather than by connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    Start,
    CustomInput(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Context
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the graph instance a node runs in
#[derive(Clone, Copy)]
pub struct GraphView<'a> {
    pub instance_id: &'a str,
    pub asset: &'a FlowAsset,
    pub owner: Option<&'a InstanceOwner>,
    pub(crate) peers: Option<&'a HashMap<NodeGuid, NodeInstance>>,
}

impl<'a> GraphView<'a> {
    /// View of a template outside of any running instance
    pub fn template(asset: &'a FlowAsset) -> Self {
        Self {
            instance_id: "",
            asset,
            owner: None,
            peers: None,
        }
    }
}

/// Context passed to node handlers
pub struct NodeContext<'a> {
    node: NodeGuid,
    graph: GraphView<'a>,
    nested_instance: Option<String>,
    actions: Vec<NodeAction>,
}

impl<'a> NodeContext<'a> {
    /// Create a context for a node of a graph
    pub fn new(node: NodeGuid, graph: GraphView<'a>, nested_instance: Option<String>) -> Self {
        Self {
            node,
            graph,
            nested_instance,
            actions: Vec::new(),
        }
    }

    /// Context for a node of a bare template, outside of any instance
    pub fn detached(node: NodeGuid, asset: &'a FlowAsset) -> Self {
        Self::new(node, GraphView::template(asset), None)
    }

    pub fn node_guid(&self) -> NodeGuid {
        self.node
    }

    /// Template of the enclosing graph
    pub fn asset(&self) -> &FlowAsset {
        self.graph.asset
    }

    /// Path of the template of the enclosing graph
    pub fn asset_path(&self) -> &str {
        &self.graph.asset.path
    }

    pub fn instance_id(&self) -> &str {
        self.graph.instance_id
    }

    /// Whether the node runs inside a live graph instance
    pub fn is_instance(&self) -> bool {
        self.graph.owner.is_some()
    }

    /// Whether the enclosing graph is owned by a sub-graph node
    pub fn is_sub_flow_instance(&self) -> bool {
        matches!(self.graph.owner, Some(InstanceOwner::SubGraph(_)))
    }

    /// Id of the nested instance currently owned by this node
    pub fn nested_instance(&self) -> Option<&str> {
        self.nested_instance.as_deref()
    }

    /// Read an output property of another node, only once that node completed
    pub fn finished_node_property(&self, node: NodeGuid, property: &str) -> Option<Value> {
        let peer = self.graph.peers?.get(&node)?;
        if peer.state() != NodeActivationState::Completed {
            return None;
        }
        peer.behavior().output_property(property)
    }

    pub fn trigger_output(&mut self, pin: impl Into<String>, activation: PinActivationType) {
        self.actions.push(NodeAction::TriggerOutput {
            pin: pin.into(),
            activation,
        });
    }

    pub fn finish(&mut self) {
        self.actions.push(NodeAction::Finish);
    }

    pub fn finish_graph(&mut self) {
        self.actions.push(NodeAction::FinishGraph);
    }

    pub fn create_sub_flow(
        &mut self,
        asset: impl Into<String>,
        properties: HashMap<String, String>,
        preload_only: bool,
    ) {
        self.actions.push(NodeAction::CreateSubFlow {
            asset: asset.into(),
            properties,
            preload_only,
        });
    }

    pub fn remove_sub_flow(&mut self, policy: FinishPolicy) {
        self.actions.push(NodeAction::RemoveSubFlow { policy });
    }

    pub fn reattach_sub_flow(&mut self, saved_instance: impl Into<String>) {
        self.actions.push(NodeAction::ReattachSubFlow {
            saved_instance: saved_instance.into(),
        });
    }

    pub fn trigger_custom_event(&mut self, event_name: impl Into<String>) {
        self.actions.push(NodeAction::TriggerCustomEvent {
            event_name: event_name.into(),
        });
    }

    pub fn trigger_custom_output(&mut self, event_name: impl Into<String>) {
        self.actions.push(NodeAction::TriggerCustomOutput {
            event_name: event_name.into(),
        });
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.actions.push(NodeAction::LogError(message.into()));
    }

    /// Actions recorded so far
    pub fn actions(&self) -> &[NodeAction] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<NodeAction> {
        self.actions
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow Node Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Behavior of a node type
///
/// Only `execute_input` and the pin lists are required. The lifecycle hooks
/// default to doing nothing, and `force_finish` defaults to a plain finish.
pub trait FlowNode: Send + 'static {
    fn input_pins(&self) -> &[Pin];

    fn output_pins(&self) -> &[Pin];

    /// Signal modes a designer may configure on this node
    fn allowed_signal_modes(&self) -> &'static [SignalMode] {
        SignalMode::ALL
    }

    /// Entry point fired by the subsystem, if this node is one
    fn entry_point(&self) -> Option<EntryPoint> {
        None
    }

    /// Handle an activation of one of the node's input pins
    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, pin: &str);

    /// Reset per-run state when the enclosing graph is torn down
    fn cleanup(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Finish immediately, from outside the node's own logic
    fn force_finish(&mut self, ctx: &mut NodeContext<'_>) {
        ctx.finish();
    }

    fn preload_content(&mut self, _ctx: &mut NodeContext<'_>) {}

    fn flush_content(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Called after the node's saved state was restored
    fn on_load(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Fields persisted in a save game
    fn save_state(&self, _ctx: &NodeContext<'_>) -> Value {
        Value::Null
    }

    fn load_state(&mut self, _data: &Value) -> Result<(), serde_json::Error> {
        Ok(())
    }

    /// Value of a named output property, readable once the node completed
    fn output_property(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Short human-readable summary for tooling
    fn description(&self) -> String {
        String::new()
    }

    /// Design-time checks
    #[cfg(feature = "diagnostics")]
    fn validate(&self, _ctx: &NodeContext<'_>, _log: &mut ValidationLog) {}

    fn as_any(&self) -> &dyn Any;
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Instance
// ─────────────────────────────────────────────────────────────────────────────

/// A node living inside a graph instance
pub struct NodeInstance {
    guid: NodeGuid,
    node_type: String,
    signal_mode: SignalMode,
    pub(crate) state: NodeActivationState,
    pub(crate) preloaded: bool,
    behavior: Box<dyn FlowNode>,
    #[cfg(feature = "diagnostics")]
    input_records: HashMap<String, Vec<PinRecord>>,
    #[cfg(feature = "diagnostics")]
    output_records: HashMap<String, Vec<PinRecord>>,
}

impl NodeInstance {
    pub fn new(
        guid: NodeGuid,
        node_type: impl Into<String>,
        signal_mode: SignalMode,
        behavior: Box<dyn FlowNode>,
    ) -> Self {
        Self {
            guid,
            node_type: node_type.into(),
            signal_mode,
            state: NodeActivationState::NeverActivated,
            preloaded: false,
            behavior,
            #[cfg(feature = "diagnostics")]
            input_records: HashMap::new(),
            #[cfg(feature = "diagnostics")]
            output_records: HashMap::new(),
        }
    }

    pub fn guid(&self) -> NodeGuid {
        self.guid
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn signal_mode(&self) -> SignalMode {
        self.signal_mode
    }

    pub fn state(&self) -> NodeActivationState {
        self.state
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded
    }

    pub fn behavior(&self) -> &dyn FlowNode {
        self.behavior.as_ref()
    }

    pub fn behavior_mut(&mut self) -> &mut dyn FlowNode {
        self.behavior.as_mut()
    }

    /// Downcast the behavior to a concrete node type
    pub fn downcast_ref<T: FlowNode>(&self) -> Option<&T> {
        self.behavior.as_any().downcast_ref::<T>()
    }

    pub fn has_input(&self, pin: &str) -> bool {
        self.behavior.input_pins().iter().any(|p| p == pin)
    }

    pub fn has_output(&self, pin: &str) -> bool {
        self.behavior.output_pins().iter().any(|p| p == pin)
    }

    pub fn first_output(&self) -> Option<&str> {
        self.behavior.output_pins().first().map(|p| p.name.as_str())
    }

    /// Whether the configured signal mode is one the node allows
    pub fn signal_mode_allowed(&self) -> bool {
        self.behavior
            .allowed_signal_modes()
            .contains(&self.signal_mode)
    }

    #[cfg(feature = "diagnostics")]
    pub(crate) fn record_input(&mut self, pin: &str, activation: PinActivationType) {
        self.input_records
            .entry(pin.to_string())
            .or_default()
            .push(PinRecord::now(activation));
    }

    #[cfg(feature = "diagnostics")]
    pub(crate) fn record_output(&mut self, pin: &str, activation: PinActivationType) {
        self.output_records
            .entry(pin.to_string())
            .or_default()
            .push(PinRecord::now(activation));
    }

    /// Activation history of an input pin
    #[cfg(feature = "diagnostics")]
    pub fn input_records(&self, pin: &str) -> &[PinRecord] {
        self.input_records.get(pin).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Activation history of an output pin
    #[cfg(feature = "diagnostics")]
    pub fn output_records(&self, pin: &str) -> &[PinRecord] {
        self.output_records
            .get(pin)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInstance")
            .field("guid", &self.guid)
            .field("node_type", &self.node_type)
            .field("signal_mode", &self.signal_mode)
            .field("state", &self.state)
            .finish()
    }
}
