//! Graph Instance
//!
//! A live execution of a template: node instances, the connection table built
//! from the template, the set of active nodes and the property bag.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use flow_types::{FlowAsset, GraphInstanceSave, NodeActivationState, NodeGuid, NodeSaveData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    ConnectionTable, EntryPoint, FlowSettings, GraphView, NodeAction, NodeContext, NodeInstance,
    NodeRef, NodeRegistry,
};

/// Who started a graph instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceOwner {
    /// A root flow started by some owner (an actor, a level, a test...)
    Root { owner: String },
    /// A nested flow owned by a sub-graph node
    SubGraph(NodeRef),
}

impl fmt::Display for InstanceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceOwner::Root { owner } => write!(f, "root:{}", owner),
            InstanceOwner::SubGraph(node) => write!(f, "node:{}", node),
        }
    }
}

pub struct GraphInstance {
    id: String,
    asset: Arc<FlowAsset>,
    owner: InstanceOwner,
    depth: u32,
    nodes: HashMap<NodeGuid, NodeInstance>,
    node_order: Vec<NodeGuid>,
    connections: ConnectionTable,
    active_nodes: Vec<NodeGuid>,
    properties: BTreeMap<String, Value>,
    pub(crate) started: bool,
    pub(crate) finished: bool,
}

impl GraphInstance {
    /// Instance a template, building every node through the registry
    ///
    /// Nodes of unknown type or with an invalid config are skipped with a
    /// warning. Connections touching them are dropped.
    pub fn new(
        id: impl Into<String>,
        asset: Arc<FlowAsset>,
        owner: InstanceOwner,
        depth: u32,
        registry: &NodeRegistry,
    ) -> Self {
        let id = id.into();
        let mut nodes = HashMap::with_capacity(asset.nodes.len());
        let mut node_order = Vec::with_capacity(asset.nodes.len());

        for template in &asset.nodes {
            if nodes.contains_key(&template.guid) {
                warn!(instance = %id, node = %template.guid, "Duplicate node guid, skipping");
                continue;
            }
            match registry.create(template) {
                Ok(behavior) => {
                    nodes.insert(
                        template.guid,
                        NodeInstance::new(
                            template.guid,
                            template.node_type.clone(),
                            template.signal_mode,
                            behavior,
                        ),
                    );
                    node_order.push(template.guid);
                }
                Err(e) => warn!(instance = %id, node = %template.guid, "Skipping node: {}", e),
            }
        }

        let connections = ConnectionTable::build(&asset, &nodes);
        let properties = asset.properties.clone();

        Self {
            id,
            asset,
            owner,
            depth,
            nodes,
            node_order,
            connections,
            active_nodes: Vec::new(),
            properties,
            started: false,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn asset(&self) -> &Arc<FlowAsset> {
        &self.asset
    }

    pub fn asset_path(&self) -> &str {
        &self.asset.path
    }

    pub fn owner(&self) -> &InstanceOwner {
        &self.owner
    }

    /// Nesting depth, 0 for root flows
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn node(&self, guid: NodeGuid) -> Option<&NodeInstance> {
        self.nodes.get(&guid)
    }

    pub(crate) fn node_mut(&mut self, guid: NodeGuid) -> Option<&mut NodeInstance> {
        self.nodes.get_mut(&guid)
    }

    /// Node guids in template order
    pub fn node_guids(&self) -> &[NodeGuid] {
        &self.node_order
    }

    /// Nodes in template order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInstance> {
        self.node_order.iter().filter_map(|g| self.nodes.get(g))
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Nodes activated and not yet finished, in activation order
    pub fn active_nodes(&self) -> &[NodeGuid] {
        &self.active_nodes
    }

    pub fn is_active(&self, guid: NodeGuid) -> bool {
        self.active_nodes.contains(&guid)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Nodes answering an entry point, in template order
    pub fn entry_nodes(&self, entry: &EntryPoint) -> Vec<NodeGuid> {
        self.nodes()
            .filter(|n| n.behavior().entry_point().as_ref() == Some(entry))
            .map(|n| n.guid())
            .collect()
    }

    pub(crate) fn mark_active(&mut self, guid: NodeGuid) {
        if let Some(node) = self.nodes.get_mut(&guid) {
            node.state = NodeActivationState::Active;
            if !self.active_nodes.contains(&guid) {
                self.active_nodes.push(guid);
            }
        }
    }

    /// Move a node to a terminal state, returning false if it was not active
    pub(crate) fn mark_finished(&mut self, guid: NodeGuid, state: NodeActivationState) -> bool {
        let Some(node) = self.nodes.get_mut(&guid) else {
            return false;
        };
        if node.state != NodeActivationState::Active {
            return false;
        }
        node.state = state;
        self.active_nodes.retain(|g| *g != guid);
        true
    }

    /// Abort every node still active
    pub(crate) fn abort_active_nodes(&mut self) {
        for guid in std::mem::take(&mut self.active_nodes) {
            if let Some(node) = self.nodes.get_mut(&guid) {
                node.state = NodeActivationState::Aborted;
            }
        }
    }

    /// Apply forwarded property values onto declared properties
    ///
    /// Values arrive as JSON text. Unknown names and unparsable values are
    /// skipped with a warning.
    pub(crate) fn apply_properties(&mut self, values: &HashMap<String, String>) {
        for (name, text) in values {
            if !self.asset.properties.contains_key(name) {
                warn!(instance = %self.id, property = %name, "Unknown input property, skipping");
                continue;
            }
            match serde_json::from_str::<Value>(text) {
                Ok(value) => {
                    self.properties.insert(name.clone(), value);
                }
                Err(e) => warn!(
                    instance = %self.id,
                    property = %name,
                    "Failed to import property: {}",
                    e
                ),
            }
        }
    }

    /// Run `f` against a node and the context it would see during execution
    ///
    /// The node is taken out of the instance for the duration of the call so
    /// the context can expose its peers read-only.
    pub(crate) fn with_node<R>(
        &mut self,
        guid: NodeGuid,
        nested_instance: Option<String>,
        f: impl FnOnce(&mut NodeInstance, &mut NodeContext<'_>) -> R,
    ) -> Option<(R, Vec<NodeAction>)> {
        let mut node = self.nodes.remove(&guid)?;
        let result = {
            let view = GraphView {
                instance_id: &self.id,
                asset: &self.asset,
                owner: Some(&self.owner),
                peers: Some(&self.nodes),
            };
            let mut ctx = NodeContext::new(guid, view, nested_instance);
            let value = f(&mut node, &mut ctx);
            (value, ctx.into_actions())
        };
        self.nodes.insert(guid, node);
        Some(result)
    }

    /// Nodes whose content should be preloaded when the instance starts
    ///
    /// A node is preloaded when its template asks for it, or when its type
    /// has a preload depth and it sits within that many hops of a Start node.
    pub(crate) fn preload_candidates(&self, settings: &FlowSettings) -> Vec<NodeGuid> {
        let mut distance: HashMap<NodeGuid, u32> = HashMap::new();
        let mut queue: VecDeque<NodeGuid> = self.entry_nodes(&EntryPoint::Start).into();
        for start in &queue {
            distance.insert(*start, 0);
        }
        while let Some(current) = queue.pop_front() {
            let next = distance.get(&current).copied().unwrap_or_default() + 1;
            for successor in self.connections.successors(current) {
                if !distance.contains_key(&successor) {
                    distance.insert(successor, next);
                    queue.push_back(successor);
                }
            }
        }

        let flagged: HashSet<NodeGuid> = self
            .asset
            .nodes
            .iter()
            .filter(|t| t.preload)
            .map(|t| t.guid)
            .collect();

        self.nodes()
            .filter(|node| {
                if flagged.contains(&node.guid()) {
                    return true;
                }
                let depth = settings.preload_depth(node.node_type());
                depth > 0
                    && distance
                        .get(&node.guid())
                        .is_some_and(|d| *d > 0 && *d <= depth)
            })
            .map(|node| node.guid())
            .collect()
    }

    /// Snapshot the instance for a save game
    ///
    /// `nested_for` resolves the nested instance currently owned by a node.
    pub(crate) fn save(&mut self, nested_for: impl Fn(NodeGuid) -> Option<String>) -> GraphInstanceSave {
        let mut nodes = Vec::with_capacity(self.node_order.len());
        for guid in self.node_order.clone() {
            let nested = nested_for(guid);
            let Some((data, _)) = self.with_node(guid, nested, |node, ctx| {
                (node.state, node.behavior().save_state(ctx))
            }) else {
                continue;
            };
            let (state, data) = data;
            nodes.push(NodeSaveData { guid, state, data });
        }

        GraphInstanceSave {
            instance_id: self.id.clone(),
            asset_path: self.asset.path.clone(),
            started: self.started,
            nodes,
            active_nodes: self.active_nodes.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Restore node states and saved fields from a snapshot
    pub(crate) fn restore(&mut self, save: &GraphInstanceSave) {
        for saved in &save.nodes {
            let Some(node) = self.nodes.get_mut(&saved.guid) else {
                warn!(instance = %self.id, node = %saved.guid, "Saved node no longer exists");
                continue;
            };
            node.state = saved.state;
            if let Err(e) = node.behavior_mut().load_state(&saved.data) {
                warn!(instance = %self.id, node = %saved.guid, "Failed to load node state: {}", e);
            }
        }
        self.active_nodes = save
            .active_nodes
            .iter()
            .copied()
            .filter(|g| self.nodes.contains_key(g))
            .collect();
        self.properties.extend(save.properties.clone());
        self.started = save.started;
    }
}

impl fmt::Debug for GraphInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphInstance")
            .field("id", &self.id)
            .field("asset", &self.asset.path)
            .field("owner", &self.owner)
            .field("depth", &self.depth)
            .field("active_nodes", &self.active_nodes)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{LogicalOrNode, LOGICAL_OR_NODE, OUT_PIN, REROUTE_NODE, START_NODE, SUB_GRAPH_NODE};
    use flow_types::NodeTemplate;
    use serde_json::json;

    fn root() -> InstanceOwner {
        InstanceOwner::Root {
            owner: "world".to_string(),
        }
    }

    #[test]
    fn test_build_skips_unknown_nodes() {
        let mut asset = FlowAsset::new("test/graph");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let unknown = asset.add_node(NodeTemplate::new("Game/Unknown", json!(null)));
        asset.connect(start, OUT_PIN, unknown, "In");

        let instance = GraphInstance::new("graph_1", Arc::new(asset), root(), 0, &NodeRegistry::with_builtins());
        assert_eq!(instance.node_guids(), &[start]);
        assert!(instance.connections().is_empty());
        assert_eq!(instance.entry_nodes(&EntryPoint::Start), vec![start]);
    }

    #[test]
    fn test_apply_properties() {
        let mut asset = FlowAsset::new("test/props");
        asset.properties.insert("Gold".to_string(), json!(0));
        let mut instance = GraphInstance::new("props_1", Arc::new(asset), root(), 0, &NodeRegistry::with_builtins());

        let values = HashMap::from([
            ("Gold".to_string(), "25".to_string()),
            ("Silver".to_string(), "3".to_string()),
        ]);
        instance.apply_properties(&values);
        assert_eq!(instance.property("Gold"), Some(&json!(25)));
        assert_eq!(instance.property("Silver"), None);

        instance.apply_properties(&HashMap::from([("Gold".to_string(), "{oops".to_string())]));
        assert_eq!(instance.property("Gold"), Some(&json!(25)));
    }

    #[test]
    fn test_save_and_restore() {
        let mut asset = FlowAsset::new("test/save");
        let gate = asset.add_node(NodeTemplate::new(LOGICAL_OR_NODE, json!({ "execution_limit": 0 })));
        let asset = Arc::new(asset);
        let registry = NodeRegistry::with_builtins();

        let mut instance = GraphInstance::new("save_1", Arc::clone(&asset), root(), 0, &registry);
        let mut unstarted = GraphInstance::new("save_1", Arc::clone(&asset), root(), 0, &registry);
        unstarted.restore(&instance.save(|_| None));
        assert!(!unstarted.is_started());

        instance.started = true;
        instance.mark_active(gate);
        let (_, actions) = instance
            .with_node(gate, None, |node, ctx| node.behavior_mut().execute_input(ctx, "0"))
            .unwrap();
        assert_eq!(actions.len(), 2);

        let save = instance.save(|_| None);
        assert_eq!(save.active_nodes, vec![gate]);

        let mut restored = GraphInstance::new("save_1", asset, root(), 0, &registry);
        restored.restore(&save);
        assert!(restored.is_started());
        assert!(restored.is_active(gate));
        let or = restored.node(gate).and_then(|n| n.downcast_ref::<LogicalOrNode>()).unwrap();
        assert_eq!(or.execution_count(), 1);
    }

    #[test]
    fn test_finish_transitions() {
        let mut asset = FlowAsset::new("test/finish");
        let a = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        let b = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)));
        let mut instance = GraphInstance::new("finish_1", Arc::new(asset), root(), 0, &NodeRegistry::with_builtins());

        assert!(!instance.mark_finished(a, NodeActivationState::Completed));
        instance.mark_active(a);
        instance.mark_active(b);
        assert!(instance.mark_finished(a, NodeActivationState::Completed));
        assert_eq!(instance.active_nodes(), &[b]);

        instance.abort_active_nodes();
        assert_eq!(instance.node(b).unwrap().state(), NodeActivationState::Aborted);
        assert!(instance.active_nodes().is_empty());
    }

    #[test]
    fn test_preload_candidates() {
        let mut asset = FlowAsset::new("test/preload");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let near = asset.add_node(NodeTemplate::new(SUB_GRAPH_NODE, json!({ "asset": "a" })));
        let far = asset.add_node(NodeTemplate::new(SUB_GRAPH_NODE, json!({ "asset": "b" })));
        let flagged = asset.add_node(NodeTemplate::new(REROUTE_NODE, json!(null)).preloaded());
        asset.connect(start, OUT_PIN, near, "Start");
        asset.connect(near, "Finish", far, "Start");

        let instance = GraphInstance::new("preload_1", Arc::new(asset), root(), 0, &NodeRegistry::with_builtins());
        let settings = FlowSettings {
            default_preload_depth: HashMap::from([(SUB_GRAPH_NODE.to_string(), 1)]),
            ..Default::default()
        };
        assert_eq!(instance.preload_candidates(&settings), vec![near, flagged]);
        assert_eq!(instance.preload_candidates(&FlowSettings::default()), vec![flagged]);
    }
}
