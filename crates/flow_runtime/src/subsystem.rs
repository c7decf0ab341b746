//! Flow Subsystem
//!
//! Owns every graph instance of a process: root flows started by owners and
//! the nested instances created by sub-graph nodes. All execution goes through
//! `&mut FlowSubsystem`, so a running graph is never touched from two places
//! at once. Asset loading is the only async boundary, see
//! [`FlowSubsystem::process_pending_loads`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use flow_types::{
    FinishPolicy, FlowAsset, FlowSaveData, NodeActivationState, NodeGuid, PinActivationType,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::nodes::FINISH_PIN;
use crate::subflow::{InstanceRegistry, KeptInstance};
use crate::{
    AssetLoader, EntryPoint, FlowError, FlowResult, FlowSettings, GraphInstance, InstanceOwner,
    NodeContext, NodeInstance, NodeRef, NodeRegistry,
};

// ─────────────────────────────────────────────────────────────────────────────
// Events and Runtime Log
// ─────────────────────────────────────────────────────────────────────────────

/// Notifications published while flows run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        instance: String,
        asset: String,
    },
    FlowFinished {
        instance: String,
        asset: String,
        policy: FinishPolicy,
    },
    /// A custom output reached the root of a flow hierarchy, or a sub-graph node
    CustomOutput {
        instance: String,
        event_name: String,
    },
    NodeFinished {
        instance: String,
        node: NodeGuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSeverity {
    Warning,
    Error,
}

/// An error or warning raised while executing flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    pub severity: RuntimeSeverity,
    pub instance: String,
    pub node: Option<NodeGuid>,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow Subsystem
// ─────────────────────────────────────────────────────────────────────────────

pub struct FlowSubsystem {
    pub(crate) settings: Arc<FlowSettings>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) loader: Arc<dyn AssetLoader>,
    pub(crate) templates: HashMap<String, Arc<FlowAsset>>,
    pub(crate) instances: InstanceRegistry,
    /// (owner, asset path) -> instance id
    pub(crate) root_flows: BTreeMap<(String, String), String>,
    events: broadcast::Sender<FlowEvent>,
    runtime_log: Vec<RuntimeMessage>,
    pub(crate) propagation_depth: usize,
    /// Save game being restored, source of snapshots for reattaching sub-flows
    pub(crate) loading_save: Option<FlowSaveData>,
}

impl FlowSubsystem {
    pub fn new(
        settings: Arc<FlowSettings>,
        registry: Arc<NodeRegistry>,
        loader: Arc<dyn AssetLoader>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            settings,
            registry,
            loader,
            templates: HashMap::new(),
            instances: InstanceRegistry::default(),
            root_flows: BTreeMap::new(),
            events,
            runtime_log: Vec::new(),
            propagation_depth: 0,
            loading_save: None,
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Subscribe to flow events
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Errors and warnings raised by running flows, oldest first
    pub fn runtime_log(&self) -> &[RuntimeMessage] {
        &self.runtime_log
    }

    pub fn clear_runtime_log(&mut self) {
        self.runtime_log.clear();
    }

    /// Get a live instance by id
    pub fn instance(&self, id: &str) -> Option<&GraphInstance> {
        self.instances.live.get(id)
    }

    /// Ids of all live instances, sorted
    pub fn instance_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.instances.live.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Instance id of a running root flow
    pub fn root_instance_id(&self, owner: &str, asset: &str) -> Option<&str> {
        self.root_flows
            .get(&(owner.to_string(), asset.to_string()))
            .map(|s| s.as_str())
    }

    pub fn root_instance(&self, owner: &str, asset: &str) -> Option<&GraphInstance> {
        self.root_instance_id(owner, asset)
            .and_then(|id| self.instance(id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Templates
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a template through the async loader and cache it
    pub async fn preload_asset(&mut self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        if let Some(asset) = self.templates.get(path) {
            return Ok(Arc::clone(asset));
        }
        let loader = Arc::clone(&self.loader);
        let asset = loader.load(path).await?;
        self.templates.insert(path.to_string(), Arc::clone(&asset));
        Ok(asset)
    }

    /// Whether a template is already cached
    pub fn is_asset_cached(&self, path: &str) -> bool {
        self.templates.contains_key(path)
    }

    /// Cached template, or a blocking load for immediate needs
    pub(crate) fn template(&mut self, path: &str) -> FlowResult<Arc<FlowAsset>> {
        if let Some(asset) = self.templates.get(path) {
            return Ok(Arc::clone(asset));
        }
        let asset = self.loader.load_sync(path)?;
        self.templates.insert(path.to_string(), Arc::clone(&asset));
        Ok(asset)
    }

    pub(crate) fn next_instance_id(asset: &FlowAsset) -> String {
        format!("{}_{}", asset.asset_name(), Uuid::new_v4().simple())
    }

    pub(crate) fn instantiate(
        &self,
        id: &str,
        asset: Arc<FlowAsset>,
        owner: InstanceOwner,
        depth: u32,
    ) -> GraphInstance {
        GraphInstance::new(id, asset, owner, depth, &self.registry)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Root Flows
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a root flow for an owner, at most one per (owner, template)
    pub fn start_root_flow(&mut self, owner: &str, asset_path: &str) -> FlowResult<String> {
        let key = (owner.to_string(), asset_path.to_string());
        if self.root_flows.contains_key(&key) {
            return Err(FlowError::RootFlowAlreadyExists {
                owner: owner.to_string(),
                asset: asset_path.to_string(),
            });
        }

        let asset = self.template(asset_path)?;
        self.discard_kept_root(owner, asset_path);

        let id = Self::next_instance_id(&asset);
        let instance = self.instantiate(
            &id,
            asset,
            InstanceOwner::Root {
                owner: owner.to_string(),
            },
            0,
        );
        self.instances.live.insert(id.clone(), instance);
        self.root_flows.insert(key, id.clone());

        info!(instance = %id, owner, asset = asset_path, "Starting root flow");
        self.start_instance(&id);
        Ok(id)
    }

    pub fn finish_root_flow(
        &mut self,
        owner: &str,
        asset_path: &str,
        policy: FinishPolicy,
    ) -> FlowResult<()> {
        let id = self
            .root_instance_id(owner, asset_path)
            .map(str::to_string)
            .ok_or_else(|| FlowError::RootFlowNotFound {
                owner: owner.to_string(),
                asset: asset_path.to_string(),
            })?;
        self.finish_flow(&id, policy);
        Ok(())
    }

    /// Fire the custom input nodes of a running root flow
    pub fn trigger_root_custom_input(
        &mut self,
        owner: &str,
        asset_path: &str,
        event_name: &str,
    ) -> FlowResult<()> {
        let id = self
            .root_instance_id(owner, asset_path)
            .map(str::to_string)
            .ok_or_else(|| FlowError::RootFlowNotFound {
                owner: owner.to_string(),
                asset: asset_path.to_string(),
            })?;
        self.fire_custom_input(&id, event_name);
        Ok(())
    }

    /// Activate an input pin from outside the graph
    pub fn trigger_input(&mut self, instance_id: &str, node: NodeGuid, pin: &str) -> FlowResult<()> {
        self.require_node(instance_id, node)?;
        self.activate_input(instance_id, node, pin, PinActivationType::Default);
        Ok(())
    }

    /// Finish a node from outside its own logic
    pub fn force_finish_node(&mut self, node: &NodeRef) -> FlowResult<()> {
        self.require_node(&node.instance, node.node)?;
        let nested = self.nested_of(&node.instance, node.node);
        let Some(instance) = self.instances.live.get_mut(&node.instance) else {
            return Err(FlowError::InstanceNotFound(node.instance.clone()));
        };
        if let Some((_, actions)) = instance.with_node(node.node, nested, |n, ctx| {
            n.behavior_mut().force_finish(ctx)
        }) {
            debug!(instance = %node.instance, node = %node.node, "Force finishing node");
            self.apply_actions(&node.instance, node.node, actions);
        }
        Ok(())
    }

    /// Release content a node preloaded
    pub fn flush_node_content(&mut self, node: &NodeRef) -> FlowResult<()> {
        self.require_node(&node.instance, node.node)?;
        let nested = self.nested_of(&node.instance, node.node);
        let Some(instance) = self.instances.live.get_mut(&node.instance) else {
            return Err(FlowError::InstanceNotFound(node.instance.clone()));
        };
        if let Some((_, actions)) = instance.with_node(node.node, nested, |n, ctx| {
            n.preloaded = false;
            n.behavior_mut().flush_content(ctx)
        }) {
            self.apply_actions(&node.instance, node.node, actions);
        }
        Ok(())
    }

    fn require_node(&self, instance_id: &str, node: NodeGuid) -> FlowResult<()> {
        let instance = self
            .instances
            .live
            .get(instance_id)
            .ok_or_else(|| FlowError::InstanceNotFound(instance_id.to_string()))?;
        if instance.node(node).is_none() {
            return Err(FlowError::NodeNotFound {
                instance: instance_id.to_string(),
                node,
            });
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Instance Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Preload content, then fire every Start node
    pub(crate) fn start_instance(&mut self, id: &str) {
        let Some(instance) = self.instances.live.get_mut(id) else {
            return;
        };
        if instance.started {
            return;
        }
        instance.started = true;
        let asset = instance.asset_path().to_string();
        let candidates = instance.preload_candidates(&self.settings);

        for guid in candidates {
            self.preload_node(id, guid);
        }

        self.publish(FlowEvent::FlowStarted {
            instance: id.to_string(),
            asset: asset.clone(),
        });

        let starts = self
            .instances
            .live
            .get(id)
            .map(|i| i.entry_nodes(&EntryPoint::Start))
            .unwrap_or_default();
        if starts.is_empty() {
            warn!(instance = %id, asset = %asset, "Flow has no Start node");
        }
        for guid in starts {
            self.fire_entry(id, guid);
        }
    }

    fn preload_node(&mut self, id: &str, guid: NodeGuid) {
        let nested = self.nested_of(id, guid);
        let Some(instance) = self.instances.live.get_mut(id) else {
            return;
        };
        if let Some((_, actions)) = instance.with_node(guid, nested, |node, ctx| {
            node.preloaded = true;
            node.behavior_mut().preload_content(ctx)
        }) {
            debug!(instance = %id, node = %guid, "Preloaded node content");
            self.apply_actions(id, guid, actions);
        }
    }

    /// Run `on_load` on every node of a restored instance
    pub(crate) fn run_on_load(&mut self, id: &str) {
        let guids = match self.instances.live.get(id) {
            Some(instance) => instance.node_guids().to_vec(),
            None => return,
        };
        for guid in guids {
            let nested = self.nested_of(id, guid);
            let Some(instance) = self.instances.live.get_mut(id) else {
                return;
            };
            if let Some((_, actions)) =
                instance.with_node(guid, nested, |node, ctx| node.behavior_mut().on_load(ctx))
            {
                self.apply_actions(id, guid, actions);
            }
        }
    }

    /// Tear an instance down
    ///
    /// The instance leaves the live set before any node hook runs, so nothing
    /// can activate it again. Preloaded content no node used is flushed first.
    /// `Keep` then retains a snapshot taken before cleanup.
    /// `Abort` aborts active nodes and discards every snapshot kept by the
    /// instance's sub-graph nodes.
    pub(crate) fn finish_flow(&mut self, id: &str, policy: FinishPolicy) {
        let Some(mut instance) = self.instances.live.remove(id) else {
            debug!(instance = %id, "Finish requested for an instance that is not live");
            return;
        };
        instance.finished = true;

        let owner = instance.owner().clone();
        if let InstanceOwner::SubGraph(node) = &owner {
            if self.instances.sub_flows.get(node).map(String::as_str) == Some(id) {
                self.instances.sub_flows.remove(node);
            }
        }
        self.root_flows.retain(|_, root_id| root_id != id);

        let guids = instance.node_guids().to_vec();
        for guid in &guids {
            let flush = instance.node(*guid).is_some_and(|n| {
                n.is_preloaded() && n.state() == NodeActivationState::NeverActivated
            });
            if flush {
                self.run_node_hook(&mut instance, *guid, |node, ctx| {
                    node.behavior_mut().flush_content(ctx)
                });
            }
        }

        let snapshot = match policy {
            FinishPolicy::Keep => {
                let sub_flows = &self.instances.sub_flows;
                Some(instance.save(|guid| sub_flows.get(&NodeRef::new(id, guid)).cloned()))
            }
            FinishPolicy::Abort => None,
        };

        for guid in &guids {
            self.run_node_hook(&mut instance, *guid, |node, ctx| node.behavior_mut().cleanup(ctx));
        }

        match snapshot {
            Some(save) => {
                if let InstanceOwner::SubGraph(node) = &owner {
                    self.instances.kept_by_node.insert(node.clone(), id.to_string());
                }
                self.instances
                    .kept
                    .insert(id.to_string(), KeptInstance { owner, save });
            }
            None => {
                instance.abort_active_nodes();
                self.discard_kept_owned_by(id);
            }
        }

        info!(instance = %id, asset = %instance.asset_path(), %policy, "Flow finished");
        self.publish(FlowEvent::FlowFinished {
            instance: id.to_string(),
            asset: instance.asset_path().to_string(),
            policy,
        });
    }

    /// Run a lifecycle hook on a node of an instance that already left the live set
    fn run_node_hook(
        &mut self,
        instance: &mut GraphInstance,
        guid: NodeGuid,
        hook: impl FnOnce(&mut NodeInstance, &mut NodeContext<'_>),
    ) {
        let id = instance.id().to_string();
        let nested = self.nested_of(&id, guid);
        if let Some((_, actions)) = instance.with_node(guid, nested, hook) {
            self.apply_actions(&id, guid, actions);
        }
    }

    /// Called when a Finish node of `id` was reached
    pub(crate) fn on_graph_finished(&mut self, id: &str) {
        let Some(owner) = self.instances.live.get(id).map(|i| i.owner().clone()) else {
            return;
        };
        self.finish_flow(id, FinishPolicy::Abort);

        if let InstanceOwner::SubGraph(node) = owner {
            self.trigger_output(
                &node.instance,
                node.node,
                FINISH_PIN,
                PinActivationType::Default,
            );
            self.finish_node(&node.instance, node.node);
        }
    }

    fn discard_kept_root(&mut self, owner: &str, asset_path: &str) {
        let stale: Vec<String> = self
            .instances
            .kept
            .iter()
            .filter(|(_, kept)| {
                kept.save.asset_path == asset_path
                    && matches!(&kept.owner, InstanceOwner::Root { owner: o } if o == owner)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            debug!(instance = %id, "Discarding kept root flow replaced by a new start");
            self.instances.kept.remove(&id);
            self.discard_kept_owned_by(&id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reporting
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn publish(&self, event: FlowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn log_runtime(
        &mut self,
        severity: RuntimeSeverity,
        instance: &str,
        node: Option<NodeGuid>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match severity {
            RuntimeSeverity::Error => {
                error!(instance, node = ?node, "{}", message)
            }
            RuntimeSeverity::Warning => {
                warn!(instance, node = ?node, "{}", message)
            }
        }
        self.runtime_log.push(RuntimeMessage {
            severity,
            instance: instance.to_string(),
            node,
            message,
        });
    }
}
