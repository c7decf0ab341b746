//! Sub-flow Manager
//!
//! The single arbiter for nested instances. Sub-graph nodes never hold their
//! nested instance: the registry maps the owning [`NodeRef`] to the instance
//! id, and owns the instance itself. At most one live or queued nested
//! instance exists per sub-graph node.
//!
//! Creation needs the nested template. A cached template is instanced inline.
//! Otherwise the creation is either loaded with a blocking call
//! (`synchronous_sub_flow_loading`) or queued until
//! [`FlowSubsystem::process_pending_loads`] loads it and resumes the creation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use flow_types::{FinishPolicy, FlowAsset, GraphInstanceSave, NodeGuid};
use tracing::{debug, info};

use crate::{
    FlowError, FlowResult, FlowSubsystem, GraphInstance, InstanceOwner, NodeRef, RuntimeSeverity,
};

/// Snapshot of an instance finished with [`FinishPolicy::Keep`]
#[derive(Debug, Clone)]
pub(crate) struct KeptInstance {
    pub owner: InstanceOwner,
    pub save: GraphInstanceSave,
}

/// A nested instance waiting for its template to load
#[derive(Debug, Clone)]
struct PendingSubFlow {
    owner: NodeRef,
    asset: String,
    properties: HashMap<String, String>,
    preload_only: bool,
}

#[derive(Default)]
pub(crate) struct InstanceRegistry {
    pub live: HashMap<String, GraphInstance>,
    /// Sub-graph node -> id of the nested instance it owns
    pub sub_flows: HashMap<NodeRef, String>,
    pub kept: HashMap<String, KeptInstance>,
    pub kept_by_node: HashMap<NodeRef, String>,
    pending: VecDeque<PendingSubFlow>,
}

/// Outcome of a sub-flow creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubFlowCreation {
    /// A new nested instance was created (and started unless preloading)
    Created(String),
    /// A preloaded nested instance was started
    StartedPreloaded(String),
    /// A preload was requested for a node that already preloaded
    AlreadyPreloaded(String),
    /// The template is loading, creation resumes in `process_pending_loads`
    Queued,
}

impl FlowSubsystem {
    /// Create the nested instance owned by a sub-graph node
    ///
    /// Starts a previously preloaded instance instead when one exists. Fails
    /// if the node already owns a started instance.
    pub fn create_sub_flow(
        &mut self,
        owner: NodeRef,
        asset: &str,
        properties: HashMap<String, String>,
        preload_only: bool,
    ) -> FlowResult<SubFlowCreation> {
        if let Some(existing) = self.instances.sub_flows.get(&owner).cloned() {
            let preloaded = self
                .instances
                .live
                .get_mut(&existing)
                .filter(|instance| !instance.is_started());
            let Some(instance) = preloaded else {
                return Err(FlowError::SubFlowAlreadyExists(owner));
            };
            if preload_only {
                return Ok(SubFlowCreation::AlreadyPreloaded(existing));
            }
            instance.apply_properties(&properties);
            debug!(instance = %existing, node = %owner, "Starting preloaded sub-flow");
            self.start_instance(&existing);
            return Ok(SubFlowCreation::StartedPreloaded(existing));
        }

        if let Some(pending) = self
            .instances
            .pending
            .iter_mut()
            .find(|p| p.owner == owner)
        {
            if preload_only {
                return Ok(SubFlowCreation::Queued);
            }
            if !pending.preload_only {
                return Err(FlowError::SubFlowAlreadyExists(owner));
            }
            pending.preload_only = false;
            pending.properties = properties;
            return Ok(SubFlowCreation::Queued);
        }

        let depth = self.nested_depth(&owner)?;

        if let Some(stale) = self.instances.kept_by_node.remove(&owner) {
            debug!(instance = %stale, node = %owner, "Discarding kept sub-flow replaced by a new one");
            self.instances.kept.remove(&stale);
            self.discard_kept_owned_by(&stale);
        }

        let template = match self.templates.get(asset) {
            Some(template) => Arc::clone(template),
            None if self.settings.synchronous_sub_flow_loading => self.template(asset)?,
            None => {
                debug!(node = %owner, asset, "Queued sub-flow until its template loads");
                self.instances.pending.push_back(PendingSubFlow {
                    owner,
                    asset: asset.to_string(),
                    properties,
                    preload_only,
                });
                return Ok(SubFlowCreation::Queued);
            }
        };

        let id = self.spawn_sub_flow(owner, template, depth, &properties, preload_only);
        Ok(SubFlowCreation::Created(id))
    }

    /// Remove the nested instance owned by a sub-graph node
    ///
    /// Returns the id of the removed instance. A queued creation is cancelled.
    /// Nodes owning nothing are left alone.
    pub fn remove_sub_flow(&mut self, owner: &NodeRef, policy: FinishPolicy) -> Option<String> {
        if let Some(index) = self.instances.pending.iter().position(|p| p.owner == *owner) {
            self.instances.pending.remove(index);
            debug!(node = %owner, "Cancelled queued sub-flow");
            return None;
        }

        let id = self.instances.sub_flows.get(owner).cloned()?;
        debug!(instance = %id, node = %owner, %policy, "Removing sub-flow");
        self.finish_flow(&id, policy);
        Some(id)
    }

    /// Reattach a saved nested instance to a sub-graph node
    ///
    /// The snapshot comes from the kept instances, or from the save game being
    /// loaded. The instance keeps its saved id.
    pub fn reattach_sub_flow(&mut self, owner: NodeRef, saved_instance: &str) -> FlowResult<String> {
        if self.instances.sub_flows.contains_key(&owner)
            || self.instances.pending.iter().any(|p| p.owner == owner)
        {
            return Err(FlowError::SubFlowAlreadyExists(owner));
        }
        if self.instances.live.contains_key(saved_instance) {
            return Err(FlowError::InstanceAlreadyExists(saved_instance.to_string()));
        }
        let depth = self.nested_depth(&owner)?;

        let asset_path = self
            .saved_snapshot(saved_instance)
            .map(|s| s.asset_path.clone())
            .ok_or_else(|| FlowError::SavedInstanceNotFound(saved_instance.to_string()))?;
        let template = self.template(&asset_path)?;
        let save = self
            .take_saved_snapshot(saved_instance)
            .ok_or_else(|| FlowError::SavedInstanceNotFound(saved_instance.to_string()))?;

        let mut instance = self.instantiate(
            saved_instance,
            template,
            InstanceOwner::SubGraph(owner.clone()),
            depth,
        );
        instance.restore(&save);
        self.instances
            .live
            .insert(saved_instance.to_string(), instance);
        self.instances
            .sub_flows
            .insert(owner.clone(), saved_instance.to_string());
        if !save.started {
            if let Some(node) = self
                .instances
                .live
                .get_mut(&owner.instance)
                .and_then(|i| i.node_mut(owner.node))
            {
                node.preloaded = true;
            }
        }

        info!(instance = %saved_instance, node = %owner, "Reattached sub-flow");
        self.run_on_load(saved_instance);
        Ok(saved_instance.to_string())
    }

    /// Load the templates of queued sub-flows and resume their creation
    ///
    /// Each queued creation resumes exactly once. Creations queued while
    /// resuming are processed by the same call. Returns how many resumed.
    pub async fn process_pending_loads(&mut self) -> usize {
        let mut resumed = 0;
        while let Some(pending) = self.instances.pending.pop_front() {
            let template = match self.templates.get(&pending.asset) {
                Some(template) => Ok(Arc::clone(template)),
                None => {
                    let loader = Arc::clone(&self.loader);
                    loader.load(&pending.asset).await
                }
            };

            let template = match template {
                Ok(template) => template,
                Err(e) => {
                    self.fail_pending(&pending, e);
                    continue;
                }
            };
            self.templates
                .insert(pending.asset.clone(), Arc::clone(&template));

            // The owner may have been torn down while loading
            if !self.instances.live.contains_key(&pending.owner.instance) {
                debug!(node = %pending.owner, "Owner gone before its sub-flow loaded");
                continue;
            }
            let depth = match self.nested_depth(&pending.owner) {
                Ok(depth) => depth,
                Err(e) => {
                    self.fail_pending(&pending, e);
                    continue;
                }
            };

            self.spawn_sub_flow(
                pending.owner,
                template,
                depth,
                &pending.properties,
                pending.preload_only,
            );
            resumed += 1;
        }
        resumed
    }

    /// Number of sub-flow creations waiting for a template
    pub fn pending_load_count(&self) -> usize {
        self.instances.pending.len()
    }

    /// Id of the nested instance owned by a sub-graph node
    pub fn sub_flow_instance_id(&self, owner: &NodeRef) -> Option<&str> {
        self.instances.sub_flows.get(owner).map(|s| s.as_str())
    }

    /// Snapshot of an instance finished with `Keep`
    pub fn kept_instance(&self, id: &str) -> Option<&GraphInstanceSave> {
        self.instances.kept.get(id).map(|k| &k.save)
    }

    /// Ids of kept instances, sorted
    pub fn kept_instance_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.instances.kept.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn nested_of(&self, instance_id: &str, node: NodeGuid) -> Option<String> {
        self.instances
            .sub_flows
            .get(&NodeRef::new(instance_id, node))
            .cloned()
    }

    /// Discard snapshots kept by sub-graph nodes of `instance_id`, recursively
    pub(crate) fn discard_kept_owned_by(&mut self, instance_id: &str) {
        let owned: Vec<String> = self
            .instances
            .kept
            .iter()
            .filter(|(_, kept)| {
                matches!(&kept.owner, InstanceOwner::SubGraph(node) if node.instance == instance_id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in owned {
            if let Some(KeptInstance {
                owner: InstanceOwner::SubGraph(node),
                ..
            }) = self.instances.kept.remove(&id)
            {
                self.instances.kept_by_node.remove(&node);
            }
            debug!(instance = %id, owner = %instance_id, "Discarded kept sub-flow");
            self.discard_kept_owned_by(&id);
        }
    }

    fn nested_depth(&self, owner: &NodeRef) -> FlowResult<u32> {
        let parent = self
            .instances
            .live
            .get(&owner.instance)
            .ok_or_else(|| FlowError::InstanceNotFound(owner.instance.clone()))?;
        let depth = parent.depth() + 1;
        let limit = self.settings.max_sub_flow_depth;
        if depth > limit {
            return Err(FlowError::RecursionLimit { depth, limit });
        }
        Ok(depth)
    }

    fn spawn_sub_flow(
        &mut self,
        owner: NodeRef,
        template: Arc<FlowAsset>,
        depth: u32,
        properties: &HashMap<String, String>,
        preload_only: bool,
    ) -> String {
        let id = Self::next_instance_id(&template);
        let mut instance = self.instantiate(
            &id,
            template,
            InstanceOwner::SubGraph(owner.clone()),
            depth,
        );
        instance.apply_properties(properties);
        self.instances.live.insert(id.clone(), instance);
        self.instances.sub_flows.insert(owner.clone(), id.clone());

        if preload_only {
            debug!(instance = %id, node = %owner, "Preloaded sub-flow");
        } else {
            info!(instance = %id, node = %owner, depth, "Starting sub-flow");
            self.start_instance(&id);
        }
        id
    }

    fn fail_pending(&mut self, pending: &PendingSubFlow, error: FlowError) {
        self.log_runtime(
            RuntimeSeverity::Error,
            &pending.owner.instance,
            Some(pending.owner.node),
            error.to_string(),
        );
        if !pending.preload_only {
            self.finish_node(&pending.owner.instance, pending.owner.node);
        }
    }

    fn saved_snapshot(&self, id: &str) -> Option<&GraphInstanceSave> {
        self.instances
            .kept
            .get(id)
            .map(|k| &k.save)
            .or_else(|| self.loading_save.as_ref().and_then(|data| data.instance(id)))
    }

    pub(crate) fn take_saved_snapshot(&mut self, id: &str) -> Option<GraphInstanceSave> {
        if let Some(kept) = self.instances.kept.remove(id) {
            if let InstanceOwner::SubGraph(node) = &kept.owner {
                self.instances.kept_by_node.remove(node);
            }
            return Some(kept.save);
        }
        self.loading_save
            .as_mut()
            .and_then(|data| data.take_instance(id))
    }
}
