//! Save and load of flow execution state
//!
//! A save game holds every live instance and every instance kept by a `Keep`
//! teardown. Loading restores root flows; nested instances are reattached by
//! their sub-graph nodes' `on_load` and keep their saved ids.

use flow_types::{FlowSaveData, GraphInstanceSave, RootFlowSave};
use tracing::{info, warn};

use crate::{FlowError, FlowResult, FlowSubsystem, InstanceOwner, NodeRef, RuntimeSeverity};

impl FlowSubsystem {
    /// Snapshot all live and kept instances
    pub fn save_game(&mut self) -> FlowSaveData {
        let mut root_flows: Vec<RootFlowSave> = self
            .root_flows
            .iter()
            .map(|((owner, asset_path), id)| RootFlowSave {
                owner: owner.clone(),
                asset_path: asset_path.clone(),
                instance_id: id.clone(),
            })
            .collect();
        root_flows.extend(self.instances.kept.iter().filter_map(|(id, kept)| {
            match &kept.owner {
                InstanceOwner::Root { owner } => Some(RootFlowSave {
                    owner: owner.clone(),
                    asset_path: kept.save.asset_path.clone(),
                    instance_id: id.clone(),
                }),
                InstanceOwner::SubGraph(_) => None,
            }
        }));
        root_flows.sort_by(|a, b| {
            (&a.owner, &a.asset_path, &a.instance_id).cmp(&(&b.owner, &b.asset_path, &b.instance_id))
        });

        let mut ids: Vec<String> = self.instances.live.keys().cloned().collect();
        ids.sort_unstable();
        let mut instances: Vec<GraphInstanceSave> = Vec::with_capacity(ids.len());
        for id in &ids {
            let sub_flows = &self.instances.sub_flows;
            if let Some(instance) = self.instances.live.get_mut(id) {
                instances.push(
                    instance.save(|guid| sub_flows.get(&NodeRef::new(id.as_str(), guid)).cloned()),
                );
            }
        }

        let mut kept: Vec<GraphInstanceSave> =
            self.instances.kept.values().map(|k| k.save.clone()).collect();
        kept.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances.extend(kept);

        info!(
            roots = root_flows.len(),
            instances = instances.len(),
            "Saved flow state"
        );
        FlowSaveData {
            root_flows,
            instances,
        }
    }

    /// Restore every root flow of a save game
    ///
    /// Roots that fail to restore are reported in the runtime log. Returns the
    /// ids of the restored roots.
    pub fn load_game(&mut self, data: FlowSaveData) -> Vec<String> {
        let roots = data.root_flows.clone();
        self.loading_save = Some(data);

        let mut restored = Vec::with_capacity(roots.len());
        for root in &roots {
            match self.load_root_flow(root) {
                Ok(id) => restored.push(id),
                Err(e) => {
                    self.log_runtime(RuntimeSeverity::Error, &root.instance_id, None, e.to_string())
                }
            }
        }

        if let Some(left) = self.loading_save.take() {
            if !left.instances.is_empty() {
                warn!(
                    count = left.instances.len(),
                    "Saved instances were not reattached by any sub-graph node"
                );
            }
        }
        info!(restored = restored.len(), "Loaded flow state");
        restored
    }

    /// Restore one root flow under its saved id
    pub fn load_root_flow(&mut self, root: &RootFlowSave) -> FlowResult<String> {
        let key = (root.owner.clone(), root.asset_path.clone());
        if self.root_flows.contains_key(&key) {
            return Err(FlowError::RootFlowAlreadyExists {
                owner: root.owner.clone(),
                asset: root.asset_path.clone(),
            });
        }
        if self.instances.live.contains_key(&root.instance_id) {
            return Err(FlowError::InstanceAlreadyExists(root.instance_id.clone()));
        }

        let template = self.template(&root.asset_path)?;
        let save = self
            .take_saved_snapshot(&root.instance_id)
            .ok_or_else(|| FlowError::SavedInstanceNotFound(root.instance_id.clone()))?;

        let mut instance = self.instantiate(
            &root.instance_id,
            template,
            InstanceOwner::Root {
                owner: root.owner.clone(),
            },
            0,
        );
        instance.restore(&save);
        self.instances
            .live
            .insert(root.instance_id.clone(), instance);
        self.root_flows.insert(key, root.instance_id.clone());

        info!(instance = %root.instance_id, owner = %root.owner, asset = %root.asset_path, "Restored root flow");
        self.run_on_load(&root.instance_id);
        Ok(root.instance_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flow_types::{FinishPolicy, FlowAsset, NodeTemplate};
    use serde_json::json;

    use super::*;
    use crate::nodes::{
        LogicalOrNode, SubGraphNode, LOGICAL_OR_NODE, OUT_PIN, START_NODE, START_PIN,
        SUB_GRAPH_NODE,
    };
    use crate::{AssetLoader, FlowSettings, InMemoryAssetLoader, NodeRegistry};

    fn loader() -> Arc<InMemoryAssetLoader> {
        let loader = InMemoryAssetLoader::new();

        let mut side = FlowAsset::new("quests/side");
        let start = side.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let gate = side.add_node(NodeTemplate::new(LOGICAL_OR_NODE, json!({ "execution_limit": 3 })));
        side.connect(start, OUT_PIN, gate, "0");
        loader.insert(side);

        Arc::new(loader)
    }

    fn main_asset() -> (FlowAsset, flow_types::NodeGuid) {
        let mut asset = FlowAsset::new("quests/main");
        let start = asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let sub = asset.add_node(NodeTemplate::new(SUB_GRAPH_NODE, json!({ "asset": "quests/side" })));
        asset.connect(start, OUT_PIN, sub, START_PIN);
        (asset, sub)
    }

    /// Main flow whose sub-graph node is preloaded but not wired to Start
    fn preloaded_main_asset() -> (FlowAsset, flow_types::NodeGuid) {
        let mut asset = FlowAsset::new("quests/main");
        asset.add_node(NodeTemplate::new(START_NODE, json!(null)));
        let sub = asset.add_node(
            NodeTemplate::new(SUB_GRAPH_NODE, json!({ "asset": "quests/side" })).preloaded(),
        );
        (asset, sub)
    }

    fn subsystem(loader: &Arc<InMemoryAssetLoader>) -> FlowSubsystem {
        FlowSubsystem::new(
            Arc::new(FlowSettings {
                synchronous_sub_flow_loading: true,
                ..Default::default()
            }),
            Arc::new(NodeRegistry::with_builtins()),
            Arc::clone(loader) as Arc<dyn AssetLoader>,
        )
    }

    fn nested_gate_count(flows: &FlowSubsystem, nested: &str) -> Option<u32> {
        let instance = flows.instance(nested)?;
        instance
            .nodes()
            .find_map(|n| n.downcast_ref::<LogicalOrNode>())
            .map(|or| or.execution_count())
    }

    #[test]
    fn test_kept_flow_reattaches_in_fresh_subsystem() {
        let loader = loader();
        let (asset, sub) = main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let root = flows.start_root_flow("player", "quests/main").unwrap();
        let nested = flows
            .sub_flow_instance_id(&NodeRef::new(&root, sub))
            .map(str::to_string)
            .unwrap();
        assert_eq!(nested_gate_count(&flows, &nested), Some(1));

        flows
            .finish_root_flow("player", "quests/main", FinishPolicy::Keep)
            .unwrap();
        assert!(flows.instance_ids().is_empty());
        let save = flows.save_game();
        assert_eq!(save.root_flows.len(), 1);
        assert_eq!(save.root_flows[0].instance_id, root);
        assert!(save.instance(&nested).is_some());

        let mut restored = subsystem(&loader);
        assert_eq!(restored.load_game(save), vec![root.clone()]);

        assert_eq!(restored.root_instance_id("player", "quests/main"), Some(root.as_str()));
        assert_eq!(
            restored.sub_flow_instance_id(&NodeRef::new(&root, sub)),
            Some(nested.as_str())
        );
        assert_eq!(nested_gate_count(&restored, &nested), Some(1));
        let instance = restored.instance(&root).unwrap();
        assert!(instance.is_active(sub));
        let node = instance.node(sub).and_then(|n| n.downcast_ref::<SubGraphNode>()).unwrap();
        assert_eq!(node.saved_instance_name(), "");
        assert!(restored.runtime_log().is_empty());
    }

    #[test]
    fn test_kept_flow_reattaches_in_same_subsystem() {
        let loader = loader();
        let (asset, sub) = main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let root = flows.start_root_flow("player", "quests/main").unwrap();
        let nested = flows
            .sub_flow_instance_id(&NodeRef::new(&root, sub))
            .map(str::to_string)
            .unwrap();
        flows
            .finish_root_flow("player", "quests/main", FinishPolicy::Keep)
            .unwrap();
        assert_eq!(flows.kept_instance_ids().len(), 2);

        let save = flows.save_game();
        assert_eq!(flows.load_game(save), vec![root.clone()]);

        assert!(flows.kept_instance_ids().is_empty());
        assert_eq!(flows.instance_ids().len(), 2);
        assert_eq!(
            flows.sub_flow_instance_id(&NodeRef::new(&root, sub)),
            Some(nested.as_str())
        );
        assert_eq!(
            flows.instance(&nested).map(|i| i.owner().clone()),
            Some(InstanceOwner::SubGraph(NodeRef::new(&root, sub)))
        );
    }

    #[test]
    fn test_live_flows_round_trip_through_json() {
        let loader = loader();
        let (asset, sub) = main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let root = flows.start_root_flow("player", "quests/main").unwrap();
        let nested = flows
            .sub_flow_instance_id(&NodeRef::new(&root, sub))
            .map(str::to_string)
            .unwrap();
        let save = flows.save_game();
        assert_eq!(save.instances.len(), 2);

        let text = serde_json::to_string_pretty(&save).unwrap();
        let parsed: FlowSaveData = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, save);

        // Already running here
        assert!(flows.load_game(parsed.clone()).is_empty());
        assert_eq!(flows.runtime_log().len(), 1);

        let mut restored = subsystem(&loader);
        assert_eq!(restored.load_game(parsed), vec![root.clone()]);
        assert_eq!(
            restored.sub_flow_instance_id(&NodeRef::new(&root, sub)),
            Some(nested.as_str())
        );

        // Restored flows keep running
        let gate = restored
            .instance(&nested)
            .and_then(|i| i.nodes().find(|n| n.downcast_ref::<LogicalOrNode>().is_some()))
            .map(|n| n.guid())
            .unwrap();
        restored.trigger_input(&nested, gate, "0").unwrap();
        assert_eq!(nested_gate_count(&restored, &nested), Some(2));
    }

    #[test]
    fn test_preloaded_sub_flow_starts_after_load() {
        let loader = loader();
        let (asset, sub) = preloaded_main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let root = flows.start_root_flow("player", "quests/main").unwrap();
        let owner = NodeRef::new(&root, sub);
        let nested = flows.sub_flow_instance_id(&owner).map(str::to_string).unwrap();
        assert_eq!(nested_gate_count(&flows, &nested), Some(0));

        let save = flows.save_game();
        assert!(save.instance(&root).unwrap().started);
        assert!(!save.instance(&nested).unwrap().started);

        let mut restored = subsystem(&loader);
        assert_eq!(restored.load_game(save.clone()), vec![root.clone()]);
        assert_eq!(restored.sub_flow_instance_id(&owner), Some(nested.as_str()));
        assert!(!restored.instance(&nested).unwrap().is_started());

        restored.trigger_input(&root, sub, START_PIN).unwrap();
        assert!(restored.instance(&nested).unwrap().is_started());
        assert_eq!(nested_gate_count(&restored, &nested), Some(1));
        assert!(restored.runtime_log().is_empty());

        // A restored preload that was never used is still flushed at teardown
        let mut unused = subsystem(&loader);
        unused.load_game(save);
        unused
            .finish_root_flow("player", "quests/main", FinishPolicy::Keep)
            .unwrap();
        assert_eq!(unused.kept_instance_ids(), vec![root.as_str()]);
    }

    #[test]
    fn test_keep_teardown_drops_unreached_preload_from_save() {
        let loader = loader();
        let (asset, sub) = preloaded_main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let root = flows.start_root_flow("player", "quests/main").unwrap();
        let owner = NodeRef::new(&root, sub);
        let nested = flows.sub_flow_instance_id(&owner).map(str::to_string).unwrap();
        flows
            .finish_root_flow("player", "quests/main", FinishPolicy::Keep)
            .unwrap();

        let save = flows.save_game();
        assert_eq!(save.instances.len(), 1);
        assert!(save.instance(&nested).is_none());
        let saved_sub = save.instance(&root).and_then(|i| i.node(sub)).unwrap();
        assert_eq!(saved_sub.data, json!({ "saved_instance_name": "" }));

        let mut restored = subsystem(&loader);
        assert_eq!(restored.load_game(save), vec![root.clone()]);
        assert!(restored.runtime_log().is_empty());
        assert!(restored.sub_flow_instance_id(&owner).is_none());

        restored.trigger_input(&root, sub, START_PIN).unwrap();
        let started = restored.sub_flow_instance_id(&owner).map(str::to_string).unwrap();
        assert_ne!(started, nested);
        assert_eq!(nested_gate_count(&restored, &started), Some(1));
    }

    #[test]
    fn test_load_reports_missing_snapshots() {
        let loader = loader();
        let (asset, _) = main_asset();
        loader.insert(asset);

        let mut flows = subsystem(&loader);
        let data = FlowSaveData {
            root_flows: vec![RootFlowSave {
                owner: "player".to_string(),
                asset_path: "quests/main".to_string(),
                instance_id: "main_gone".to_string(),
            }],
            instances: Vec::new(),
        };

        assert!(flows.load_game(data).is_empty());
        assert!(flows.instance_ids().is_empty());
        let log = flows.runtime_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].instance, "main_gone");
        assert!(matches!(
            flows.load_root_flow(&RootFlowSave {
                owner: "player".to_string(),
                asset_path: "quests/missing".to_string(),
                instance_id: "missing_1".to_string(),
            }),
            Err(FlowError::AssetNotFound(_))
        ));
    }
}
