// Sub Graph - runs another flow template as a nested instance
//
// The nested instance itself lives in the sub-flow manager's registry. This
// node only requests creation, removal and reattachment through its context,
// and remembers the nested instance id across a save game.

use std::any::Any;
use std::collections::HashMap;

use flow_types::{FinishPolicy, FlowAsset, NodeGuid, Pin, PinActivationType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

#[cfg(feature = "diagnostics")]
use flow_types::ValidationLog;

use crate::{AssetLoader, FlowNode, FlowResult, NodeContext};

pub const START_PIN: &str = "Start";
pub const FINISH_PIN: &str = "Finish";

/// Copies an output property of an upstream node onto a nested input property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBinding {
    pub output_node: NodeGuid,
    pub output_property: String,
    pub input_property: String,
}

/// Template configuration of a Sub Graph node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubGraphConfig {
    /// Path of the nested template
    pub asset: Option<String>,
    /// Allow instancing the same template that owns this node
    pub can_instance_identical_asset: bool,
    /// Custom inputs of the nested template, exposed as input pins
    pub context_inputs: Vec<String>,
    /// Custom outputs of the nested template, exposed as output pins
    pub context_outputs: Vec<String>,
    pub property_bindings: Vec<PropertyBinding>,
}

pub struct SubGraphNode {
    asset: Option<String>,
    can_instance_identical_asset: bool,
    property_bindings: Vec<PropertyBinding>,
    properties_to_set: HashMap<String, String>,
    saved_instance_name: String,
    inputs: Vec<Pin>,
    outputs: Vec<Pin>,
}

impl SubGraphNode {
    pub fn new(config: SubGraphConfig) -> Self {
        let mut node = Self {
            asset: config.asset.filter(|a| !a.is_empty()),
            can_instance_identical_asset: config.can_instance_identical_asset,
            property_bindings: config.property_bindings,
            properties_to_set: HashMap::new(),
            saved_instance_name: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        node.set_context_pins(&config.context_inputs, &config.context_outputs);
        node
    }

    pub fn asset(&self) -> Option<&str> {
        self.asset.as_deref()
    }

    /// Nested instance id restored from a save game and not yet reattached
    pub fn saved_instance_name(&self) -> &str {
        &self.saved_instance_name
    }

    /// Values staged for the nested instance's input properties
    pub fn properties_to_set(&self) -> &HashMap<String, String> {
        &self.properties_to_set
    }

    /// Whether the bound template may be instanced from a graph of `owner_asset`
    pub fn can_instance(&self, owner_asset: &str) -> bool {
        match &self.asset {
            None => false,
            Some(asset) => self.can_instance_identical_asset || asset != owner_asset,
        }
    }

    /// Custom input names of the nested template, read with a blocking load
    pub fn context_inputs(&self, loader: &dyn AssetLoader) -> FlowResult<Vec<String>> {
        Ok(self
            .nested_template(loader)?
            .map(|asset| non_empty(&asset.custom_inputs))
            .unwrap_or_default())
    }

    /// Custom output names of the nested template, read with a blocking load
    pub fn context_outputs(&self, loader: &dyn AssetLoader) -> FlowResult<Vec<String>> {
        Ok(self
            .nested_template(loader)?
            .map(|asset| non_empty(&asset.custom_outputs))
            .unwrap_or_default())
    }

    /// Rebuild the pins from the nested template's custom events
    pub fn refresh_context_pins(&mut self, loader: &dyn AssetLoader) -> FlowResult<()> {
        let inputs = self.context_inputs(loader)?;
        let outputs = self.context_outputs(loader)?;
        self.set_context_pins(&inputs, &outputs);
        Ok(())
    }

    fn nested_template(
        &self,
        loader: &dyn AssetLoader,
    ) -> FlowResult<Option<std::sync::Arc<FlowAsset>>> {
        self.asset
            .as_deref()
            .map(|path| loader.load_sync(path))
            .transpose()
    }

    fn set_context_pins(&mut self, inputs: &[String], outputs: &[String]) {
        self.inputs = std::iter::once(START_PIN)
            .chain(inputs.iter().map(String::as_str))
            .filter(|name| !name.is_empty())
            .map(Pin::new)
            .collect();
        self.outputs = std::iter::once(FINISH_PIN)
            .chain(outputs.iter().map(String::as_str))
            .filter(|name| !name.is_empty())
            .map(Pin::new)
            .collect();
    }

    /// Snapshot bound output properties of already finished nodes
    fn set_properties(&mut self, ctx: &NodeContext<'_>) {
        self.properties_to_set.clear();
        for binding in &self.property_bindings {
            let Some(value) = ctx.finished_node_property(binding.output_node, &binding.output_property)
            else {
                warn!(
                    instance = %ctx.instance_id(),
                    node = %ctx.node_guid(),
                    source = %binding.output_node,
                    property = %binding.output_property,
                    "Property source unavailable, skipping"
                );
                continue;
            };
            match serde_json::to_string(&value) {
                Ok(text) => {
                    self.properties_to_set
                        .insert(binding.input_property.clone(), text);
                }
                Err(e) => warn!(property = %binding.output_property, "Failed to export property: {}", e),
            }
        }
    }
}

fn non_empty(names: &[String]) -> Vec<String> {
    names.iter().filter(|n| !n.is_empty()).cloned().collect()
}

impl FlowNode for SubGraphNode {
    fn input_pins(&self) -> &[Pin] {
        &self.inputs
    }

    fn output_pins(&self) -> &[Pin] {
        &self.outputs
    }

    fn execute_input(&mut self, ctx: &mut NodeContext<'_>, pin: &str) {
        if !self.can_instance(ctx.asset_path()) {
            match &self.asset {
                None => ctx.log_error("Missing Flow Asset"),
                Some(asset) => ctx.log_error(format!(
                    "Asset {} cannot be instanced, probably is the same as the asset owning this SubGraph node.",
                    asset
                )),
            }
            ctx.finish();
            return;
        }

        if pin == START_PIN {
            self.set_properties(ctx);
            if let Some(asset) = &self.asset {
                ctx.create_sub_flow(asset.clone(), self.properties_to_set.clone(), false);
            }
        } else if !pin.is_empty() {
            ctx.trigger_custom_event(pin);
        }
    }

    fn cleanup(&mut self, ctx: &mut NodeContext<'_>) {
        if self.can_instance(ctx.asset_path()) {
            ctx.remove_sub_flow(FinishPolicy::Keep);
        }
    }

    fn force_finish(&mut self, ctx: &mut NodeContext<'_>) {
        ctx.remove_sub_flow(FinishPolicy::Abort);
        ctx.trigger_output(FINISH_PIN, PinActivationType::Forced);
        ctx.finish();
    }

    fn preload_content(&mut self, ctx: &mut NodeContext<'_>) {
        if self.can_instance(ctx.asset_path()) {
            if let Some(asset) = &self.asset {
                ctx.create_sub_flow(asset.clone(), HashMap::new(), true);
            }
        }
    }

    fn flush_content(&mut self, ctx: &mut NodeContext<'_>) {
        if self.can_instance(ctx.asset_path()) {
            ctx.remove_sub_flow(FinishPolicy::Abort);
        }
    }

    fn on_load(&mut self, ctx: &mut NodeContext<'_>) {
        if !self.saved_instance_name.is_empty() && self.asset.is_some() {
            ctx.reattach_sub_flow(std::mem::take(&mut self.saved_instance_name));
        }
    }

    fn save_state(&self, ctx: &NodeContext<'_>) -> Value {
        json!({ "saved_instance_name": ctx.nested_instance().unwrap_or_default() })
    }

    fn load_state(&mut self, data: &Value) -> Result<(), serde_json::Error> {
        #[derive(Deserialize)]
        struct Saved {
            #[serde(default)]
            saved_instance_name: String,
        }

        if data.is_null() {
            return Ok(());
        }
        self.saved_instance_name = Saved::deserialize(data)?.saved_instance_name;
        Ok(())
    }

    fn description(&self) -> String {
        self.asset
            .as_deref()
            .map(|a| flow_types::asset_name(a).to_string())
            .unwrap_or_default()
    }

    #[cfg(feature = "diagnostics")]
    fn validate(&self, ctx: &NodeContext<'_>, log: &mut ValidationLog) {
        let node = Some(ctx.node_guid());
        match &self.asset {
            None => log.error(node, "Missing Flow Asset"),
            Some(asset) if !self.can_instance(ctx.asset_path()) => log.error(
                node,
                format!(
                    "Asset {} is the asset owning this SubGraph node and identical instancing is off",
                    asset
                ),
            ),
            Some(_) => {}
        }
        for binding in &self.property_bindings {
            if ctx.asset().get_node(binding.output_node).is_none() {
                log.error(
                    node,
                    format!(
                        "Property binding '{}' reads from unknown node {}",
                        binding.input_property, binding.output_node
                    ),
                );
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
