//! Design-time validation of flow templates
//!
//! Checks a template against a node registry without instancing it: node
//! types and configs, connections, signal modes, and each node's own checks.

use std::collections::{HashMap, HashSet};

use flow_types::{FlowAsset, NodeGuid, ValidationLog};

use crate::nodes::START_NODE;
use crate::{EntryPoint, FlowNode, NodeContext, NodeRegistry};

/// Validate a template's structure against a node registry
pub fn validate_asset(asset: &FlowAsset, registry: &NodeRegistry) -> ValidationLog {
    let mut log = ValidationLog::new();
    let mut nodes: HashMap<NodeGuid, Box<dyn FlowNode>> = HashMap::new();
    let mut seen = HashSet::new();

    for template in &asset.nodes {
        if !seen.insert(template.guid) {
            log.error(Some(template.guid), format!("Duplicate node guid {}", template.guid));
            continue;
        }

        let node = match registry.create(template) {
            Ok(node) => node,
            Err(e) => {
                log.error(Some(template.guid), e.to_string());
                continue;
            }
        };

        if !node.allowed_signal_modes().contains(&template.signal_mode) {
            log.error(
                Some(template.guid),
                format!(
                    "Signal mode {} is not allowed for {}",
                    template.signal_mode, template.node_type
                ),
            );
        }

        let ctx = NodeContext::detached(template.guid, asset);
        node.validate(&ctx, &mut log);
        nodes.insert(template.guid, node);
    }

    for connection in &asset.connections {
        let (Some(source), Some(target)) = (connection.source(), connection.target()) else {
            log.error(
                None,
                format!("Malformed connection {} -> {}", connection.from, connection.to),
            );
            continue;
        };

        match (asset.get_node(source.node), nodes.get(&source.node)) {
            (None, _) => log.error(
                None,
                format!("Connection references unknown source node '{}'", source.node),
            ),
            (Some(_), Some(node)) if !node.output_pins().iter().any(|p| *p == source.pin.as_str()) => {
                log.error(
                    Some(source.node),
                    format!("Connection starts at unknown output pin '{}'", source.pin),
                )
            }
            _ => {}
        }

        match (asset.get_node(target.node), nodes.get(&target.node)) {
            (None, _) => log.error(
                None,
                format!("Connection references unknown target node '{}'", target.node),
            ),
            (Some(_), Some(node)) if !node.input_pins().iter().any(|p| *p == target.pin.as_str()) => {
                log.error(
                    Some(target.node),
                    format!("Connection ends at unknown input pin '{}'", target.pin),
                )
            }
            _ => {}
        }
    }

    let has_start = nodes
        .values()
        .any(|node| node.entry_point() == Some(EntryPoint::Start));
    if !has_start && asset.nodes_of_type(START_NODE).next().is_none() {
        log.warning(None, "Flow has no Start node");
    }

    log
}
