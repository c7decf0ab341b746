//! Connection Table
//!
//! Built once per graph instance from its template. Maps each `(node, output
//! pin)` to the input pins it feeds, in the order the connections appear in
//! the template. Duplicate connections are kept as separate entries.

use std::collections::HashMap;

use flow_types::{ConnectedPin, FlowAsset, NodeGuid};
use tracing::warn;

use crate::NodeInstance;

#[derive(Debug, Default, Clone)]
pub struct ConnectionTable {
    outgoing: HashMap<ConnectedPin, Vec<ConnectedPin>>,
    len: usize,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table for a template, skipping connections whose endpoints
    /// do not exist on the instanced nodes
    pub fn build(asset: &FlowAsset, nodes: &HashMap<NodeGuid, NodeInstance>) -> Self {
        let mut table = Self::new();
        for connection in &asset.connections {
            let (Some(source), Some(target)) = (connection.source(), connection.target()) else {
                warn!(
                    asset = %asset.path,
                    from = %connection.from,
                    to = %connection.to,
                    "Malformed connection, skipping"
                );
                continue;
            };

            let source_ok = nodes
                .get(&source.node)
                .is_some_and(|n| n.has_output(&source.pin));
            let target_ok = nodes
                .get(&target.node)
                .is_some_and(|n| n.has_input(&target.pin));
            if !source_ok || !target_ok {
                warn!(
                    asset = %asset.path,
                    from = %source,
                    to = %target,
                    "Connection references a missing node or pin, skipping"
                );
                continue;
            }

            table.add(source, target);
        }
        table
    }

    /// Append a connection after all existing ones from the same pin
    pub fn add(&mut self, source: ConnectedPin, target: ConnectedPin) {
        self.outgoing.entry(source).or_default().push(target);
        self.len += 1;
    }

    /// Input pins fed by an output pin, in connection order
    pub fn targets(&self, node: NodeGuid, pin: &str) -> &[ConnectedPin] {
        self.outgoing
            .get(&ConnectedPin::new(node, pin))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes reachable through any output pin of `node`
    pub fn successors(&self, node: NodeGuid) -> Vec<NodeGuid> {
        let mut found: Vec<NodeGuid> = self
            .outgoing
            .iter()
            .filter(|(source, _)| source.node == node)
            .flat_map(|(_, targets)| targets.iter().map(|t| t.node))
            .collect();
        found.sort();
        found.dedup();
        found
    }

    /// Total number of connections
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
