// Node Registry - Stores node factories by type id
//
// The registry holds every node type a template may reference (built-in and
// embedder-provided). Each type has a category and a factory that builds a
// fresh node behavior from a node template's JSON config.

use std::collections::HashMap;
use std::sync::Arc;

use flow_types::NodeTemplate;

use crate::nodes::register_builtin_nodes;
use crate::{FlowError, FlowNode, FlowResult};

// ─────────────────────────────────────────────────────────────────────────────
// Node Factory Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Builds node behaviors from templates
pub trait NodeFactory: Send + Sync {
    /// Create a node from its template, or describe why the config is invalid
    fn create(&self, template: &NodeTemplate) -> Result<Box<dyn FlowNode>, String>;
}

/// Function-based node factory
pub struct FnNodeFactory<F>
where
    F: Fn(&NodeTemplate) -> Result<Box<dyn FlowNode>, String> + Send + Sync,
{
    func: F,
}

impl<F> FnNodeFactory<F>
where
    F: Fn(&NodeTemplate) -> Result<Box<dyn FlowNode>, String> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> NodeFactory for FnNodeFactory<F>
where
    F: Fn(&NodeTemplate) -> Result<Box<dyn FlowNode>, String> + Send + Sync,
{
    fn create(&self, template: &NodeTemplate) -> Result<Box<dyn FlowNode>, String> {
        (self.func)(template)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Entry in the node registry
struct NodeEntry {
    category: String,
    factory: Arc<dyn NodeFactory>,
}

/// Registry of all available node types
pub struct NodeRegistry {
    nodes: HashMap<String, NodeEntry>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in Flow nodes
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_nodes(&mut registry);
        registry
    }

    /// Register a node type with its factory
    pub fn register(&mut self, node_type: &str, category: &str, factory: Arc<dyn NodeFactory>) {
        self.nodes.insert(
            node_type.to_string(),
            NodeEntry {
                category: category.to_string(),
                factory,
            },
        );
    }

    /// Register a node type with a function factory
    pub fn register_fn<F>(&mut self, node_type: &str, category: &str, func: F)
    where
        F: Fn(&NodeTemplate) -> Result<Box<dyn FlowNode>, String> + Send + Sync + 'static,
    {
        self.register(node_type, category, Arc::new(FnNodeFactory::new(func)));
    }

    /// Build the behavior of a templated node
    pub fn create(&self, template: &NodeTemplate) -> FlowResult<Box<dyn FlowNode>> {
        let entry = self
            .nodes
            .get(&template.node_type)
            .ok_or_else(|| FlowError::UnknownNodeType(template.node_type.clone()))?;
        entry
            .factory
            .create(template)
            .map_err(|message| FlowError::InvalidNodeConfig {
                node: template.guid,
                node_type: template.node_type.clone(),
                message,
            })
    }

    /// Get all registered node types, sorted
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.nodes.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Get node types by category
    pub fn nodes_in_category(&self, category: &str) -> Vec<&str> {
        let mut types: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.category == category)
            .map(|(id, _)| id.as_str())
            .collect();
        types.sort_unstable();
        types
    }

    /// Get all categories
    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<_> = self.nodes.values().map(|e| e.category.clone()).collect();
        cats.sort();
        cats.dedup();
        cats
    }

    /// Check if a node type is registered
    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Get node type count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{LOGICAL_OR_NODE, START_NODE, SUB_GRAPH_NODE};
    use crate::nodes::LogicalOrNode;
    use serde_json::json;

    #[test]
    fn test_empty_registry() {
        let registry = NodeRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = NodeRegistry::with_builtins();
        assert!(registry.contains(START_NODE));
        assert!(registry.contains(LOGICAL_OR_NODE));
        assert!(registry.contains(SUB_GRAPH_NODE));
        assert!(registry.categories().contains(&"Route".to_string()));
    }

    #[test]
    fn test_create_from_config() {
        let registry = NodeRegistry::with_builtins();
        let template = NodeTemplate::new(LOGICAL_OR_NODE, json!({ "execution_limit": 3 }));
        let node = registry.create(&template).unwrap();
        let or = node.as_any().downcast_ref::<LogicalOrNode>().unwrap();
        assert_eq!(or.execution_limit(), 3);
    }

    #[test]
    fn test_create_errors() {
        let registry = NodeRegistry::with_builtins();
        let unknown = NodeTemplate::new("Game/Teleport", json!(null));
        assert!(matches!(
            registry.create(&unknown),
            Err(FlowError::UnknownNodeType(t)) if t == "Game/Teleport"
        ));

        let bad = NodeTemplate::new(LOGICAL_OR_NODE, json!({ "execution_limit": "lots" }));
        assert!(matches!(
            registry.create(&bad),
            Err(FlowError::InvalidNodeConfig { .. })
        ));
    }

    #[test]
    fn test_register_custom_node() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("Game/Noop", "Game", |_template| {
            Ok(Box::new(LogicalOrNode::default()))
        });
        assert_eq!(registry.nodes_in_category("Game"), vec!["Game/Noop"]);
        assert!(registry
            .create(&NodeTemplate::new("Game/Noop", json!(null)))
            .is_ok());
    }
}
