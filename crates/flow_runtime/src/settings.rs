//! Flow Settings
//!
//! Process-wide runtime configuration, read once at startup (`flow.toml`) and
//! shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FlowError, FlowResult};

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// How many hops from the Start node nodes of a given type get preloaded
    pub default_preload_depth: HashMap<String, u32>,

    /// Load sub-flow templates with a blocking call instead of queueing them
    pub synchronous_sub_flow_loading: bool,

    /// Maximum nesting depth of sub-flow instances
    pub max_sub_flow_depth: u32,

    /// Maximum depth of recursive signal propagation
    pub max_propagation_depth: usize,

    /// Capacity of the flow event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            default_preload_depth: HashMap::new(),
            synchronous_sub_flow_loading: false,
            max_sub_flow_depth: 16,
            max_propagation_depth: 256,
            event_channel_capacity: 256,
        }
    }
}

impl FlowSettings {
    /// Parse settings from TOML text
    pub fn from_toml_str(content: &str) -> FlowResult<Self> {
        let settings: FlowSettings =
            toml::from_str(content).map_err(|e| FlowError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let settings = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded flow settings");
        Ok(settings)
    }

    /// Preload depth configured for a node type (0 = never preloaded by type)
    pub fn preload_depth(&self, node_type: &str) -> u32 {
        self.default_preload_depth
            .get(node_type)
            .copied()
            .unwrap_or(0)
    }

    fn validate(&self) -> FlowResult<()> {
        if self.max_propagation_depth == 0 {
            return Err(FlowError::InvalidSettings(
                "max_propagation_depth must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(FlowError::InvalidSettings(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
