// Signal and lifecycle enums shared by templates, instances and save data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Designer-set mode deciding what happens when a node receives a signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMode {
    /// Input activations run the node's handler
    #[default]
    Enabled,
    /// Input activations are dropped
    Disabled,
    /// The handler is skipped and the first output fires as pass-through
    PassThrough,
}

impl SignalMode {
    /// Every mode, the default capability set of a node
    pub const ALL: &'static [SignalMode] = &[
        SignalMode::Enabled,
        SignalMode::Disabled,
        SignalMode::PassThrough,
    ];
}

impl fmt::Display for SignalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalMode::Enabled => write!(f, "enabled"),
            SignalMode::Disabled => write!(f, "disabled"),
            SignalMode::PassThrough => write!(f, "pass-through"),
        }
    }
}

/// What happens to a graph instance's state when it stops executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishPolicy {
    /// Discard state immediately
    Abort,
    /// Detach from execution but keep a snapshot for a later save or reattach
    Keep,
}

impl fmt::Display for FinishPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishPolicy::Abort => write!(f, "abort"),
            FinishPolicy::Keep => write!(f, "keep"),
        }
    }
}

/// Lifecycle state of a node instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeActivationState {
    #[default]
    NeverActivated,
    Active,
    Completed,
    Aborted,
}

impl NodeActivationState {
    /// Whether the node reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            NodeActivationState::Completed | NodeActivationState::Aborted
        )
    }
}
