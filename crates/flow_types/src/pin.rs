// Pin Types - Connection points on flow nodes
//
// A pin is identified only by its name. Display metadata rides along but never
// takes part in equality, hashing or connection lookup.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::NodeGuid;

// ─────────────────────────────────────────────────────────────────────────────
// Pin
// ─────────────────────────────────────────────────────────────────────────────

/// A named connection point on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    /// Logical name, used during execution and in connections
    pub name: String,
    /// Optional display name, overrides `name` in tooling without touching connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    /// Optional tooltip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
}

impl Pin {
    /// Create a pin with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            friendly_name: None,
            tooltip: None,
        }
    }

    /// Create a pin with a tooltip
    pub fn with_tooltip(name: impl Into<String>, tooltip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            friendly_name: None,
            tooltip: Some(tooltip.into()),
        }
    }

    /// Set the display name
    pub fn friendly(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    /// Create a numbered pin ("0", "1", ...) used by variadic nodes
    pub fn numbered(index: usize) -> Self {
        Self::new(index.to_string())
    }

    /// Whether this pin has a usable name
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    /// Whether this pin belongs to a numbered (variadic) range
    pub fn is_numbered(&self) -> bool {
        is_numbered_pin(&self.name)
    }

    /// Name shown in tooling
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name)
    }
}

/// Check whether a pin name is part of a numbered range
pub fn is_numbered_pin(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_digit())
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Pin {}

impl PartialEq<str> for Pin {
    fn eq(&self, other: &str) -> bool {
        self.name == other
    }
}

impl PartialEq<&str> for Pin {
    fn eq(&self, other: &&str) -> bool {
        self.name == *other
    }
}

impl Hash for Pin {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl From<&str> for Pin {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Pin {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connected Pin
// ─────────────────────────────────────────────────────────────────────────────

/// One end of a connection: a node and one of its pins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectedPin {
    pub node: NodeGuid,
    pub pin: String,
}

impl ConnectedPin {
    pub fn new(node: NodeGuid, pin: impl Into<String>) -> Self {
        Self {
            node,
            pin: pin.into(),
        }
    }
}

impl fmt::Display for ConnectedPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.pin)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Activation Type
// ─────────────────────────────────────────────────────────────────────────────

/// How a pin was activated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinActivationType {
    /// Regular activation, subject to the node's signal gating
    #[default]
    Default,
    /// Fires regardless of the node's gating
    Forced,
    /// Propagates without being recorded in pin history
    PassThrough,
}

impl fmt::Display for PinActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinActivationType::Default => write!(f, "default"),
            PinActivationType::Forced => write!(f, "forced"),
            PinActivationType::PassThrough => write!(f, "pass-through"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_pin_identity_is_name() {
        let a = Pin::with_tooltip("Enable", "Enabling resets Execution Count");
        let b = Pin::new("Enable").friendly("Turn On");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&Pin::new("Disable")));
    }

    #[test]
    fn test_numbered_pins() {
        assert!(Pin::numbered(0).is_numbered());
        assert!(Pin::new("12").is_numbered());
        assert!(!Pin::new("Enable").is_numbered());
        assert!(!Pin::new("").is_numbered());
        assert!(!Pin::new("1a").is_numbered());
    }

    #[test]
    fn test_display_name_falls_back_to_name() {
        assert_eq!(Pin::new("Out").display_name(), "Out");
        assert_eq!(Pin::new("Out").friendly("Done").display_name(), "Done");
    }
}
