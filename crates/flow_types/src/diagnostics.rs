// Diagnostics - Pin activation history and design-time validation
//
// Only compiled with the `diagnostics` feature. Nothing here feeds back into
// execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{NodeGuid, PinActivationType};

// ─────────────────────────────────────────────────────────────────────────────
// Pin Records
// ─────────────────────────────────────────────────────────────────────────────

/// One recorded activation of a pin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub time: DateTime<Utc>,
    pub activation_type: PinActivationType,
}

impl PinRecord {
    /// Record an activation happening now
    pub fn now(activation_type: PinActivationType) -> Self {
        Self {
            time: Utc::now(),
            activation_type,
        }
    }

    /// Wall-clock time formatted for display
    pub fn human_readable_time(&self) -> String {
        self.time.format("%H:%M:%S%.3f").to_string()
    }
}

impl fmt::Display for PinRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.activation_type {
            PinActivationType::Default => write!(f, "{}", self.human_readable_time()),
            other => write!(f, "{} ({})", self.human_readable_time(), other),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Severity of a validation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationSeverity {
    Warning,
    Error,
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: ValidationSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeGuid>,
    pub message: String,
}

impl fmt::Display for ValidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            ValidationSeverity::Warning => "warning",
            ValidationSeverity::Error => "error",
        };
        match self.node {
            Some(node) => write!(f, "{}: [{}] {}", level, node, self.message),
            None => write!(f, "{}: {}", level, self.message),
        }
    }
}

/// Collected findings for one template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationLog {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error, optionally tied to a node
    pub fn error(&mut self, node: Option<NodeGuid>, message: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: ValidationSeverity::Error,
            node,
            message: message.into(),
        });
    }

    /// Add a warning, optionally tied to a node
    pub fn warning(&mut self, node: Option<NodeGuid>, message: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: ValidationSeverity::Warning,
            node,
            message: message.into(),
        });
    }

    /// Whether any error was recorded
    pub fn has_errors(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.severity == ValidationSeverity::Error)
    }

    /// Whether the template passed validation
    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    /// Findings tied to a node
    pub fn for_node(&self, node: NodeGuid) -> impl Iterator<Item = &ValidationMessage> {
        self.messages.iter().filter(move |m| m.node == Some(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_log() {
        let node = NodeGuid::new();
        let mut log = ValidationLog::new();
        log.warning(None, "unused custom input");
        assert!(log.is_valid());

        log.error(Some(node), "Event Name is empty!");
        assert!(log.has_errors());
        assert_eq!(log.for_node(node).count(), 1);
        assert!(log.messages[1].to_string().contains("Event Name is empty!"));
    }

    #[test]
    fn test_pin_record_display() {
        let record = PinRecord::now(PinActivationType::Forced);
        assert!(record.to_string().ends_with("(forced)"));
        assert!(!PinRecord::now(PinActivationType::Default)
            .to_string()
            .contains('('));
    }
}
