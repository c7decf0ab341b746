//! Flow Runtime - Execution engine for flow graphs
//!
//! This crate contains the node registry, the built-in nodes, graph instances,
//! signal propagation and the sub-flow manager that owns nested instances.

pub use flow_types;

mod assets;
mod connections;
mod error;
mod graph;
mod node;
mod propagation;
mod registry;
mod save;
mod settings;
mod subflow;
mod subsystem;

pub mod nodes;

#[cfg(feature = "diagnostics")]
mod validation;

pub use assets::*;
pub use connections::*;
pub use error::*;
pub use graph::*;
pub use node::*;
pub use registry::*;
pub use settings::*;
pub use subflow::*;
pub use subsystem::*;

#[cfg(feature = "diagnostics")]
pub use validation::*;
