//! Flow Types - Core type definitions for the Flow node-graph runtime
//!
//! This crate contains the pure data structures shared by the runtime and
//! tooling: pins, node identities, graph templates, connections and the
//! save-game layout.
//!
//! ## Features
//!
//! - `diagnostics` - Pin activation history and validation records (on by default)

mod asset;
mod pin;
mod save;
mod signal;

#[cfg(feature = "diagnostics")]
mod diagnostics;

pub use asset::*;
pub use pin::*;
pub use save::*;
pub use signal::*;

#[cfg(feature = "diagnostics")]
pub use diagnostics::*;
