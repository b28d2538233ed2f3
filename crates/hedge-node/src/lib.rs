//! Hedge Node
//!
//! Wires the engines of one client process together and owns their
//! lifecycle.

pub mod runtime;

pub use runtime::{Runtime, RuntimeHealth};
