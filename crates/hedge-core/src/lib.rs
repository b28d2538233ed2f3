//! Hedge Core Library
//!
//! Shared types, collaborator seams, configuration, and the in-process event bus
//! for the hedge coordination engines.

pub mod bus;
pub mod config;
pub mod error;
pub mod store;
pub mod types;
pub mod venue;

pub use error::{Error, Result};
