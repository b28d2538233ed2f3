//! Hedge System: multi-account position lifecycle and action coordination
//!
//! This is the root crate that provides benchmark and integration-test access
//! to the member crates. For actual functionality, use the individual crates
//! directly:
//!
//! - `hedge-core`: Domain types, errors, configuration, event bus, store and venue seams
//! - `risk-manager`: Trailing stops, hedge analysis
//! - `trading-engine`: Position coordination, action sync, conflict resolution, hedge orchestration
//! - `hedge-node`: Composition root and client binary

pub use hedge_core as core;
pub use hedge_node as node;
pub use risk_manager as risk;
pub use trading_engine as trading;
