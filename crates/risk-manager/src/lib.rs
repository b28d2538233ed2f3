//! Risk Manager
//!
//! Trailing-stop monitoring and per-account hedge exposure analysis.

pub mod hedge_analyzer;
pub mod trail;

pub use hedge_analyzer::{
    HedgeAnalysis, HedgeAnalyzer, HedgeSuggestion, SuggestionKind, SuggestionPriority,
    SymbolExposure,
};
pub use trail::{TrailEngine, TrailMonitor, TrailMonitorState, TrailStats, TrailTrigger};
