//! Per-account net exposure and hedge ratio analysis.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hedge_core::config::HedgeConfig;
use hedge_core::store::PositionSnapshots;
use hedge_core::types::{Direction, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Aggregated open volume of one symbol on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolExposure {
    pub symbol: String,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// `buy_volume - sell_volume`.
    pub net_volume: Decimal,
    pub position_count: usize,
}

impl SymbolExposure {
    pub fn gross_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    /// Volume that offsets itself on both sides.
    pub fn offsetting_volume(&self) -> Decimal {
        self.buy_volume.min(self.sell_volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionKind {
    /// Open an opposite-direction order sized to the net exposure.
    CreateHedge,
    /// Close part of a symmetric buy/sell excess.
    ReduceExcess,
}

/// Declaration order is sort order: HIGH first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeSuggestion {
    pub kind: SuggestionKind,
    pub symbol: String,
    /// Order direction for `CreateHedge`; excess reduction closes both sides.
    pub direction: Option<Direction>,
    pub volume: Decimal,
    pub priority: SuggestionPriority,
    pub reason: String,
}

/// Snapshot of one account's exposure. Derived, never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeAnalysis {
    pub account_id: String,
    pub exposures: Vec<SymbolExposure>,
    /// Sum of absolute per-symbol net volume.
    pub total_net_exposure: Decimal,
    pub gross_volume: Decimal,
    /// `1 - total_net_exposure / gross_volume`, 1 when nothing is open.
    pub hedge_ratio: Decimal,
    pub is_fully_hedged: bool,
    pub suggestions: Vec<HedgeSuggestion>,
    pub position_count: usize,
    pub analyzed_at: DateTime<Utc>,
}

impl HedgeAnalysis {
    pub fn exposure(&self, symbol: &str) -> Option<&SymbolExposure> {
        self.exposures.iter().find(|e| e.symbol == symbol)
    }
}

/// Compute the hedge analysis of `account_id` from a set of positions.
///
/// Only open positions on the account are counted.
pub fn analyze_positions(
    account_id: &str,
    positions: &[Position],
    config: &HedgeConfig,
) -> HedgeAnalysis {
    let mut by_symbol: BTreeMap<&str, SymbolExposure> = BTreeMap::new();
    let mut position_count = 0;

    for position in positions
        .iter()
        .filter(|p| p.account_id == account_id && p.is_open())
    {
        position_count += 1;
        let exposure = by_symbol
            .entry(position.symbol.as_str())
            .or_insert_with(|| SymbolExposure {
                symbol: position.symbol.clone(),
                buy_volume: Decimal::ZERO,
                sell_volume: Decimal::ZERO,
                net_volume: Decimal::ZERO,
                position_count: 0,
            });
        match position.direction {
            Direction::Buy => exposure.buy_volume += position.volume,
            Direction::Sell => exposure.sell_volume += position.volume,
        }
        exposure.net_volume = exposure.buy_volume - exposure.sell_volume;
        exposure.position_count += 1;
    }

    let exposures: Vec<SymbolExposure> = by_symbol.into_values().collect();
    let gross_volume: Decimal = exposures.iter().map(|e| e.gross_volume()).sum();
    let total_net_exposure: Decimal = exposures.iter().map(|e| e.net_volume.abs()).sum();

    let hedge_ratio = if gross_volume.is_zero() {
        Decimal::ONE
    } else {
        Decimal::ONE - total_net_exposure / gross_volume
    };

    let mut suggestions = Vec::new();
    if hedge_ratio < config.rebalance_threshold {
        for exposure in exposures.iter().filter(|e| !e.net_volume.is_zero()) {
            let net = exposure.net_volume.abs();
            let direction = if exposure.net_volume > Decimal::ZERO {
                Direction::Sell
            } else {
                Direction::Buy
            };
            let priority = if net > config.high_priority_net_lots {
                SuggestionPriority::High
            } else {
                SuggestionPriority::Medium
            };
            suggestions.push(HedgeSuggestion {
                kind: SuggestionKind::CreateHedge,
                symbol: exposure.symbol.clone(),
                direction: Some(direction),
                volume: net,
                priority,
                reason: format!(
                    "{} net exposure {} lots, hedge ratio {}",
                    exposure.symbol,
                    exposure.net_volume,
                    hedge_ratio.round_dp(3)
                ),
            });
        }
    }
    for exposure in exposures
        .iter()
        .filter(|e| e.offsetting_volume() > config.excess_cleanup_lots)
    {
        let excess = exposure.offsetting_volume();
        suggestions.push(HedgeSuggestion {
            kind: SuggestionKind::ReduceExcess,
            symbol: exposure.symbol.clone(),
            direction: None,
            volume: excess / Decimal::TWO,
            priority: SuggestionPriority::Low,
            reason: format!(
                "{} holds {} lots on both sides",
                exposure.symbol, excess
            ),
        });
    }
    suggestions.sort_by_key(|s| s.priority);

    HedgeAnalysis {
        account_id: account_id.to_string(),
        exposures,
        total_net_exposure,
        gross_volume,
        hedge_ratio,
        is_fully_hedged: hedge_ratio > config.fully_hedged_threshold,
        suggestions,
        position_count,
        analyzed_at: Utc::now(),
    }
}

/// Periodic hedge analysis over the coordinator's position snapshot.
pub struct HedgeAnalyzer {
    snapshots: Arc<dyn PositionSnapshots>,
    config: HedgeConfig,
    latest: DashMap<String, HedgeAnalysis>,
}

impl HedgeAnalyzer {
    pub fn new(snapshots: Arc<dyn PositionSnapshots>, config: HedgeConfig) -> Self {
        Self {
            snapshots,
            config,
            latest: DashMap::new(),
        }
    }

    pub fn analyze_account(&self, account_id: &str) -> HedgeAnalysis {
        let positions = self.snapshots.positions();
        self.analyze_and_store(account_id, &positions)
    }

    fn analyze_and_store(&self, account_id: &str, positions: &[Position]) -> HedgeAnalysis {
        let analysis = analyze_positions(account_id, positions, &self.config);

        if analysis.hedge_ratio < self.config.rebalance_threshold {
            warn!(
                account_id = %account_id,
                hedge_ratio = %analysis.hedge_ratio.round_dp(4),
                net_exposure = %analysis.total_net_exposure,
                suggestions = analysis.suggestions.len(),
                "Account below rebalance threshold"
            );
        } else {
            debug!(
                account_id = %account_id,
                hedge_ratio = %analysis.hedge_ratio.round_dp(4),
                fully_hedged = analysis.is_fully_hedged,
                "Hedge analysis updated"
            );
        }

        self.latest
            .insert(account_id.to_string(), analysis.clone());
        analysis
    }

    /// Recompute every account with open positions, plus every account
    /// analysed before.
    pub fn refresh_all(&self) -> Vec<HedgeAnalysis> {
        let positions = self.snapshots.positions();
        let mut accounts: BTreeSet<String> = positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.account_id.clone())
            .collect();
        accounts.extend(self.latest.iter().map(|e| e.key().clone()));

        let analyses: Vec<HedgeAnalysis> = accounts
            .iter()
            .map(|account| self.analyze_and_store(account, &positions))
            .collect();
        info!(accounts = analyses.len(), "Hedge analysis refreshed");
        analyses
    }

    pub fn get_latest_analysis(&self, account_id: &str) -> Option<HedgeAnalysis> {
        self.latest.get(account_id).map(|a| a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedge_core::types::PositionStatus;
    use std::sync::Mutex;

    fn open(account: &str, symbol: &str, direction: Direction, volume: &str) -> Position {
        let mut position = Position::pending(
            account,
            symbol,
            direction,
            volume.parse().unwrap(),
            "client-a",
        );
        position.transition(PositionStatus::Opening, None).unwrap();
        position.transition(PositionStatus::Open, None).unwrap();
        position
    }

    struct FixedSnapshots(Mutex<Vec<Position>>);

    impl PositionSnapshots for FixedSnapshots {
        fn positions(&self) -> Vec<Position> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_partial_hedge() {
        let positions = vec![
            open("acc-1", "EURUSD", Direction::Buy, "1.0"),
            open("acc-1", "EURUSD", Direction::Sell, "0.4"),
        ];
        let analysis = analyze_positions("acc-1", &positions, &HedgeConfig::default());

        let eurusd = analysis.exposure("EURUSD").unwrap();
        assert_eq!(eurusd.net_volume, Decimal::new(6, 1));
        assert_eq!(analysis.hedge_ratio.round_dp(3), Decimal::new(571, 3));
        assert!(!analysis.is_fully_hedged);

        assert_eq!(analysis.suggestions.len(), 1);
        let suggestion = &analysis.suggestions[0];
        assert_eq!(suggestion.kind, SuggestionKind::CreateHedge);
        assert_eq!(suggestion.direction, Some(Direction::Sell));
        assert_eq!(suggestion.volume, Decimal::new(6, 1));
        assert_eq!(suggestion.symbol, "EURUSD");
        assert_eq!(suggestion.priority, SuggestionPriority::Medium);
    }

    #[test]
    fn test_empty_account_is_fully_hedged() {
        let analysis = analyze_positions("acc-1", &[], &HedgeConfig::default());
        assert_eq!(analysis.hedge_ratio, Decimal::ONE);
        assert!(analysis.is_fully_hedged);
        assert!(analysis.suggestions.is_empty());
    }

    #[test]
    fn test_ignores_other_accounts_and_closed_positions() {
        let mut closed = open("acc-1", "EURUSD", Direction::Buy, "5");
        closed.transition(PositionStatus::Closing, None).unwrap();
        closed.transition(PositionStatus::Closed, None).unwrap();
        let positions = vec![
            closed,
            open("acc-2", "EURUSD", Direction::Buy, "3"),
            open("acc-1", "GBPUSD", Direction::Sell, "1"),
            open("acc-1", "GBPUSD", Direction::Buy, "1"),
        ];
        let analysis = analyze_positions("acc-1", &positions, &HedgeConfig::default());
        assert_eq!(analysis.position_count, 2);
        assert_eq!(analysis.hedge_ratio, Decimal::ONE);
        assert!(analysis.is_fully_hedged);
    }

    #[test]
    fn test_priority_ordering_and_excess() {
        let positions = vec![
            open("acc-1", "USDJPY", Direction::Sell, "2.5"),
            open("acc-1", "EURUSD", Direction::Buy, "0.5"),
            open("acc-1", "XAUUSD", Direction::Buy, "3"),
            open("acc-1", "XAUUSD", Direction::Sell, "3"),
        ];
        let analysis = analyze_positions("acc-1", &positions, &HedgeConfig::default());
        // gross 9, net 3 -> ratio 0.667
        assert!(analysis.hedge_ratio < Decimal::new(8, 1));

        let kinds: Vec<_> = analysis
            .suggestions
            .iter()
            .map(|s| (s.priority, s.symbol.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (SuggestionPriority::High, "USDJPY"),
                (SuggestionPriority::Medium, "EURUSD"),
                (SuggestionPriority::Low, "XAUUSD"),
            ]
        );
        assert_eq!(analysis.suggestions[0].direction, Some(Direction::Buy));
        assert_eq!(analysis.suggestions[2].volume, Decimal::new(15, 1));
    }

    #[test]
    fn test_analyzer_caches_latest() {
        let snapshots = Arc::new(FixedSnapshots(Mutex::new(vec![open(
            "acc-1",
            "EURUSD",
            Direction::Buy,
            "1",
        )])));
        let analyzer = HedgeAnalyzer::new(snapshots.clone(), HedgeConfig::default());
        assert!(analyzer.get_latest_analysis("acc-1").is_none());

        let analyses = analyzer.refresh_all();
        assert_eq!(analyses.len(), 1);
        assert_eq!(
            analyzer.get_latest_analysis("acc-1").unwrap().hedge_ratio,
            Decimal::ZERO
        );

        // Account flattened: the next refresh still reports it.
        snapshots.0.lock().unwrap().clear();
        analyzer.refresh_all();
        assert!(analyzer.get_latest_analysis("acc-1").unwrap().is_fully_hedged);
    }
}
