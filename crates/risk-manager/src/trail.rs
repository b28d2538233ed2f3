//! Trailing-stop monitoring.
//!
//! One [`TrailMonitor`] per open, trailed position. The [`TrailEngine`] owns
//! them, feeds prices, and announces triggers on the event bus without waiting
//! for the resulting actions to execute.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hedge_core::bus::{EngineEvent, EventBus, TriggerReason};
use hedge_core::types::{Direction, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Observable state of one monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailMonitorState {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub best_price: Decimal,
    pub last_price: Decimal,
    /// Price distance the market may retrace from the best price.
    pub distance: Decimal,
    pub fired: bool,
}

/// Best-price tracker for one position.
///
/// Longs ratchet the best price up and fire when `best - price >= distance`.
/// Shorts ratchet it down and fire when `price - best >= distance`.
#[derive(Debug, Clone)]
pub struct TrailMonitor {
    position_id: Uuid,
    symbol: String,
    direction: Direction,
    distance: Decimal,
    best_price: Decimal,
    last_price: Decimal,
    action_ids: Vec<Uuid>,
    fired: bool,
}

impl TrailMonitor {
    pub fn new(
        position_id: Uuid,
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        distance: Decimal,
    ) -> Self {
        Self {
            position_id,
            symbol: symbol.into(),
            direction,
            distance,
            best_price: entry_price,
            last_price: entry_price,
            action_ids: Vec::new(),
            fired: false,
        }
    }

    /// Monitor for an open position with a positive trail width.
    pub fn from_position(position: &Position) -> Option<Self> {
        if !position.is_trail_eligible() {
            return None;
        }
        let mut monitor = Self::new(
            position.id,
            position.symbol.clone(),
            position.direction,
            position.entry_price,
            position.trail_distance(),
        );
        monitor.action_ids = position.trigger_action_ids.clone();
        Some(monitor)
    }

    /// Feed a price. Returns true exactly once, on the update that fires.
    pub fn update(&mut self, price: Decimal) -> bool {
        if self.fired || price <= Decimal::ZERO {
            return false;
        }
        self.last_price = price;

        // Unknown entry price: the first quote seeds the best price.
        if self.best_price <= Decimal::ZERO {
            self.best_price = price;
            return false;
        }

        let improved = match self.direction {
            Direction::Buy => price > self.best_price,
            Direction::Sell => price < self.best_price,
        };
        if improved {
            self.best_price = price;
            return false;
        }

        let retrace = match self.direction {
            Direction::Buy => self.best_price - price,
            Direction::Sell => price - self.best_price,
        };
        if retrace >= self.distance {
            self.fired = true;
        }
        self.fired
    }

    /// Price at which the stop fires, given the current best price.
    pub fn stop_price(&self) -> Decimal {
        match self.direction {
            Direction::Buy => self.best_price - self.distance,
            Direction::Sell => self.best_price + self.distance,
        }
    }

    pub fn best_price(&self) -> Decimal {
        self.best_price
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn state(&self) -> TrailMonitorState {
        TrailMonitorState {
            position_id: self.position_id,
            symbol: self.symbol.clone(),
            direction: self.direction,
            best_price: self.best_price,
            last_price: self.last_price,
            distance: self.distance,
            fired: self.fired,
        }
    }
}

/// A fired trailing stop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailTrigger {
    pub position_id: Uuid,
    pub symbol: String,
    pub best_price: Decimal,
    pub trigger_price: Decimal,
    pub action_ids: Vec<Uuid>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrailStats {
    pub monitored: usize,
    pub price_updates: u64,
    pub triggers_fired: u64,
    pub publish_rejections: u64,
}

/// Registry of active trail monitors keyed by position id.
pub struct TrailEngine {
    monitors: DashMap<Uuid, TrailMonitor>,
    bus: Arc<EventBus>,
    price_updates: AtomicU64,
    triggers_fired: AtomicU64,
    publish_rejections: AtomicU64,
}

impl TrailEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            monitors: DashMap::new(),
            bus,
            price_updates: AtomicU64::new(0),
            triggers_fired: AtomicU64::new(0),
            publish_rejections: AtomicU64::new(0),
        }
    }

    /// Start trailing a position. Returns false if it is not eligible or
    /// already monitored; an existing monitor keeps its best price.
    pub fn register(&self, position: &Position) -> bool {
        let Some(monitor) = TrailMonitor::from_position(position) else {
            debug!(position_id = %position.id, "Position not eligible for trailing");
            return false;
        };
        if self.monitors.contains_key(&position.id) {
            return false;
        }
        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            entry_price = %position.entry_price,
            distance = %monitor.distance,
            "Trail monitor registered"
        );
        self.monitors.entry(position.id).or_insert(monitor);
        true
    }

    pub fn deregister(&self, position_id: Uuid) -> bool {
        let removed = self.monitors.remove(&position_id).is_some();
        if removed {
            info!(position_id = %position_id, "Trail monitor removed");
        }
        removed
    }

    /// Feed a price to one monitor. Unknown positions are ignored.
    pub fn update_price(&self, position_id: Uuid, price: Decimal) -> Option<TrailTrigger> {
        self.price_updates.fetch_add(1, Ordering::Relaxed);

        let trigger = {
            let mut monitor = self.monitors.get_mut(&position_id)?;
            if !monitor.update(price) {
                return None;
            }
            TrailTrigger {
                position_id,
                symbol: monitor.symbol.clone(),
                best_price: monitor.best_price,
                trigger_price: price,
                action_ids: monitor.action_ids.clone(),
                triggered_at: Utc::now(),
            }
        };
        self.monitors.remove(&position_id);
        self.triggers_fired.fetch_add(1, Ordering::Relaxed);

        info!(
            position_id = %position_id,
            best_price = %trigger.best_price,
            trigger_price = %trigger.trigger_price,
            actions = trigger.action_ids.len(),
            "Trailing stop triggered"
        );

        let report = self.bus.publish(EngineEvent::TriggerActions {
            position_id,
            action_ids: trigger.action_ids.clone(),
            reason: TriggerReason::TrailingStop {
                best_price: trigger.best_price,
                trigger_price: trigger.trigger_price,
            },
        });
        if report.delivered == 0 || !report.is_complete() {
            self.publish_rejections.fetch_add(1, Ordering::Relaxed);
            error!(
                position_id = %position_id,
                rejected = ?report.rejected,
                "Trail trigger not delivered to every subscriber"
            );
        }

        Some(trigger)
    }

    /// Feed a quote to every monitor on `symbol`.
    pub fn update_symbol_price(&self, symbol: &str, price: Decimal) -> Vec<TrailTrigger> {
        let ids: Vec<Uuid> = self
            .monitors
            .iter()
            .filter(|m| m.symbol.eq_ignore_ascii_case(symbol))
            .map(|m| *m.key())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.update_price(id, price))
            .collect()
    }

    pub fn get_monitored_positions(&self) -> Vec<TrailMonitorState> {
        self.monitors.iter().map(|m| m.state()).collect()
    }

    pub fn is_monitored(&self, position_id: Uuid) -> bool {
        self.monitors.contains_key(&position_id)
    }

    pub fn stats(&self) -> TrailStats {
        TrailStats {
            monitored: self.monitors.len(),
            price_updates: self.price_updates.load(Ordering::Relaxed),
            triggers_fired: self.triggers_fired.load(Ordering::Relaxed),
            publish_rejections: self.publish_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedge_core::types::PositionStatus;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn open_position(direction: Direction, entry: &str, trail_pips: i64) -> Position {
        let mut position =
            Position::pending("acc-1", "EURUSD", direction, Decimal::ONE, "client-a")
                .with_prices(dec(entry), dec(entry))
                .with_trail(Decimal::new(trail_pips, 0))
                .with_trigger_actions(vec![Uuid::new_v4()]);
        position.transition(PositionStatus::Opening, None).unwrap();
        position.transition(PositionStatus::Open, None).unwrap();
        position
    }

    fn long_monitor() -> TrailMonitor {
        TrailMonitor::new(Uuid::new_v4(), "EURUSD", Direction::Buy, dec("1.1000"), dec("0.0020"))
    }

    #[test]
    fn test_long_boundary() {
        let mut monitor = long_monitor();
        assert!(!monitor.update(dec("1.1050")));
        assert_eq!(monitor.best_price(), dec("1.1050"));

        // 19 pips of retrace: holds.
        assert!(!monitor.update(dec("1.1031")));
        // Exactly 20 pips: fires.
        assert!(monitor.update(dec("1.1030")));
        assert!(monitor.has_fired());
    }

    #[test]
    fn test_long_fires_past_boundary() {
        let mut monitor = long_monitor();
        monitor.update(dec("1.1050"));
        assert!(monitor.update(dec("1.1029")));
    }

    #[test]
    fn test_never_fires_twice() {
        let mut monitor = long_monitor();
        monitor.update(dec("1.1050"));
        assert!(monitor.update(dec("1.1000")));
        assert!(!monitor.update(dec("1.0900")));
        assert!(!monitor.update(dec("1.2000")));
        assert!(!monitor.update(dec("1.0000")));
    }

    #[test]
    fn test_non_improving_prices_keep_best() {
        let mut monitor = long_monitor();
        monitor.update(dec("1.1040"));
        for price in ["1.1039", "1.1035", "1.1040", "1.1025"] {
            monitor.update(dec(price));
            assert_eq!(monitor.best_price(), dec("1.1040"));
        }
        assert_eq!(monitor.stop_price(), dec("1.1020"));
    }

    #[test]
    fn test_short_ratchets_down() {
        let mut monitor =
            TrailMonitor::new(Uuid::new_v4(), "EURUSD", Direction::Sell, dec("1.1000"), dec("0.0020"));
        assert!(!monitor.update(dec("1.0950")));
        assert!(!monitor.update(dec("1.0960")));
        assert_eq!(monitor.best_price(), dec("1.0950"));
        assert_eq!(monitor.stop_price(), dec("1.0970"));

        assert!(!monitor.update(dec("1.0969")));
        assert!(monitor.update(dec("1.0970")));
    }

    #[test]
    fn test_unknown_entry_seeds_from_first_quote() {
        let mut monitor =
            TrailMonitor::new(Uuid::new_v4(), "EURUSD", Direction::Sell, Decimal::ZERO, dec("0.0010"));
        assert!(!monitor.update(dec("1.2000")));
        assert_eq!(monitor.best_price(), dec("1.2000"));
        assert!(!monitor.update(dec("1.2009")));
        assert!(monitor.update(dec("1.2010")));
    }

    #[tokio::test]
    async fn test_engine_trigger_publishes_and_removes() {
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe("test");
        let engine = TrailEngine::new(bus.clone());

        let position = open_position(Direction::Buy, "1.1000", 20);
        assert!(engine.register(&position));
        assert!(!engine.register(&position));
        assert!(engine.is_monitored(position.id));

        assert!(engine.update_symbol_price("EURUSD", dec("1.1050")).is_empty());
        let triggers = engine.update_symbol_price("eurusd", dec("1.1030"));
        assert_eq!(triggers.len(), 1);
        assert!(!engine.is_monitored(position.id));
        assert!(engine.update_price(position.id, dec("1.0000")).is_none());

        match events.recv().await.unwrap() {
            EngineEvent::TriggerActions {
                position_id,
                action_ids,
                reason,
            } => {
                assert_eq!(position_id, position.id);
                assert_eq!(action_ids, position.trigger_action_ids);
                assert!(matches!(reason, TriggerReason::TrailingStop { .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = engine.stats();
        assert_eq!(stats.triggers_fired, 1);
        assert_eq!(stats.monitored, 0);
    }

    #[test]
    fn test_engine_ignores_ineligible_and_unknown() {
        let engine = TrailEngine::new(Arc::new(EventBus::new(4)));
        let untrailed = open_position(Direction::Buy, "1.1000", 0);
        assert!(!engine.register(&untrailed));

        let pending = Position::pending("acc-1", "EURUSD", Direction::Buy, Decimal::ONE, "c")
            .with_trail(Decimal::TEN);
        assert!(!engine.register(&pending));

        assert!(engine.update_price(Uuid::new_v4(), dec("1.0")).is_none());
        assert!(!engine.deregister(Uuid::new_v4()));
        assert!(engine.get_monitored_positions().is_empty());
    }
}
