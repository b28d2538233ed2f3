//! Cross-account hedge execution with compensating rollback.
//!
//! All legs are submitted concurrently. A leg that fails after others filled
//! leaves the accounts unbalanced, so every filled leg gets an inverse
//! compensating leg on the same account. A failed compensation is escalated,
//! never retried.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hedge_core::bus::{ActionOutcome, EngineEvent, EventBus};
use hedge_core::config::HedgeConfig;
use hedge_core::store::Store;
use hedge_core::types::{Action, ActionKind, ActionStatus, CommandAck, Direction};
use hedge_core::venue::CommandTransport;
use hedge_core::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::consistency::ActionConsistencyManager;

const HISTORY_LIMIT: usize = 100;

/// One account's order within a hedge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeLeg {
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
}

impl HedgeLeg {
    pub fn new(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        volume: Decimal,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
            direction,
            volume,
        }
    }

    /// Inverse leg that flattens this one.
    pub fn inverse(&self, volume: Decimal) -> Self {
        Self {
            account_id: self.account_id.clone(),
            symbol: self.symbol.clone(),
            direction: self.direction.opposite(),
            volume,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossAccountHedgeRequest {
    pub hedge_id: Uuid,
    pub legs: Vec<HedgeLeg>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CrossAccountHedgeRequest {
    pub fn new(legs: Vec<HedgeLeg>) -> Self {
        Self {
            hedge_id: Uuid::new_v4(),
            legs,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.legs.len() < 2 {
            return Err(Error::validation(format!(
                "hedge {} needs at least 2 legs, got {}",
                self.hedge_id,
                self.legs.len()
            )));
        }
        let mut accounts = HashSet::new();
        for leg in &self.legs {
            if leg.account_id.trim().is_empty() || leg.symbol.trim().is_empty() {
                return Err(Error::validation("hedge leg is missing account or symbol"));
            }
            if leg.volume <= Decimal::ZERO {
                return Err(Error::validation(format!(
                    "hedge leg on {} has non-positive volume {}",
                    leg.account_id, leg.volume
                )));
            }
            if !accounts.insert(leg.account_id.as_str()) {
                return Err(Error::validation(format!(
                    "hedge {} has two legs on account {}",
                    self.hedge_id, leg.account_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegResult {
    pub leg: HedgeLeg,
    /// Action recording this leg in the store.
    pub action_id: Uuid,
    pub success: bool,
    pub ack: Option<CommandAck>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl LegResult {
    /// Volume actually on the account after this leg.
    pub fn filled_volume(&self) -> Decimal {
        if !self.success {
            return Decimal::ZERO;
        }
        self.ack
            .as_ref()
            .and_then(|a| a.filled_volume)
            .unwrap_or(self.leg.volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeExecutionStatus {
    Completed,
    Partial,
    Failed,
}

/// How tightly the filled legs executed in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationReport {
    pub filled_legs: usize,
    pub spread_ms: Option<i64>,
    pub tolerance_ms: u64,
    /// `None` when no leg filled.
    pub accuracy: Option<f64>,
}

impl SynchronizationReport {
    pub fn within_tolerance(&self) -> bool {
        self.spread_ms
            .map(|s| s <= self.tolerance_ms as i64)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossAccountHedgeResult {
    pub hedge_id: Uuid,
    pub status: HedgeExecutionStatus,
    pub legs: Vec<LegResult>,
    pub compensation_required: bool,
    pub compensation_legs: Vec<LegResult>,
    pub escalated: bool,
    pub synchronization: SynchronizationReport,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CrossAccountHedgeResult {
    pub fn failed_legs(&self) -> usize {
        self.legs.iter().filter(|l| !l.success).count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorHealth {
    pub healthy: bool,
    pub executions: u64,
    pub completed: u64,
    pub partials: u64,
    pub failures: u64,
    pub escalations: u64,
    pub mean_sync_accuracy: Option<f64>,
}

/// `max(0, 1 - spread / tolerance)`.
pub fn synchronization_accuracy(spread_ms: i64, tolerance_ms: u64) -> f64 {
    if tolerance_ms == 0 {
        return if spread_ms <= 0 { 1.0 } else { 0.0 };
    }
    (1.0 - spread_ms.max(0) as f64 / tolerance_ms as f64).max(0.0)
}

pub struct CrossAccountHedgeOrchestrator {
    client_id: String,
    store: Arc<dyn Store>,
    transport: Arc<dyn CommandTransport>,
    locks: Arc<ActionConsistencyManager>,
    bus: Arc<EventBus>,
    config: HedgeConfig,
    command_timeout: Duration,
    history: Mutex<VecDeque<CrossAccountHedgeResult>>,
    executions: AtomicU64,
    completed: AtomicU64,
    partials: AtomicU64,
    failures: AtomicU64,
    escalations: AtomicU64,
}

impl CrossAccountHedgeOrchestrator {
    pub fn new(
        client_id: impl Into<String>,
        store: Arc<dyn Store>,
        transport: Arc<dyn CommandTransport>,
        locks: Arc<ActionConsistencyManager>,
        bus: Arc<EventBus>,
        config: HedgeConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            store,
            transport,
            locks,
            bus,
            config,
            command_timeout,
            history: Mutex::new(VecDeque::new()),
            executions: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            partials: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
        }
    }

    /// Execute every leg of `request`. Leg failures never surface as an
    /// error; they are reported in the result and compensated.
    pub async fn execute(&self, request: CrossAccountHedgeRequest) -> Result<CrossAccountHedgeResult> {
        request.validate()?;
        let started_at = Utc::now();
        let hedge_id = request.hedge_id;

        info!(
            hedge_id = %hedge_id,
            legs = request.legs.len(),
            reason = ?request.reason,
            "Executing cross-account hedge"
        );

        let legs = join_all(request.legs.iter().map(|leg| self.submit_leg(hedge_id, leg)))
            .await;
        let filled = legs.iter().filter(|l| l.success).count();

        let status = if filled == legs.len() {
            HedgeExecutionStatus::Completed
        } else if filled == 0 {
            HedgeExecutionStatus::Failed
        } else {
            HedgeExecutionStatus::Partial
        };

        let compensation_required = status == HedgeExecutionStatus::Partial;
        let mut compensation_legs = Vec::new();
        let mut escalated = false;
        if compensation_required {
            let plan = Self::compensation_plan(&legs);
            warn!(
                hedge_id = %hedge_id,
                filled,
                failed = legs.len() - filled,
                compensating = plan.len(),
                "Hedge partially filled, compensating"
            );
            compensation_legs = join_all(plan.iter().map(|leg| self.submit_leg(hedge_id, leg))).await;

            let unflattened: Vec<&LegResult> =
                compensation_legs.iter().filter(|l| !l.success).collect();
            if !unflattened.is_empty() {
                escalated = true;
                self.escalate(hedge_id, &unflattened);
            }
        }

        let synchronization = self.synchronization_report(&legs);
        let result = CrossAccountHedgeResult {
            hedge_id,
            status,
            legs,
            compensation_required,
            compensation_legs,
            escalated,
            synchronization,
            started_at,
            completed_at: Utc::now(),
        };

        self.record(&result);
        info!(
            hedge_id = %hedge_id,
            status = ?result.status,
            escalated = result.escalated,
            sync_accuracy = ?result.synchronization.accuracy,
            "Cross-account hedge finished"
        );
        Ok(result)
    }

    /// Inverse legs that return every filled account to flat.
    pub fn compensation_plan(legs: &[LegResult]) -> Vec<HedgeLeg> {
        legs.iter()
            .filter(|l| l.success)
            .map(|l| l.leg.inverse(l.filled_volume()))
            .filter(|l| l.volume > Decimal::ZERO)
            .collect()
    }

    pub fn synchronization_report(&self, legs: &[LegResult]) -> SynchronizationReport {
        let times: Vec<DateTime<Utc>> = legs
            .iter()
            .filter(|l| l.success)
            .map(|l| l.completed_at)
            .collect();
        let tolerance_ms = self.config.sync_tolerance_ms;

        let spread_ms = match (times.iter().min(), times.iter().max()) {
            (Some(first), Some(last)) => Some((*last - *first).num_milliseconds()),
            _ => None,
        };
        let accuracy = match times.len() {
            0 => None,
            1 => Some(1.0),
            _ => spread_ms.map(|s| synchronization_accuracy(s, tolerance_ms)),
        };

        SynchronizationReport {
            filled_legs: times.len(),
            spread_ms,
            tolerance_ms,
            accuracy,
        }
    }

    /// Record the leg as an action, send it, and write the terminal status.
    async fn submit_leg(&self, hedge_id: Uuid, leg: &HedgeLeg) -> LegResult {
        let action = Action::new(
            self.client_id.clone(),
            leg.account_id.clone(),
            ActionKind::Entry {
                symbol: leg.symbol.clone(),
                direction: leg.direction,
                volume: leg.volume,
            },
        );
        let started = Instant::now();

        // Held until the terminal status is written so the sync engine skips it.
        self.locks.acquire(action.id);
        let outcome = self.send_leg(&action).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, reason, recorded) = match &outcome {
            Ok(ack) => (
                ActionStatus::Executed,
                None,
                ActionOutcome::Executed { ack: ack.clone() },
            ),
            Err(e) => (
                ActionStatus::Failed,
                Some(e.to_string()),
                ActionOutcome::Failed {
                    reason: e.to_string(),
                },
            ),
        };
        // Kept until the write lands so the leg is never sent a second time.
        self.locks.record_outcome(action.id, recorded);
        match self
            .store
            .update_action_status_if(action.id, ActionStatus::Executing, status, reason)
            .await
        {
            Ok(true) => {
                self.locks.settle(action.id);
            }
            Ok(false) => {
                self.locks.settle(action.id);
                warn!(action_id = %action.id, "Hedge leg action changed before finalisation");
            }
            Err(e) => warn!(
                action_id = %action.id,
                error = %e,
                "Hedge leg status not recorded, left for the sync engine to finalise"
            ),
        }
        match &outcome {
            Ok(_) => self.locks.release(action.id),
            Err(_) => self.locks.release_failed(action.id),
        };

        match outcome {
            Ok(ack) => {
                info!(
                    hedge_id = %hedge_id,
                    account_id = %leg.account_id,
                    direction = %leg.direction,
                    volume = %leg.volume,
                    fill_price = ?ack.fill_price,
                    latency_ms,
                    "Hedge leg filled"
                );
                LegResult {
                    leg: leg.clone(),
                    action_id: action.id,
                    success: true,
                    ack: Some(ack),
                    error: None,
                    latency_ms,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!(
                    hedge_id = %hedge_id,
                    account_id = %leg.account_id,
                    error = %e,
                    class = e.class(),
                    "Hedge leg failed"
                );
                LegResult {
                    leg: leg.clone(),
                    action_id: action.id,
                    success: false,
                    ack: None,
                    error: Some(e.to_string()),
                    latency_ms,
                    completed_at: Utc::now(),
                }
            }
        }
    }

    async fn send_leg(&self, action: &Action) -> Result<CommandAck> {
        let command = action.to_command();
        command.validate()?;

        self.store.insert_action(action).await?;
        if !self
            .store
            .update_action_status_if(action.id, ActionStatus::Pending, ActionStatus::Executing, None)
            .await?
        {
            return Err(Error::Conflict {
                key: action.id.to_string(),
                message: "hedge leg action claimed elsewhere".to_string(),
            });
        }

        let ack = match tokio::time::timeout(self.command_timeout, self.transport.send(command.clone())).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("{} command {}", command.name(), command.command_id()),
                    elapsed_ms: self.command_timeout.as_millis() as u64,
                })
            }
        };
        if !ack.success {
            return Err(Error::execution(
                ack.message
                    .unwrap_or_else(|| format!("venue rejected hedge leg on {}", action.account_id)),
            ));
        }
        Ok(ack)
    }

    fn escalate(&self, hedge_id: Uuid, unflattened: &[&LegResult]) {
        let accounts: Vec<&str> = unflattened
            .iter()
            .map(|l| l.leg.account_id.as_str())
            .collect();
        let reason = format!(
            "compensation failed on {}: {}",
            accounts.join(", "),
            unflattened
                .iter()
                .filter_map(|l| l.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ")
        );
        error!(
            severity = "critical",
            hedge_id = %hedge_id,
            accounts = ?accounts,
            reason = %reason,
            "Hedge compensation failed, manual intervention required"
        );
        let report = self.bus.publish(EngineEvent::HedgeEscalated { hedge_id, reason });
        if !report.is_complete() {
            error!(hedge_id = %hedge_id, "Hedge escalation rejected by full subscribers");
        }
    }

    fn record(&self, result: &CrossAccountHedgeResult) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        match result.status {
            HedgeExecutionStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            HedgeExecutionStatus::Partial => self.partials.fetch_add(1, Ordering::Relaxed),
            HedgeExecutionStatus::Failed => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        if result.escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }

        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(result.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Recent results, newest last.
    pub fn history(&self) -> Vec<CrossAccountHedgeResult> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Healthy while no hedge in recent history was escalated.
    pub fn health(&self) -> OrchestratorHealth {
        let history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let accuracies: Vec<f64> = history
            .iter()
            .filter_map(|r| r.synchronization.accuracy)
            .collect();
        let mean_sync_accuracy = if accuracies.is_empty() {
            None
        } else {
            Some(accuracies.iter().sum::<f64>() / accuracies.len() as f64)
        };

        OrchestratorHealth {
            healthy: !history.iter().any(|r| r.escalated),
            executions: self.executions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            partials: self.partials.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            mean_sync_accuracy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hedge_core::store::{FeedFilter, MemoryStore};
    use hedge_core::types::{Command, TransportEvent};
    use hedge_core::venue::PaperVenue;
    use mockall::mock;
    use tokio::sync::mpsc;

    mock! {
        pub Transport {}

        #[async_trait]
        impl CommandTransport for Transport {
            async fn send(&self, command: Command) -> Result<CommandAck>;
            fn subscribe_events(&self, name: &str) -> mpsc::Receiver<TransportEvent>;
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        transport: Arc<dyn CommandTransport>,
        bus: Arc<EventBus>,
    ) -> CrossAccountHedgeOrchestrator {
        CrossAccountHedgeOrchestrator::new(
            "client-a",
            store,
            transport,
            Arc::new(ActionConsistencyManager::new(Duration::from_secs(300))),
            bus,
            HedgeConfig::default(),
            Duration::from_secs(1),
        )
    }

    fn two_legs() -> CrossAccountHedgeRequest {
        CrossAccountHedgeRequest::new(vec![
            HedgeLeg::new("acc-1", "EURUSD", Direction::Buy, dec("0.5")),
            HedgeLeg::new("acc-2", "EURUSD", Direction::Sell, dec("0.5")),
        ])
    }

    #[test]
    fn test_request_validation() {
        let single = CrossAccountHedgeRequest::new(vec![HedgeLeg::new(
            "acc-1",
            "EURUSD",
            Direction::Buy,
            Decimal::ONE,
        )]);
        let same_account = CrossAccountHedgeRequest::new(vec![
            HedgeLeg::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE),
            HedgeLeg::new("acc-1", "EURUSD", Direction::Sell, Decimal::ONE),
        ]);
        let zero = CrossAccountHedgeRequest::new(vec![
            HedgeLeg::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE),
            HedgeLeg::new("acc-2", "EURUSD", Direction::Sell, Decimal::ZERO),
        ]);

        for request in [single, same_account, zero] {
            assert!(matches!(request.validate(), Err(Error::Validation { .. })));
        }
        assert!(two_legs().validate().is_ok());
    }

    #[test]
    fn test_synchronization_accuracy() {
        assert_eq!(synchronization_accuracy(0, 1000), 1.0);
        assert!((synchronization_accuracy(250, 1000) - 0.75).abs() < 1e-9);
        assert_eq!(synchronization_accuracy(1500, 1000), 0.0);
        assert_eq!(synchronization_accuracy(0, 0), 1.0);
    }

    #[tokio::test]
    async fn test_all_legs_fill() {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(PaperVenue::new());
        venue.set_price("EURUSD", dec("1.1000"));
        let orch = orchestrator(store.clone(), venue.clone(), Arc::new(EventBus::new(16)));

        let result = orch.execute(two_legs()).await.unwrap();
        assert_eq!(result.status, HedgeExecutionStatus::Completed);
        assert!(!result.compensation_required);
        assert!(result.compensation_legs.is_empty());
        assert_eq!(result.synchronization.filled_legs, 2);
        let accuracy = result.synchronization.accuracy.unwrap();
        assert!((0.0..=1.0).contains(&accuracy));

        let executed = store
            .list_actions(&FeedFilter::new(), Some(ActionStatus::Executed))
            .await
            .unwrap();
        assert_eq!(executed.len(), 2);
        assert_eq!(orch.health().completed, 1);
    }

    #[tokio::test]
    async fn test_partial_fill_compensates_filled_leg() {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(PaperVenue::new());
        venue.set_price("EURUSD", dec("1.1000"));
        venue.reject_account("acc-2");
        let orch = orchestrator(store.clone(), venue.clone(), Arc::new(EventBus::new(16)));

        let result = orch.execute(two_legs()).await.unwrap();
        assert_eq!(result.status, HedgeExecutionStatus::Partial);
        assert!(result.compensation_required);
        assert_eq!(result.failed_legs(), 1);
        assert_eq!(result.compensation_legs.len(), 1);

        let compensation = &result.compensation_legs[0];
        assert!(compensation.success);
        assert_eq!(compensation.leg.account_id, "acc-1");
        assert_eq!(compensation.leg.direction, Direction::Sell);
        assert_eq!(compensation.leg.volume, dec("0.5"));
        assert!(!result.escalated);
        assert_eq!(result.synchronization.accuracy, Some(1.0));

        assert_eq!(venue.sent_commands().len(), 3);
        let failed = store
            .list_actions(&FeedFilter::new(), Some(ActionStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].account_id, "acc-2");
        assert_eq!(orch.health().partials, 1);
    }

    #[tokio::test]
    async fn test_all_legs_fail_without_compensation() {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(PaperVenue::new());
        venue.set_offline(true);
        let orch = orchestrator(store, venue.clone(), Arc::new(EventBus::new(16)));

        let result = orch.execute(two_legs()).await.unwrap();
        assert_eq!(result.status, HedgeExecutionStatus::Failed);
        assert!(!result.compensation_required);
        assert_eq!(result.synchronization.accuracy, None);
        assert!(result.legs.iter().all(|l| l.error.is_some()));
    }

    #[tokio::test]
    async fn test_failed_compensation_escalates() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(3).returning(|command| match command {
            Command::Open {
                command_id,
                account_id,
                direction,
                volume,
                ..
            } => {
                if account_id == "acc-1" && direction == Direction::Buy {
                    Ok(CommandAck::filled(command_id, Decimal::ONE, volume))
                } else {
                    Err(Error::connection("terminal disconnected"))
                }
            }
            other => Ok(CommandAck::rejected(other.command_id(), "unexpected")),
        });

        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe("test");
        let orch = orchestrator(Arc::new(MemoryStore::new()), Arc::new(transport), bus);

        let result = orch.execute(two_legs()).await.unwrap();
        assert_eq!(result.status, HedgeExecutionStatus::Partial);
        assert!(result.escalated);
        assert!(!result.compensation_legs[0].success);

        match events.recv().await.unwrap() {
            EngineEvent::HedgeEscalated { hedge_id, reason } => {
                assert_eq!(hedge_id, result.hedge_id);
                assert!(reason.contains("acc-1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let health = orch.health();
        assert!(!health.healthy);
        assert_eq!(health.escalations, 1);
    }
}
