//! Action execution for the accounts this process owns.
//!
//! Actions reach EXECUTING through a conditional store update made by
//! whichever process claimed them. The owning process then picks them up from
//! the subscription feed, or from the periodic reconciliation scan when an
//! event was missed, executes the matching venue command once, and writes the
//! terminal status.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hedge_core::bus::{ActionOutcome, EngineEvent, EventBus};
use hedge_core::config::SyncConfig;
use hedge_core::store::{EntityKind, FeedEntity, FeedFilter, FeedItem, Store, SubscriptionFeed};
use hedge_core::types::{Action, ActionStatus, CommandAck};
use hedge_core::venue::CommandTransport;
use hedge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consistency::ActionConsistencyManager;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// What happened to one action handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Executed,
    Failed,
    /// Not executable here: not owned, not EXECUTING, or already in flight.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub running: bool,
    pub events_received: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub claimed: u64,
    pub reconciliation_passes: u64,
    pub subscription_errors: u32,
    pub locks_held: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
}

pub struct ActionSyncEngine {
    client_id: String,
    filter: FeedFilter,
    store: Arc<dyn Store>,
    feed: Arc<dyn SubscriptionFeed>,
    transport: Arc<dyn CommandTransport>,
    locks: Arc<ActionConsistencyManager>,
    bus: Arc<EventBus>,
    config: SyncConfig,
    running: AtomicBool,
    events_received: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    claimed: AtomicU64,
    reconciliation_passes: AtomicU64,
    /// Consecutive subscription failures; reset once the feed is back.
    subscription_errors: AtomicU32,
    last_scan_at: RwLock<Option<DateTime<Utc>>>,
}

impl ActionSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: impl Into<String>,
        owned_accounts: Vec<String>,
        store: Arc<dyn Store>,
        feed: Arc<dyn SubscriptionFeed>,
        transport: Arc<dyn CommandTransport>,
        locks: Arc<ActionConsistencyManager>,
        bus: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            filter: FeedFilter::new()
                .accounts(owned_accounts)
                .owner(client_id.clone()),
            client_id,
            store,
            feed,
            transport,
            locks,
            bus,
            config,
            running: AtomicBool::new(false),
            events_received: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            reconciliation_passes: AtomicU64::new(0),
            subscription_errors: AtomicU32::new(0),
            last_scan_at: RwLock::new(None),
        }
    }

    fn owns(&self, action: &Action) -> bool {
        self.filter.matches(&action.account_id, &action.owner)
    }

    /// Handle one action status notification.
    pub async fn handle_action_event(&self, action: Action) -> Result<ExecutionResult> {
        self.events_received.fetch_add(1, Ordering::Relaxed);

        if action.status != ActionStatus::Executing {
            return Ok(ExecutionResult::Skipped);
        }
        if !self.owns(&action) {
            debug!(action_id = %action.id, owner = %action.owner, "Action owned elsewhere");
            return Ok(self.skip());
        }
        if self.locks.is_locked(action.id) {
            return Ok(self.skip());
        }
        self.process(action.id).await
    }

    fn skip(&self) -> ExecutionResult {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        ExecutionResult::Skipped
    }

    /// Execute one action under the local lock. The lock is released on every
    /// path.
    pub async fn process(&self, action_id: Uuid) -> Result<ExecutionResult> {
        if !self.locks.acquire(action_id) {
            return Ok(self.skip());
        }

        let result = self.process_locked(action_id).await;
        match result {
            Ok(ExecutionResult::Failed) | Err(_) => {
                self.locks.release_failed(action_id);
            }
            Ok(_) => {
                self.locks.release(action_id);
            }
        }
        result
    }

    async fn process_locked(&self, action_id: Uuid) -> Result<ExecutionResult> {
        // Re-read: the event that led here may be stale.
        let Some(action) = self.store.get_action(action_id).await? else {
            return Ok(self.skip());
        };
        if action.status != ActionStatus::Executing {
            self.locks.settle(action.id);
            return Ok(self.skip());
        }
        if !self.owns(&action) {
            return Ok(self.skip());
        }

        // The venue already answered; only the terminal write is missing.
        if let Some(outcome) = self.locks.unsettled_outcome(action.id) {
            info!(action_id = %action.id, "Retrying terminal status of a sent action");
            return self.finalize(action, outcome).await;
        }

        info!(
            action_id = %action.id,
            account_id = %action.account_id,
            action_type = ?action.action_type(),
            "Executing action"
        );
        self.publish(EngineEvent::ActionStarted {
            action: action.clone(),
        });

        let outcome = match self.send(&action).await {
            Ok(ack) => ActionOutcome::Executed { ack },
            Err(e) => {
                warn!(
                    action_id = %action.id,
                    account_id = %action.account_id,
                    class = e.class(),
                    error = %e,
                    "Action execution failed"
                );
                ActionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        self.locks.record_outcome(action.id, outcome.clone());
        self.finalize(action, outcome).await
    }

    async fn send(&self, action: &Action) -> Result<CommandAck> {
        let command = action.to_command();
        command.validate()?;

        let timeout = self.config.command_timeout();
        let ack = match tokio::time::timeout(timeout, self.transport.send(command.clone())).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("{} command {}", command.name(), command.command_id()),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        };

        if !ack.success {
            return Err(Error::execution(
                ack.message
                    .unwrap_or_else(|| format!("venue rejected {} command", command.name())),
            ));
        }
        Ok(ack)
    }

    /// Write the terminal status for a sent action. On a store error the
    /// recorded outcome is kept so a later pass retries this write only.
    async fn finalize(&self, mut action: Action, outcome: ActionOutcome) -> Result<ExecutionResult> {
        let (status, reason, result) = match &outcome {
            ActionOutcome::Executed { .. } => (ActionStatus::Executed, None, ExecutionResult::Executed),
            ActionOutcome::Failed { reason } => (
                ActionStatus::Failed,
                Some(reason.clone()),
                ExecutionResult::Failed,
            ),
        };
        let applied = match self
            .store
            .update_action_status_if(action.id, ActionStatus::Executing, status, reason.clone())
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(
                    action_id = %action.id,
                    status = %status,
                    error = %e,
                    "Terminal status not stored, will retry without resending"
                );
                return Err(e);
            }
        };
        self.locks.settle(action.id);
        if !applied {
            warn!(
                action_id = %action.id,
                status = %status,
                "Action left EXECUTING before finalisation"
            );
        }

        match result {
            ExecutionResult::Executed => self.executed.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        action.status = status;
        if reason.is_some() {
            action.failure_reason = reason;
        }
        action.updated_at = Utc::now();
        self.publish(EngineEvent::ActionFinished { action, outcome });
        Ok(result)
    }

    fn publish(&self, event: EngineEvent) {
        let report = self.bus.publish(event);
        if !report.is_complete() {
            error!(rejected = ?report.rejected, "Engine event rejected by full subscribers");
        }
    }

    /// Claim PENDING trigger actions. Claimed actions owned by this process
    /// are executed here; the rest are executed by their owners.
    pub async fn trigger_actions(&self, action_ids: &[Uuid]) -> Result<usize> {
        let mut claimed = Vec::new();
        for &id in action_ids {
            let won = self
                .store
                .update_action_status_if(id, ActionStatus::Pending, ActionStatus::Executing, None)
                .await?;
            if won {
                self.claimed.fetch_add(1, Ordering::Relaxed);
                claimed.push(id);
            } else {
                debug!(action_id = %id, "Trigger action not pending, skipped");
            }
        }
        info!(
            requested = action_ids.len(),
            claimed = claimed.len(),
            "Trigger actions claimed"
        );

        let mut own = Vec::new();
        for id in &claimed {
            if let Some(action) = self.store.get_action(*id).await? {
                if self.owns(&action) {
                    own.push(action.id);
                }
            }
        }
        for result in join_all(own.into_iter().map(|id| self.process(id))).await {
            if let Err(e) = result {
                error!(error = %e, "Trigger action processing failed");
            }
        }
        Ok(claimed.len())
    }

    /// Scan for owned actions still EXECUTING and run the ones not already in
    /// flight here. Also clears stale local locks.
    pub async fn reconcile(&self) -> Result<usize> {
        self.reconciliation_passes.fetch_add(1, Ordering::Relaxed);
        *self
            .last_scan_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());

        let released = self.locks.cleanup_stale();
        if !released.is_empty() {
            warn!(count = released.len(), "Stale action locks released during reconciliation");
        }

        let candidates: Vec<Uuid> = self
            .store
            .list_actions(&self.filter, Some(ActionStatus::Executing))
            .await?
            .into_iter()
            .filter(|a| !self.locks.is_locked(a.id))
            .map(|a| a.id)
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!(count = candidates.len(), "Reconciling executing actions");

        let mut processed = 0;
        for result in join_all(candidates.into_iter().map(|id| self.process(id))).await {
            match result {
                Ok(ExecutionResult::Skipped) => {}
                Ok(_) => processed += 1,
                Err(e) => error!(error = %e, "Reconciliation of action failed"),
            }
        }
        Ok(processed)
    }

    async fn connect(&self) -> Option<mpsc::Receiver<FeedItem>> {
        match self
            .feed
            .subscribe(EntityKind::Action, self.filter.clone())
            .await
        {
            Ok(rx) => {
                self.subscription_errors.store(0, Ordering::Relaxed);
                info!(client_id = %self.client_id, "Action feed subscribed");
                Some(rx)
            }
            Err(e) => {
                let errors = self.subscription_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, errors, "Action feed subscription failed");
                None
            }
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            client_id = %self.client_id,
            reconcile_secs = self.config.reconcile_interval().as_secs(),
            "Starting action sync engine"
        );

        let mut bus_rx = self.bus.subscribe_filtered("action-sync", |event| {
            matches!(event, EngineEvent::TriggerActions { .. })
        });
        let mut feed_rx = self.connect().await;
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Initial reconciliation failed");
        }

        let base_delay = self.config.reconnect_delay().max(Duration::from_millis(100));
        let mut backoff = base_delay;
        let reconnect = tokio::time::sleep(backoff);
        tokio::pin!(reconnect);

        let mut ticker = tokio::time::interval(self.config.reconcile_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                item = next_item(&mut feed_rx) => match item {
                    Some(item) => {
                        if let FeedEntity::Action(action) = item.entity {
                            let engine = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = engine.handle_action_event(action).await {
                                    error!(error = %e, "Action event handling failed");
                                }
                            });
                        }
                    }
                    None => {
                        let errors = self.subscription_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(errors, "Action feed closed, reconnecting");
                        feed_rx = None;
                        backoff = base_delay;
                        reconnect.as_mut().reset(tokio::time::Instant::now() + backoff);
                    }
                },
                () = &mut reconnect, if feed_rx.is_none() => {
                    feed_rx = self.connect().await;
                    if feed_rx.is_some() {
                        backoff = base_delay;
                        // Events may have been missed while disconnected.
                        let engine = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.reconcile().await {
                                error!(error = %e, "Post-reconnect reconciliation failed");
                            }
                        });
                    } else {
                        backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
                        reconnect.as_mut().reset(tokio::time::Instant::now() + backoff);
                    }
                }
                Some(event) = bus_rx.recv() => {
                    if let EngineEvent::TriggerActions { position_id, action_ids, reason } = event {
                        info!(position_id = %position_id, reason = ?reason, "Trigger received");
                        let engine = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.trigger_actions(&action_ids).await {
                                error!(position_id = %position_id, error = %e, "Failed to claim trigger actions");
                            }
                        });
                    }
                }
                _ = ticker.tick() => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.reconcile().await {
                            error!(error = %e, "Reconciliation pass failed");
                        }
                    });
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Action sync engine stopped");
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.subscription_errors.load(Ordering::Relaxed) < self.config.max_subscription_errors
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            running: self.running.load(Ordering::SeqCst),
            events_received: self.events_received.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            reconciliation_passes: self.reconciliation_passes.load(Ordering::Relaxed),
            subscription_errors: self.subscription_errors.load(Ordering::Relaxed),
            locks_held: self.locks.held(),
            last_scan_at: *self
                .last_scan_at
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

async fn next_item(rx: &mut Option<mpsc::Receiver<FeedItem>>) -> Option<FeedItem> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
