//! Position lifecycle coordination.
//!
//! The coordinator owns the position/account cache of this process. Owner
//! transitions are written to the store with a conditional update and then
//! observed like any other change, so every side effect (trail registration,
//! stop-out triggers) runs from exactly one place: [`PositionCoordinator::on_status_event`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hedge_core::bus::{ActionOutcome, EngineEvent, EventBus, TriggerReason};
use hedge_core::store::{
    EntityKind, FeedEntity, FeedFilter, FeedItem, PositionSnapshots, Store, SubscriptionFeed,
};
use hedge_core::types::{
    AccountSnapshot, Action, ActionKind, ActionStatus, ActionType, CommandAck, Direction,
    Position, PositionStatus, TransportEvent,
};
use hedge_core::venue::CommandTransport;
use hedge_core::{Error, Result};
use risk_manager::TrailEngine;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::conflict_resolver::{ConflictContext, ConflictResolver, SourceChannel};

/// Parameters of a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRequest {
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    /// Trailing-stop width in pips; zero disables trailing.
    #[serde(default)]
    pub trail_width: Decimal,
    /// Pre-created actions fired on stop-out or trail trigger.
    #[serde(default)]
    pub trigger_action_ids: Vec<Uuid>,
}

impl EntryRequest {
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
            trail_width: Decimal::ZERO,
            trigger_action_ids: Vec::new(),
        }
    }

    pub fn with_trail(mut self, trail_width: Decimal) -> Self {
        self.trail_width = trail_width;
        self
    }

    pub fn with_trigger_actions(mut self, ids: Vec<Uuid>) -> Self {
        self.trigger_action_ids = ids;
        self
    }
}

/// Result of feeding one observed position into the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Same as the cached value.
    Unchanged,
    /// Older than the cached value; ignored.
    Stale,
    /// Same status, other fields refreshed.
    Updated,
    /// Status changed. `from` is `None` for a first observation.
    Applied {
        from: Option<PositionStatus>,
        to: PositionStatus,
    },
    Rejected { reason: String },
}

/// Read-only copy of the cache.
#[derive(Debug, Clone, Default)]
pub struct RealtimeSnapshot {
    pub positions: HashMap<Uuid, Position>,
    pub accounts: HashMap<String, AccountSnapshot>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RealtimeSnapshot {
    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.values().filter(|p| p.is_open()).collect()
    }

    pub fn positions_for_account(&self, account_id: &str) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.account_id == account_id)
            .collect()
    }
}

enum CacheMutation {
    UpsertPosition {
        position: Position,
        source: SourceChannel,
    },
    UpsertAccount(AccountSnapshot),
    Refreshed(DateTime<Utc>),
}

#[derive(Default)]
struct PositionCache {
    positions: HashMap<Uuid, Position>,
    sources: HashMap<Uuid, SourceChannel>,
    accounts: HashMap<String, AccountSnapshot>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl PositionCache {
    fn apply(&mut self, mutation: CacheMutation) {
        match mutation {
            CacheMutation::UpsertPosition { position, source } => {
                self.sources.insert(position.id, source);
                self.positions.insert(position.id, position);
            }
            CacheMutation::UpsertAccount(account) => {
                self.accounts.insert(account.account_id.clone(), account);
            }
            CacheMutation::Refreshed(at) => self.refreshed_at = Some(at),
        }
    }

    fn snapshot(&self) -> RealtimeSnapshot {
        RealtimeSnapshot {
            positions: self.positions.clone(),
            accounts: self.accounts.clone(),
            refreshed_at: self.refreshed_at,
        }
    }
}

/// Work to do once the cache lock is released.
enum SideEffect {
    RegisterTrail(Position),
    DeregisterTrail(Uuid),
    TrailPrice(Uuid, Decimal),
    StopOut(Position),
    /// Already STOPPED when first seen: re-fire only unclaimed triggers.
    RecoverStopOut(Position),
}

pub struct PositionCoordinator {
    client_id: String,
    owned_accounts: Vec<String>,
    store: Arc<dyn Store>,
    feed: Arc<dyn SubscriptionFeed>,
    transport: Arc<dyn CommandTransport>,
    trail: Arc<TrailEngine>,
    resolver: Arc<ConflictResolver>,
    bus: Arc<EventBus>,
    cache: RwLock<PositionCache>,
    refresh_interval: Duration,
}

impl PositionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: impl Into<String>,
        owned_accounts: Vec<String>,
        store: Arc<dyn Store>,
        feed: Arc<dyn SubscriptionFeed>,
        transport: Arc<dyn CommandTransport>,
        trail: Arc<TrailEngine>,
        resolver: Arc<ConflictResolver>,
        bus: Arc<EventBus>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            owned_accounts,
            store,
            feed,
            transport,
            trail,
            resolver,
            bus,
            cache: RwLock::new(PositionCache::default()),
            refresh_interval,
        }
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, PositionCache> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, PositionCache> {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn filter(&self) -> FeedFilter {
        FeedFilter::new().accounts(self.owned_accounts.clone())
    }

    fn owns_account(&self, account_id: &str) -> bool {
        self.owned_accounts.iter().any(|a| a == account_id)
    }

    /// Create a PENDING position and a claimed ENTRY action for it. Execution
    /// continues asynchronously in the action sync engine.
    pub async fn submit_entry(&self, request: EntryRequest) -> Result<Position> {
        if !self.owns_account(&request.account_id) {
            return Err(Error::validation(format!(
                "account {} is not managed by {}",
                request.account_id, self.client_id
            )));
        }
        if request.symbol.trim().is_empty() {
            return Err(Error::validation("entry symbol is empty"));
        }
        if request.volume <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "entry volume must be positive, got {}",
                request.volume
            )));
        }
        if request.trail_width < Decimal::ZERO {
            return Err(Error::validation("trail width must not be negative"));
        }

        let position = Position::pending(
            request.account_id.clone(),
            request.symbol.clone(),
            request.direction,
            request.volume,
            self.client_id.clone(),
        )
        .with_trail(request.trail_width)
        .with_trigger_actions(request.trigger_action_ids);
        let stored = self.store.insert_position(&position).await?;
        self.on_status_event(stored.clone(), SourceChannel::Local);

        let action = Action::new(
            self.client_id.clone(),
            request.account_id,
            ActionKind::Entry {
                symbol: request.symbol,
                direction: request.direction,
                volume: request.volume,
            },
        )
        .for_position(stored.id);
        self.store.insert_action(&action).await?;
        self.store
            .update_action_status_if(action.id, ActionStatus::Pending, ActionStatus::Executing, None)
            .await?;

        info!(
            position_id = %stored.id,
            action_id = %action.id,
            account_id = %stored.account_id,
            symbol = %stored.symbol,
            direction = %stored.direction,
            volume = %stored.volume,
            "Entry submitted"
        );
        Ok(stored)
    }

    /// Move an open position to CLOSING and claim a CLOSE action for it.
    pub async fn request_exit(&self, position_id: Uuid) -> Result<Action> {
        let position = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "position",
                id: position_id.to_string(),
            })?;
        if !position.is_owned_by(&self.client_id) {
            return Err(Error::validation(format!(
                "position {} is owned by {}",
                position_id, position.owner
            )));
        }

        let closing = self
            .owner_transition(position_id, PositionStatus::Closing, None, |_| {})
            .await?;
        if closing.is_none() {
            return Err(Error::InvalidTransition {
                from: position.status.to_string(),
                to: PositionStatus::Closing.to_string(),
            });
        }

        let action = Action::new(
            self.client_id.clone(),
            position.account_id.clone(),
            ActionKind::Close { position_id },
        );
        let action = self.store.insert_action(&action).await?;
        self.store
            .update_action_status_if(action.id, ActionStatus::Pending, ActionStatus::Executing, None)
            .await?;
        info!(position_id = %position_id, action_id = %action.id, "Exit requested");
        Ok(action)
    }

    /// One-step owner transition through a conditional store write.
    /// Returns the stored record, or `None` when there is nothing to do.
    async fn owner_transition<F>(
        &self,
        position_id: Uuid,
        next: PositionStatus,
        reason: Option<String>,
        mutate: F,
    ) -> Result<Option<Position>>
    where
        F: FnOnce(&mut Position) + Send,
    {
        let current = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "position",
                id: position_id.to_string(),
            })?;
        if !current.is_owned_by(&self.client_id) || current.status == next {
            return Ok(None);
        }

        let mut updated = current.clone();
        mutate(&mut updated);
        if let Err(message) = updated.transition(next, reason) {
            warn!(position_id = %position_id, error = %message, "Owner transition refused");
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }

        match self.store.replace_position_if(&updated, current.status).await? {
            Some(stored) => {
                info!(
                    position_id = %position_id,
                    from = %current.status,
                    to = %next,
                    "Position transition written"
                );
                self.on_status_event(stored.clone(), SourceChannel::Local);
                Ok(Some(stored))
            }
            None => {
                warn!(
                    position_id = %position_id,
                    expected = %current.status,
                    "Position changed concurrently, transition dropped"
                );
                Ok(None)
            }
        }
    }

    /// Feed one observed position into the cache. Idempotent: replaying an
    /// applied observation changes nothing.
    pub fn on_status_event(&self, incoming: Position, source: SourceChannel) -> TransitionOutcome {
        let (outcome, effects) = {
            let mut cache = self.write_cache();
            self.observe(&mut cache, incoming, source)
        };
        for effect in effects {
            self.run_side_effect(effect);
        }
        outcome
    }

    fn observe(
        &self,
        cache: &mut PositionCache,
        incoming: Position,
        source: SourceChannel,
    ) -> (TransitionOutcome, Vec<SideEffect>) {
        let position_id = incoming.id;
        let Some(cached) = cache.positions.get(&position_id).cloned() else {
            if incoming.status == PositionStatus::Open && incoming.volume <= Decimal::ZERO {
                return (
                    TransitionOutcome::Rejected {
                        reason: format!("position {} open with volume {}", position_id, incoming.volume),
                    },
                    Vec::new(),
                );
            }
            let to = incoming.status;
            let effects = self.side_effects(None, &incoming);
            cache.apply(CacheMutation::UpsertPosition {
                position: incoming,
                source,
            });
            debug!(position_id = %position_id, status = %to, source = ?source, "Position first observed");
            return (TransitionOutcome::Applied { from: None, to }, effects);
        };

        if cached == incoming {
            return (TransitionOutcome::Unchanged, Vec::new());
        }

        let (incoming_json, cached_json) =
            match (serde_json::to_value(&incoming), serde_json::to_value(&cached)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => {
                    return (
                        TransitionOutcome::Rejected {
                            reason: format!("position {} not serialisable: {}", position_id, e),
                        },
                        Vec::new(),
                    )
                }
            };
        let mut ctx = ConflictContext::new(position_id.to_string(), incoming_json, cached_json, source);
        if let Some(existing_source) = cache.sources.get(&position_id) {
            ctx = ctx.with_existing_source(*existing_source);
        }
        let resolution = self.resolver.resolve_context(ctx);
        if resolution.keeps_existing() {
            trace!(position_id = %position_id, strategy = ?resolution.strategy, "Stale position update");
            return (TransitionOutcome::Stale, Vec::new());
        }

        let mut next: Position = match serde_json::from_value(resolution.value) {
            Ok(p) => p,
            Err(e) => {
                return (
                    TransitionOutcome::Rejected {
                        reason: format!("resolved position {} invalid: {}", position_id, e),
                    },
                    Vec::new(),
                )
            }
        };

        // Trigger actions are fixed once the position has been open.
        if cached.status != PositionStatus::Pending && cached.status != PositionStatus::Opening {
            next.trigger_action_ids = cached.trigger_action_ids.clone();
        }
        next.version = match (cached.version, next.version) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if next == cached {
            return (TransitionOutcome::Unchanged, Vec::new());
        }

        if next.status == cached.status {
            let mut effects = Vec::new();
            if next.is_trail_eligible()
                && !cached.is_trail_eligible()
                && next.is_owned_by(&self.client_id)
                && !self.trail.is_monitored(position_id)
            {
                effects.push(SideEffect::RegisterTrail(next.clone()));
            }
            if next.is_open()
                && next.is_owned_by(&self.client_id)
                && next.current_price != cached.current_price
            {
                effects.push(SideEffect::TrailPrice(position_id, next.current_price));
            }
            cache.apply(CacheMutation::UpsertPosition {
                position: next,
                source,
            });
            return (TransitionOutcome::Updated, effects);
        }

        if !cached.status.reaches(next.status) {
            warn!(
                position_id = %position_id,
                from = %cached.status,
                to = %next.status,
                source = ?source,
                "Unreachable position transition rejected"
            );
            return (
                TransitionOutcome::Rejected {
                    reason: format!("{} cannot become {}", cached.status, next.status),
                },
                Vec::new(),
            );
        }
        if next.status == PositionStatus::Open && next.volume <= Decimal::ZERO {
            return (
                TransitionOutcome::Rejected {
                    reason: format!("position {} open with volume {}", position_id, next.volume),
                },
                Vec::new(),
            );
        }

        let (from, to) = (cached.status, next.status);
        let effects = self.side_effects(Some(from), &next);
        cache.apply(CacheMutation::UpsertPosition {
            position: next,
            source,
        });
        info!(position_id = %position_id, from = %from, to = %to, source = ?source, "Position status applied");
        (
            TransitionOutcome::Applied {
                from: Some(from),
                to,
            },
            effects,
        )
    }

    /// Side effects of entering `next.status`. Only the owner acts.
    fn side_effects(&self, from: Option<PositionStatus>, next: &Position) -> Vec<SideEffect> {
        if !next.is_owned_by(&self.client_id) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        let was_open = from == Some(PositionStatus::Open);
        if !was_open && next.is_trail_eligible() {
            effects.push(SideEffect::RegisterTrail(next.clone()));
        }
        if was_open && !next.is_open() {
            effects.push(SideEffect::DeregisterTrail(next.id));
        }
        if next.status == PositionStatus::Stopped {
            match from {
                None => effects.push(SideEffect::RecoverStopOut(next.clone())),
                Some(PositionStatus::Stopped) => {}
                Some(_) => effects.push(SideEffect::StopOut(next.clone())),
            }
        }
        effects
    }

    fn run_side_effect(&self, effect: SideEffect) {
        match effect {
            SideEffect::RegisterTrail(position) => {
                self.trail.register(&position);
            }
            SideEffect::DeregisterTrail(position_id) => {
                self.trail.deregister(position_id);
            }
            SideEffect::TrailPrice(position_id, price) => {
                self.trail.update_price(position_id, price);
            }
            SideEffect::StopOut(position) => {
                self.trail.deregister(position.id);
                warn!(
                    position_id = %position.id,
                    actions = position.trigger_action_ids.len(),
                    reason = ?position.status_reason,
                    "Position stopped out"
                );
                let report = self.bus.publish(EngineEvent::TriggerActions {
                    position_id: position.id,
                    action_ids: position.trigger_action_ids,
                    reason: TriggerReason::StopOut,
                });
                if !report.is_complete() {
                    error!(position_id = %position.id, "Stop-out trigger rejected by full subscribers");
                }
            }
            SideEffect::RecoverStopOut(position) => {
                if position.trigger_action_ids.is_empty() {
                    return;
                }
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(position_id = %position.id, "No runtime to check stop-out triggers");
                    return;
                };
                runtime.spawn(recover_stop_out(self.store.clone(), self.bus.clone(), position));
            }
        }
    }

    /// Drive owner transitions from action execution events.
    pub async fn handle_engine_event(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::ActionStarted { action } => {
                if action.action_type() != ActionType::Entry || !action.is_owned_by(&self.client_id) {
                    return Ok(());
                }
                if let Some(position_id) = action.position_id {
                    self.owner_transition(position_id, PositionStatus::Opening, None, |_| {})
                        .await?;
                }
            }
            EngineEvent::ActionFinished { action, outcome } => {
                if !action.is_owned_by(&self.client_id) {
                    return Ok(());
                }
                let Some(position_id) = action.position_id else {
                    return Ok(());
                };
                self.on_action_finished(&action, position_id, outcome).await?;
            }
            EngineEvent::TriggerActions { .. } | EngineEvent::HedgeEscalated { .. } => {}
        }
        Ok(())
    }

    async fn on_action_finished(
        &self,
        action: &Action,
        position_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<()> {
        match (action.action_type(), outcome) {
            (ActionType::Entry, ActionOutcome::Executed { ack }) => {
                self.on_entry_filled(action, position_id, ack).await
            }
            (ActionType::Entry, ActionOutcome::Failed { reason }) => {
                self.owner_transition(position_id, PositionStatus::Canceled, Some(reason), |_| {})
                    .await?;
                Ok(())
            }
            (ActionType::Close, ActionOutcome::Executed { .. }) => {
                self.owner_transition(position_id, PositionStatus::Closed, None, |_| {})
                    .await?;
                Ok(())
            }
            (ActionType::Close, ActionOutcome::Failed { reason }) => {
                // Explicit cancellation of the exit.
                self.owner_transition(
                    position_id,
                    PositionStatus::Open,
                    Some(format!("exit failed: {}", reason)),
                    |_| {},
                )
                .await?;
                Ok(())
            }
            (ActionType::ModifyStop, outcome) => {
                debug!(position_id = %position_id, outcome = ?outcome, "Stop modification finished");
                Ok(())
            }
        }
    }

    async fn on_entry_filled(&self, action: &Action, position_id: Uuid, ack: CommandAck) -> Result<()> {
        let requested = match &action.kind {
            ActionKind::Entry { volume, .. } => *volume,
            _ => Decimal::ZERO,
        };
        let filled = ack.filled_volume.unwrap_or(requested);
        if filled <= Decimal::ZERO {
            self.owner_transition(
                position_id,
                PositionStatus::Canceled,
                Some("entry filled with zero volume".to_string()),
                |_| {},
            )
            .await?;
            return Ok(());
        }

        if let Some(current) = self.store.get_position(position_id).await? {
            if current.status == PositionStatus::Pending {
                self.owner_transition(position_id, PositionStatus::Opening, None, |_| {})
                    .await?;
            }
        }
        self.owner_transition(position_id, PositionStatus::Open, None, move |p| {
            p.volume = filled;
            if let Some(price) = ack.fill_price {
                p.entry_price = price;
                p.current_price = price;
            }
            if ack.ticket.is_some() {
                p.ticket = ack.ticket;
            }
        })
        .await?;
        Ok(())
    }

    /// Apply one venue-pushed event.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PositionUpdate { position, .. } => {
                let outcome = self.on_status_event(position, SourceChannel::Transport);
                trace!(outcome = ?outcome, "Transport position update");
            }
            TransportEvent::AccountUpdate { account, .. } => {
                self.write_cache()
                    .apply(CacheMutation::UpsertAccount(account));
            }
            TransportEvent::EntryResult {
                command_id,
                success,
                message,
                ..
            } => {
                if success {
                    debug!(command_id = %command_id, "Entry result received");
                } else {
                    warn!(command_id = %command_id, message = ?message, "Entry rejected by venue");
                }
            }
            TransportEvent::Heartbeat { .. } => {}
        }
    }

    fn handle_feed_item(&self, item: FeedItem) {
        match item.entity {
            FeedEntity::Position(position) => {
                self.on_status_event(position, SourceChannel::Subscription);
            }
            FeedEntity::Account(account) => {
                self.write_cache()
                    .apply(CacheMutation::UpsertAccount(account));
            }
            FeedEntity::Action(_) => {}
        }
    }

    /// Reload owned positions and accounts from the store.
    pub async fn refresh_from_store(&self) -> Result<usize> {
        let filter = self.filter();
        let positions = self.store.list_positions(&filter).await?;
        let accounts = self.store.list_accounts(&filter).await?;

        let mut changed = 0;
        for position in positions {
            match self.on_status_event(position, SourceChannel::Subscription) {
                TransitionOutcome::Unchanged | TransitionOutcome::Stale => {}
                _ => changed += 1,
            }
        }
        let mut cache = self.write_cache();
        for account in accounts {
            cache.apply(CacheMutation::UpsertAccount(account));
        }
        cache.apply(CacheMutation::Refreshed(Utc::now()));
        Ok(changed)
    }

    async fn subscribe(&self, kind: EntityKind) -> Option<mpsc::Receiver<FeedItem>> {
        match self.feed.subscribe(kind, self.filter()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(kind = ?kind, error = %e, "Coordinator feed subscription failed");
                None
            }
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            client_id = %self.client_id,
            accounts = self.owned_accounts.len(),
            "Starting position coordinator"
        );

        let mut transport_rx = self.transport.subscribe_events("position-coordinator");
        let mut bus_rx = self.bus.subscribe_filtered("position-coordinator", |event| {
            matches!(
                event,
                EngineEvent::ActionStarted { .. } | EngineEvent::ActionFinished { .. }
            )
        });
        let mut position_rx = self.subscribe(EntityKind::Position).await;
        let mut account_rx = self.subscribe(EntityKind::Account).await;

        if let Err(e) = self.refresh_from_store().await {
            warn!(error = %e, "Initial cache refresh failed");
        }

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                item = next_item(&mut position_rx) => match item {
                    Some(item) => self.handle_feed_item(item),
                    None => {
                        warn!("Position feed closed");
                        position_rx = None;
                    }
                },
                item = next_item(&mut account_rx) => match item {
                    Some(item) => self.handle_feed_item(item),
                    None => {
                        warn!("Account feed closed");
                        account_rx = None;
                    }
                },
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                Some(event) = bus_rx.recv() => {
                    if let Err(e) = self.handle_engine_event(event).await {
                        error!(error = %e, "Engine event handling failed");
                    }
                }
                _ = ticker.tick() => {
                    if position_rx.is_none() {
                        position_rx = self.subscribe(EntityKind::Position).await;
                    }
                    if account_rx.is_none() {
                        account_rx = self.subscribe(EntityKind::Account).await;
                    }
                    if let Err(e) = self.refresh_from_store().await {
                        warn!(error = %e, "Cache refresh failed");
                    }
                }
            }
        }

        info!("Position coordinator stopped");
        Ok(())
    }

    pub fn get_realtime_snapshot(&self) -> RealtimeSnapshot {
        self.read_cache().snapshot()
    }

    pub fn get_position(&self, position_id: Uuid) -> Option<Position> {
        self.read_cache().positions.get(&position_id).cloned()
    }
}

impl PositionSnapshots for PositionCoordinator {
    fn positions(&self) -> Vec<Position> {
        self.read_cache().positions.values().cloned().collect()
    }
}

async fn next_item(rx: &mut Option<mpsc::Receiver<FeedItem>>) -> Option<FeedItem> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recover_stop_out(store: Arc<dyn Store>, bus: Arc<EventBus>, position: Position) {
    let mut pending = Vec::new();
    for &action_id in &position.trigger_action_ids {
        match store.get_action(action_id).await {
            Ok(Some(action)) if action.status == ActionStatus::Pending => pending.push(action_id),
            Ok(_) => {}
            Err(e) => {
                warn!(position_id = %position.id, action_id = %action_id, error = %e, "Stop-out trigger lookup failed");
                return;
            }
        }
    }
    if pending.is_empty() {
        debug!(position_id = %position.id, "Stop-out triggers already handled");
        return;
    }

    info!(
        position_id = %position.id,
        actions = pending.len(),
        "Re-firing unclaimed stop-out triggers"
    );
    let report = bus.publish(EngineEvent::TriggerActions {
        position_id: position.id,
        action_ids: pending,
        reason: TriggerReason::StopOut,
    });
    if !report.is_complete() {
        error!(position_id = %position.id, "Stop-out trigger rejected by full subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hedge_core::store::MemoryStore;
    use hedge_core::venue::PaperVenue;

    struct Harness {
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        trail: Arc<TrailEngine>,
        coordinator: PositionCoordinator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(64));
        let trail = Arc::new(TrailEngine::new(bus.clone()));
        let coordinator = PositionCoordinator::new(
            "client-a",
            vec!["acc-1".to_string()],
            store.clone(),
            store.clone(),
            Arc::new(PaperVenue::new()),
            trail.clone(),
            Arc::new(ConflictResolver::new(100)),
            bus.clone(),
            Duration::from_secs(1),
        );
        Harness {
            store,
            bus,
            trail,
            coordinator,
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn observed(owner: &str, status: PositionStatus) -> Position {
        let mut position = Position::pending("acc-1", "EURUSD", Direction::Buy, Decimal::ONE, owner)
            .with_prices(dec("1.1000"), dec("1.1000"))
            .with_trail(Decimal::new(20, 0));
        position.status = status;
        position
    }

    fn later(position: &Position, status: PositionStatus, secs: i64) -> Position {
        let mut next = position.clone();
        next.status = status;
        next.updated_at = position.updated_at + ChronoDuration::seconds(secs);
        next
    }

    async fn entry_action(h: &Harness, position_id: Uuid) -> Action {
        h.store
            .list_actions(&FeedFilter::new(), Some(ActionStatus::Executing))
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.position_id == Some(position_id))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_entry_creates_pending_and_claims_action() {
        let h = harness();
        let position = h
            .coordinator
            .submit_entry(EntryRequest::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE))
            .await
            .unwrap();
        assert_eq!(position.status, PositionStatus::Pending);
        assert_eq!(position.owner, "client-a");

        let action = entry_action(&h, position.id).await;
        assert_eq!(action.action_type(), ActionType::Entry);
        assert!(h.coordinator.get_position(position.id).is_some());
    }

    #[tokio::test]
    async fn test_submit_entry_validation() {
        let h = harness();
        let unowned = EntryRequest::new("acc-9", "EURUSD", Direction::Buy, Decimal::ONE);
        let zero = EntryRequest::new("acc-1", "EURUSD", Direction::Buy, Decimal::ZERO);
        let blank = EntryRequest::new("acc-1", "", Direction::Sell, Decimal::ONE);
        for request in [unowned, zero, blank] {
            assert!(matches!(
                h.coordinator.submit_entry(request).await,
                Err(Error::Validation { .. })
            ));
        }
        assert_eq!(h.store.position_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_lifecycle_registers_trail() {
        let h = harness();
        let position = h
            .coordinator
            .submit_entry(
                EntryRequest::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE)
                    .with_trail(Decimal::new(20, 0)),
            )
            .await
            .unwrap();
        let action = entry_action(&h, position.id).await;

        h.coordinator
            .handle_engine_event(EngineEvent::ActionStarted {
                action: action.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            h.coordinator.get_position(position.id).unwrap().status,
            PositionStatus::Opening
        );

        let ack = CommandAck::filled(action.id, dec("1.1002"), Decimal::ONE).with_ticket("T9");
        h.coordinator
            .handle_engine_event(EngineEvent::ActionFinished {
                action,
                outcome: ActionOutcome::Executed { ack },
            })
            .await
            .unwrap();

        let open = h.store.get_position(position.id).await.unwrap().unwrap();
        assert_eq!(open.status, PositionStatus::Open);
        assert_eq!(open.entry_price, dec("1.1002"));
        assert_eq!(open.ticket.as_deref(), Some("T9"));
        assert!(h.trail.is_monitored(position.id));
        assert_eq!(h.coordinator.get_position(position.id), Some(open));
    }

    #[tokio::test]
    async fn test_entry_failure_cancels() {
        let h = harness();
        let position = h
            .coordinator
            .submit_entry(EntryRequest::new("acc-1", "EURUSD", Direction::Sell, Decimal::ONE))
            .await
            .unwrap();
        let action = entry_action(&h, position.id).await;

        h.coordinator
            .handle_engine_event(EngineEvent::ActionFinished {
                action,
                outcome: ActionOutcome::Failed {
                    reason: "Execution error: market closed".to_string(),
                },
            })
            .await
            .unwrap();

        let canceled = h.coordinator.get_position(position.id).unwrap();
        assert_eq!(canceled.status, PositionStatus::Canceled);
        assert!(canceled.status_message().contains("market closed"));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let h = harness();
        let base = observed("client-b", PositionStatus::Opening);
        h.coordinator.on_status_event(base.clone(), SourceChannel::Subscription);

        let update = later(&base, PositionStatus::Open, 2);
        let first = h.coordinator.on_status_event(update.clone(), SourceChannel::Transport);
        let after_first = h.coordinator.get_realtime_snapshot();
        let second = h.coordinator.on_status_event(update, SourceChannel::Transport);

        assert_eq!(
            first,
            TransitionOutcome::Applied {
                from: Some(PositionStatus::Opening),
                to: PositionStatus::Open
            }
        );
        assert_eq!(second, TransitionOutcome::Unchanged);
        assert_eq!(h.coordinator.get_realtime_snapshot().positions, after_first.positions);
    }

    #[tokio::test]
    async fn test_older_update_is_stale() {
        let h = harness();
        let base = observed("client-b", PositionStatus::Open);
        let closing = later(&base, PositionStatus::Closing, 5);
        h.coordinator.on_status_event(closing.clone(), SourceChannel::Transport);

        let outcome = h.coordinator.on_status_event(base, SourceChannel::Transport);
        assert_eq!(outcome, TransitionOutcome::Stale);
        assert_eq!(
            h.coordinator.get_position(closing.id).unwrap().status,
            PositionStatus::Closing
        );
    }

    #[tokio::test]
    async fn test_illegal_and_unreachable_transitions_rejected() {
        let h = harness();
        let closed = observed("client-b", PositionStatus::Closed);
        h.coordinator.on_status_event(closed.clone(), SourceChannel::Subscription);

        let reopened = later(&closed, PositionStatus::Open, 3);
        let outcome = h.coordinator.on_status_event(reopened, SourceChannel::Transport);
        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
        assert_eq!(
            h.coordinator.get_position(closed.id).unwrap().status,
            PositionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_observation_may_skip_states() {
        let h = harness();
        let pending = observed("client-b", PositionStatus::Pending);
        h.coordinator.on_status_event(pending.clone(), SourceChannel::Subscription);

        let open = later(&pending, PositionStatus::Open, 1);
        assert_eq!(
            h.coordinator.on_status_event(open.clone(), SourceChannel::Transport),
            TransitionOutcome::Applied {
                from: Some(PositionStatus::Pending),
                to: PositionStatus::Open
            }
        );

        let closed = later(&open, PositionStatus::Closed, 1);
        assert_eq!(
            h.coordinator.on_status_event(closed, SourceChannel::Transport),
            TransitionOutcome::Applied {
                from: Some(PositionStatus::Open),
                to: PositionStatus::Closed
            }
        );

        let mut empty = observed("client-b", PositionStatus::Open);
        empty.volume = Decimal::ZERO;
        assert!(matches!(
            h.coordinator.on_status_event(empty, SourceChannel::Transport),
            TransitionOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_open_with_zero_volume_rejected() {
        let h = harness();
        let opening = observed("client-b", PositionStatus::Opening);
        h.coordinator.on_status_event(opening.clone(), SourceChannel::Subscription);

        let mut open = later(&opening, PositionStatus::Open, 1);
        open.volume = Decimal::ZERO;
        assert!(matches!(
            h.coordinator.on_status_event(open, SourceChannel::Transport),
            TransitionOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_non_owner_observes_only() {
        let h = harness();
        let foreign = observed("client-b", PositionStatus::Open);
        h.coordinator.on_status_event(foreign.clone(), SourceChannel::Subscription);
        assert!(!h.trail.is_monitored(foreign.id));

        let mine = observed("client-a", PositionStatus::Open);
        h.coordinator.on_status_event(mine.clone(), SourceChannel::Subscription);
        assert!(h.trail.is_monitored(mine.id));
    }

    #[tokio::test]
    async fn test_stop_out_fires_trigger_actions() {
        let h = harness();
        let mut events = h.bus.subscribe("test");
        let trigger = Uuid::new_v4();
        let open = observed("client-a", PositionStatus::Open).with_trigger_actions(vec![trigger]);
        h.coordinator.on_status_event(open.clone(), SourceChannel::Subscription);
        assert!(h.trail.is_monitored(open.id));

        // Trigger ids cannot be rewritten once open.
        let mut stopped = later(&open, PositionStatus::Stopped, 1);
        stopped.trigger_action_ids = Vec::new();
        stopped.status_reason = Some("margin call".to_string());
        h.coordinator.on_status_event(stopped, SourceChannel::Transport);

        assert!(!h.trail.is_monitored(open.id));
        match events.recv().await.unwrap() {
            EngineEvent::TriggerActions {
                position_id,
                action_ids,
                reason,
            } => {
                assert_eq!(position_id, open.id);
                assert_eq!(action_ids, vec![trigger]);
                assert_eq!(reason, TriggerReason::StopOut);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_seen_stop_out_refires_only_unclaimed_triggers() {
        let h = harness();
        let mut events = h.bus.subscribe("test");
        let kind = ActionKind::Close {
            position_id: Uuid::new_v4(),
        };
        let done = h
            .store
            .insert_action(&Action::new("client-a", "acc-1", kind.clone()).with_status(ActionStatus::Executed))
            .await
            .unwrap();
        let pending = h
            .store
            .insert_action(&Action::new("client-a", "acc-1", kind))
            .await
            .unwrap();

        let stopped = observed("client-a", PositionStatus::Stopped)
            .with_trigger_actions(vec![done.id, pending.id]);
        h.store.insert_position(&stopped).await.unwrap();
        assert_eq!(h.coordinator.refresh_from_store().await.unwrap(), 1);
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(EngineEvent::TriggerActions { action_ids, reason, .. })) => {
                assert_eq!(action_ids, vec![pending.id]);
                assert_eq!(reason, TriggerReason::StopOut);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A settled historic stop-out stays quiet after a restart.
        let settled = observed("client-a", PositionStatus::Stopped).with_trigger_actions(vec![done.id]);
        h.store.insert_position(&settled).await.unwrap();
        assert_eq!(h.coordinator.refresh_from_store().await.unwrap(), 1);
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_trail_enabled_on_open_position_registers_monitor() {
        let h = harness();
        let mut open = observed("client-a", PositionStatus::Open);
        open.trail_width = Decimal::ZERO;
        h.coordinator.on_status_event(open.clone(), SourceChannel::Subscription);
        assert!(!h.trail.is_monitored(open.id));

        let mut trailed = later(&open, PositionStatus::Open, 1);
        trailed.trail_width = Decimal::new(20, 0);
        assert_eq!(
            h.coordinator.on_status_event(trailed, SourceChannel::Subscription),
            TransitionOutcome::Updated
        );
        assert!(h.trail.is_monitored(open.id));
    }

    #[tokio::test]
    async fn test_price_updates_feed_trail() {
        let h = harness();
        let open = observed("client-a", PositionStatus::Open);
        h.coordinator.on_status_event(open.clone(), SourceChannel::Subscription);

        let mut up = later(&open, PositionStatus::Open, 1);
        up.current_price = dec("1.1050");
        assert_eq!(
            h.coordinator.on_status_event(up.clone(), SourceChannel::Transport),
            TransitionOutcome::Updated
        );
        let state = &h.trail.get_monitored_positions()[0];
        assert_eq!(state.best_price, dec("1.1050"));

        let mut down = later(&up, PositionStatus::Open, 1);
        down.current_price = dec("1.1030");
        h.coordinator.on_status_event(down, SourceChannel::Transport);
        assert!(!h.trail.is_monitored(open.id));
    }

    #[tokio::test]
    async fn test_exit_request_and_failed_exit() {
        let h = harness();
        let position = h
            .coordinator
            .submit_entry(EntryRequest::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE))
            .await
            .unwrap();
        let entry = entry_action(&h, position.id).await;
        h.coordinator
            .handle_engine_event(EngineEvent::ActionFinished {
                action: entry,
                outcome: ActionOutcome::Executed {
                    ack: CommandAck::filled(Uuid::new_v4(), dec("1.1"), Decimal::ONE),
                },
            })
            .await
            .unwrap();

        let close = h.coordinator.request_exit(position.id).await.unwrap();
        assert_eq!(close.action_type(), ActionType::Close);
        assert_eq!(
            h.coordinator.get_position(position.id).unwrap().status,
            PositionStatus::Closing
        );
        assert!(matches!(
            h.coordinator.request_exit(position.id).await,
            Err(Error::InvalidTransition { .. })
        ));

        h.coordinator
            .handle_engine_event(EngineEvent::ActionFinished {
                action: close,
                outcome: ActionOutcome::Failed {
                    reason: "requote".to_string(),
                },
            })
            .await
            .unwrap();
        let reopened = h.coordinator.get_position(position.id).unwrap();
        assert_eq!(reopened.status, PositionStatus::Open);
        assert!(reopened.status_reason.unwrap().contains("requote"));
    }

    #[tokio::test]
    async fn test_refresh_and_snapshot() {
        let h = harness();
        let stored = h
            .store
            .insert_position(&observed("client-a", PositionStatus::Pending))
            .await
            .unwrap();
        h.store
            .upsert_account(&AccountSnapshot::new("acc-1", "client-a", Decimal::ONE_THOUSAND))
            .await
            .unwrap();

        assert_eq!(h.coordinator.refresh_from_store().await.unwrap(), 1);
        assert_eq!(h.coordinator.refresh_from_store().await.unwrap(), 0);

        let snapshot = h.coordinator.get_realtime_snapshot();
        assert!(snapshot.position(stored.id).is_some());
        assert!(snapshot.accounts.contains_key("acc-1"));
        assert!(snapshot.refreshed_at.is_some());
        assert_eq!(h.coordinator.positions().len(), 1);
    }
}
