use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::CommandTransport;
use crate::bus::Fanout;
use crate::types::{Command, CommandAck, TransportEvent};
use crate::{Error, Result};

/// Simulated venue that fills every valid command at a configured price.
pub struct PaperVenue {
    prices: DashMap<String, Decimal>,
    rejected_accounts: DashSet<String>,
    rejected_positions: DashSet<Uuid>,
    sent: Mutex<Vec<Command>>,
    events: Fanout<TransportEvent>,
    latency_ms: AtomicU64,
    offline: AtomicBool,
    next_ticket: AtomicU64,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
            rejected_accounts: DashSet::new(),
            rejected_positions: DashSet::new(),
            sent: Mutex::new(Vec::new()),
            events: Fanout::new(1024),
            latency_ms: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_ascii_uppercase(), price);
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(&symbol.to_ascii_uppercase()).map(|p| *p)
    }

    /// Reject every open command for `account_id`.
    pub fn reject_account(&self, account_id: &str) {
        self.rejected_accounts.insert(account_id.to_string());
    }

    pub fn accept_account(&self, account_id: &str) {
        self.rejected_accounts.remove(account_id);
    }

    /// Reject close and modify-stop commands for `position_id`.
    pub fn reject_position(&self, position_id: Uuid) {
        self.rejected_positions.insert(position_id);
    }

    /// Delay every acknowledgement, to exercise command timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every command received, in arrival order.
    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Push an event to every listener, as the venue would.
    pub fn emit(&self, event: TransportEvent) {
        let report = self.events.publish(event);
        if !report.is_complete() {
            warn!(rejected = ?report.rejected, "Venue event rejected by full listeners");
        }
    }

    fn fill(&self, command: &Command) -> CommandAck {
        match command {
            Command::Open {
                command_id,
                account_id,
                symbol,
                volume,
                ..
            } => {
                if self.rejected_accounts.contains(account_id) {
                    return CommandAck::rejected(
                        *command_id,
                        format!("account {} rejected the order", account_id),
                    );
                }
                let Some(price) = self.price(symbol) else {
                    return CommandAck::rejected(*command_id, format!("no quote for {}", symbol));
                };
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                CommandAck::filled(*command_id, price, *volume).with_ticket(format!("T{}", ticket))
            }
            Command::Close {
                command_id,
                position_id,
            }
            | Command::ModifyStop {
                command_id,
                position_id,
                ..
            } => {
                if self.rejected_positions.contains(position_id) {
                    CommandAck::rejected(*command_id, format!("position {} is locked", position_id))
                } else {
                    CommandAck::accepted(*command_id)
                }
            }
        }
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandTransport for PaperVenue {
    async fn send(&self, command: Command) -> Result<CommandAck> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::connection("paper venue offline"));
        }
        command.validate()?;

        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command.clone());

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let ack = self.fill(&command);
        debug!(
            command_id = %ack.command_id,
            command = command.name(),
            success = ack.success,
            "Paper venue acknowledged command"
        );

        if let Command::Open { .. } = command {
            self.emit(TransportEvent::EntryResult {
                command_id: ack.command_id,
                success: ack.success,
                ticket: ack.ticket.clone(),
                fill_price: ack.fill_price,
                filled_volume: ack.filled_volume,
                message: ack.message.clone(),
                timestamp: Utc::now(),
            });
        }
        if ack.success {
            info!(command_id = %ack.command_id, command = command.name(), "Paper fill");
        }
        Ok(ack)
    }

    fn subscribe_events(&self, name: &str) -> mpsc::Receiver<TransportEvent> {
        self.events.subscribe(name)
    }
}
