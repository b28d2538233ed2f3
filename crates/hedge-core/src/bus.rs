//! In-process event fan-out.
//!
//! Every subscriber owns a bounded channel. When a subscriber's channel is
//! full the new event is rejected for that subscriber and reported back to the
//! publisher; events already queued are never discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};
use uuid::Uuid;

use crate::types::{Action, CommandAck};

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    name: String,
    sender: mpsc::Sender<T>,
    filter: Option<Filter<T>>,
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose queue was full; the event was not enqueued for them.
    pub rejected: Vec<String>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Named, bounded, reject-new fan-out channel.
pub struct Fanout<T: Clone> {
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber<T>>>,
    published: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Clone + Send + 'static> Fanout<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<T> {
        self.add(name.into(), None)
    }

    /// Subscribe to events accepted by `filter`.
    pub fn subscribe_filtered<F>(&self, name: impl Into<String>, filter: F) -> mpsc::Receiver<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.add(name.into(), Some(Arc::new(filter)))
    }

    fn add(&self, name: String, filter: Option<Filter<T>>) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        debug!(subscriber = %name, capacity = self.capacity, "Subscriber registered");
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Subscriber {
            name,
            sender,
            filter,
        });
        receiver
    }

    pub fn publish(&self, event: T) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed = false;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for subscriber in subscribers.iter() {
                if let Some(filter) = &subscriber.filter {
                    if !filter(&event) {
                        continue;
                    }
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        error!(
                            subscriber = %subscriber.name,
                            capacity = self.capacity,
                            "Subscriber queue full, event rejected"
                        );
                        report.rejected.push(subscriber.name.clone());
                    }
                    Err(TrySendError::Closed(_)) => closed = true,
                }
            }
        }
        if closed {
            self.prune();
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        report
    }

    fn prune(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|s| {
            let open = !s.sender.is_closed();
            if !open {
                debug!(subscriber = %s.name, "Pruning closed subscriber");
            }
            open
        });
    }

    /// Drop every subscriber, closing their receivers.
    pub fn close_all(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Why trigger actions fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerReason {
    TrailingStop {
        best_price: Decimal,
        trigger_price: Decimal,
    },
    StopOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    Executed { ack: CommandAck },
    Failed { reason: String },
}

/// Events exchanged between engines of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TriggerActions {
        position_id: Uuid,
        action_ids: Vec<Uuid>,
        reason: TriggerReason,
    },
    ActionStarted {
        action: Action,
    },
    ActionFinished {
        action: Action,
        outcome: ActionOutcome,
    },
    HedgeEscalated {
        hedge_id: Uuid,
        reason: String,
    },
}

pub type EventBus = Fanout<EngineEvent>;
