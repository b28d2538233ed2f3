//! Command and event envelopes exchanged with the execution venue.
//!
//! Both directions are closed tagged unions keyed by `"type"`. Inbound JSON is
//! decoded and validated here, before any engine sees it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountSnapshot;
use super::position::{Direction, Position};
use crate::{Error, Result};

/// Command sent to the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Open {
        command_id: Uuid,
        account_id: String,
        symbol: String,
        direction: Direction,
        volume: Decimal,
    },
    Close {
        command_id: Uuid,
        position_id: Uuid,
    },
    ModifyStop {
        command_id: Uuid,
        position_id: Uuid,
        new_stop_price: Decimal,
    },
}

impl Command {
    pub fn command_id(&self) -> Uuid {
        match self {
            Self::Open { command_id, .. }
            | Self::Close { command_id, .. }
            | Self::ModifyStop { command_id, .. } => *command_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::ModifyStop { .. } => "modify_stop",
        }
    }

    /// Reject malformed commands before they are sent.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Open {
                account_id,
                symbol,
                volume,
                ..
            } => {
                if account_id.trim().is_empty() {
                    return Err(Error::validation("open command has empty account id"));
                }
                if symbol.trim().is_empty() {
                    return Err(Error::validation("open command has empty symbol"));
                }
                if *volume <= Decimal::ZERO {
                    return Err(Error::validation(format!(
                        "open command volume must be positive, got {}",
                        volume
                    )));
                }
            }
            Self::Close { position_id, .. } => {
                if position_id.is_nil() {
                    return Err(Error::validation("close command has nil position id"));
                }
            }
            Self::ModifyStop {
                position_id,
                new_stop_price,
                ..
            } => {
                if position_id.is_nil() {
                    return Err(Error::validation("modify_stop command has nil position id"));
                }
                if *new_stop_price <= Decimal::ZERO {
                    return Err(Error::validation(format!(
                        "modify_stop price must be positive, got {}",
                        new_stop_price
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }
}

/// Venue acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_volume: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CommandAck {
    pub fn filled(command_id: Uuid, fill_price: Decimal, filled_volume: Decimal) -> Self {
        Self {
            command_id,
            success: true,
            ticket: None,
            fill_price: Some(fill_price),
            filled_volume: Some(filled_volume),
            message: None,
            received_at: Utc::now(),
        }
    }

    pub fn accepted(command_id: Uuid) -> Self {
        Self {
            command_id,
            success: true,
            ticket: None,
            fill_price: None,
            filled_volume: None,
            message: None,
            received_at: Utc::now(),
        }
    }

    pub fn rejected(command_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            ticket: None,
            fill_price: None,
            filled_volume: None,
            message: Some(message.into()),
            received_at: Utc::now(),
        }
    }

    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }
}

/// Event pushed by the venue over the low-latency transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    PositionUpdate {
        position: Position,
        timestamp: DateTime<Utc>,
    },
    AccountUpdate {
        account: AccountSnapshot,
        timestamp: DateTime<Utc>,
    },
    EntryResult {
        command_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fill_price: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filled_volume: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl TransportEvent {
    /// Decode and validate a raw JSON envelope.
    pub fn decode(raw: &str) -> Result<Self> {
        let event: TransportEvent = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("malformed transport event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::PositionUpdate { position, .. } => {
                if position.account_id.trim().is_empty() || position.symbol.trim().is_empty() {
                    return Err(Error::validation(format!(
                        "position update {} missing account or symbol",
                        position.id
                    )));
                }
                if position.volume < Decimal::ZERO
                    || position.entry_price < Decimal::ZERO
                    || position.current_price < Decimal::ZERO
                    || position.trail_width < Decimal::ZERO
                {
                    return Err(Error::validation(format!(
                        "position update {} has negative numeric fields",
                        position.id
                    )));
                }
            }
            Self::AccountUpdate { account, .. } => {
                if account.account_id.trim().is_empty() {
                    return Err(Error::validation("account update has empty account id"));
                }
            }
            Self::EntryResult {
                fill_price,
                filled_volume,
                ..
            } => {
                let negative = |v: &Option<Decimal>| v.map(|d| d < Decimal::ZERO).unwrap_or(false);
                if negative(fill_price) || negative(filled_volume) {
                    return Err(Error::validation("entry result has negative fill values"));
                }
            }
            Self::Heartbeat { .. } => {}
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PositionUpdate { .. } => "position_update",
            Self::AccountUpdate { .. } => "account_update",
            Self::EntryResult { .. } => "entry_result",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}
