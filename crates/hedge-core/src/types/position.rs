//! Position lifecycle types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of a position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry requested, nothing sent to the venue yet.
    Pending,
    /// Entry command in flight.
    Opening,
    /// Fill confirmed with volume > 0.
    Open,
    /// Exit requested, awaiting confirmation.
    Closing,
    /// Exit fill confirmed.
    Closed,
    /// Venue forced the position closed (stop-out).
    Stopped,
    /// Entry execution failed.
    Canceled,
}

impl PositionStatus {
    pub const ALL: [PositionStatus; 7] = [
        Self::Pending,
        Self::Opening,
        Self::Open,
        Self::Closing,
        Self::Closed,
        Self::Stopped,
        Self::Canceled,
    ];

    /// Direct successors in the transition graph.
    pub fn successors(self) -> &'static [PositionStatus] {
        match self {
            Self::Pending => &[Self::Opening, Self::Canceled],
            Self::Opening => &[Self::Open, Self::Canceled],
            Self::Open => &[Self::Closing, Self::Stopped],
            // Exit failure writes the position back to Open.
            Self::Closing => &[Self::Closed, Self::Open],
            Self::Closed | Self::Stopped | Self::Canceled => &[],
        }
    }

    /// One-step transition check, used for owner-initiated writes.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Whether `next` can be reached through one or more valid transitions.
    ///
    /// Observed updates may skip states that were never seen locally (an OPEN
    /// fill arriving before the OPENING write), so observations are checked
    /// against reachability rather than adjacency.
    pub fn reaches(self, next: PositionStatus) -> bool {
        let mut seen = vec![self];
        let mut frontier = vec![self];
        while let Some(current) = frontier.pop() {
            for &succ in current.successors() {
                if succ == next {
                    return true;
                }
                if !seen.contains(&succ) {
                    seen.push(succ);
                    frontier.push(succ);
                }
            }
        }
        false
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Stopped | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Stopped => "STOPPED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price increment of one pip for a symbol.
pub fn pip_size(symbol: &str) -> Decimal {
    let upper = symbol.to_ascii_uppercase();
    if upper.contains("JPY") {
        Decimal::new(1, 2)
    } else if upper.starts_with("XAU") {
        Decimal::new(1, 1)
    } else {
        Decimal::new(1, 4)
    }
}

/// A position held on one broker account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    /// Owning broker account.
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Volume in lots.
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub status: PositionStatus,
    /// Trailing-stop width in pips. Zero disables trailing.
    #[serde(default)]
    pub trail_width: Decimal,
    /// Actions fired when the position is force-closed or its trail triggers.
    #[serde(default)]
    pub trigger_action_ids: Vec<Uuid>,
    /// Identity of the client process allowed to act on this position.
    pub owner: String,
    /// Venue ticket once the entry is filled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    /// Human-readable reason for the latest terminal or failed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Store-assigned record version; venue-originated updates carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a new pending position.
    pub fn pending(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        volume: Decimal,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            symbol: symbol.into(),
            direction,
            volume,
            entry_price: Decimal::ZERO,
            current_price: Decimal::ZERO,
            status: PositionStatus::Pending,
            trail_width: Decimal::ZERO,
            trigger_action_ids: Vec::new(),
            owner: owner.into(),
            ticket: None,
            status_reason: None,
            version: None,
            created_at: now,
            updated_at: now,
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

    pub fn with_prices(mut self, entry_price: Decimal, current_price: Decimal) -> Self {
        self.entry_price = entry_price;
        self.current_price = current_price;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Open with a positive trail width.
    pub fn is_trail_eligible(&self) -> bool {
        self.is_open() && self.trail_width > Decimal::ZERO
    }

    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.owner == identity
    }

    /// Trail width converted to a price distance.
    pub fn trail_distance(&self) -> Decimal {
        self.trail_width * pip_size(&self.symbol)
    }

    /// Volume with sign: positive for buys, negative for sells.
    pub fn signed_volume(&self) -> Decimal {
        match self.direction {
            Direction::Buy => self.volume,
            Direction::Sell => -self.volume,
        }
    }

    /// Apply a one-step status transition.
    pub fn transition(
        &mut self,
        next: PositionStatus,
        reason: Option<String>,
    ) -> std::result::Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "Cannot transition position {} from {} to {}",
                self.id, self.status, next
            ));
        }
        if next == PositionStatus::Open && self.volume <= Decimal::ZERO {
            return Err(format!(
                "Cannot open position {} with volume {}",
                self.id, self.volume
            ));
        }
        self.status = next;
        self.status_reason = reason;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Get a human-readable status message.
    pub fn status_message(&self) -> String {
        match self.status {
            PositionStatus::Pending => "Awaiting entry execution".to_string(),
            PositionStatus::Opening => "Entry in progress".to_string(),
            PositionStatus::Open => format!(
                "Open {} {} {} @ {}",
                self.direction, self.volume, self.symbol, self.entry_price
            ),
            PositionStatus::Closing => "Exit in progress".to_string(),
            PositionStatus::Closed => "Closed".to_string(),
            PositionStatus::Stopped | PositionStatus::Canceled => match &self.status_reason {
                Some(reason) => format!("{}: {}", self.status, reason),
                None => self.status.to_string(),
            },
        }
    }
}
