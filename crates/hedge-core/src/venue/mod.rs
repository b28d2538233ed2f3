//! Execution venue seam.

mod paper;

pub use paper::PaperVenue;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Command, CommandAck, TransportEvent};
use crate::Result;

/// Low-latency command/event transport to the execution venue.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Send a validated command and wait for the venue's acknowledgement.
    async fn send(&self, command: Command) -> Result<CommandAck>;

    /// Register a named listener for venue-pushed events.
    fn subscribe_events(&self, name: &str) -> mpsc::Receiver<TransportEvent>;
}
