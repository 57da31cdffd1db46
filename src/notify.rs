use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle news for a reservation's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ReservationCreated {
        reservation_id: Ulid,
        sector_id: Ulid,
        begin: Ms,
        end: Ms,
    },
    ReservationCancelled {
        reservation_id: Ulid,
    },
    ReservationExpired {
        reservation_id: Ulid,
    },
    ForcedExit {
        reservation_id: Ulid,
        sector_id: Ulid,
        at: Ms,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Best-effort delivery. The engine logs failures and moves on, and only
/// calls this after the transaction has committed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, client_id: Ulid, notification: &Notification) -> Result<(), NotifyError>;
}

/// In-process fan-out: one broadcast channel per client.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a client's notifications. Creates the channel if needed.
    pub fn subscribe(&self, client_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(client_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, client_id: Ulid, notification: &Notification) {
        if let Some(sender) = self.channels.get(&client_id) {
            let _ = sender.send(notification.clone());
        }
    }

    pub fn remove(&self, client_id: &Ulid) {
        self.channels.remove(client_id);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, client_id: Ulid, notification: &Notification) -> Result<(), NotifyError> {
        self.send(client_id, notification);
        Ok(())
    }
}

/// Writes each notification to the log as JSON. Stand-in for a mailer.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, client_id: Ulid, notification: &Notification) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notification).map_err(|e| NotifyError(e.to_string()))?;
        tracing::info!(%client_id, "notify {body}");
        Ok(())
    }
}
