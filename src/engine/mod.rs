mod allocation;
mod error;
mod ledger;
mod lifecycle;
mod queries;
mod registry;
pub mod store;

pub use allocation::choose;
pub use error::{EngineError, Entity, ErrorKind, FieldViolation};
pub use registry::{NewSector, SectorUpdate};

use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::{Notification, Notifier};

use store::Store;

/// Parking core: registry, reservation lifecycle and capacity accounting
/// over one versioned store.
pub struct Engine {
    store: Store,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl Engine {
    /// Open (or create) the engine's WAL and replay it. Must run inside a
    /// tokio runtime: the WAL writer is a spawned task.
    pub fn open(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> std::io::Result<Self> {
        Ok(Self {
            store: Store::open(wal_path)?,
            notifier,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Deliver after commit. Failures are logged, never returned.
    async fn notify(&self, client_id: Option<Ulid>, notification: Notification) {
        let Some(client_id) = client_id else { return };
        if let Err(e) = self.notifier.notify(client_id, &notification).await {
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
            tracing::warn!(%client_id, "{e}");
        }
    }

    pub async fn compact(&self) -> Result<(), EngineError> {
        Ok(self.store.compact().await?)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }
}

/// Registry edits are for operators and scheduled jobs only.
fn require_privileged(ctx: &ExecutionContext) -> Result<(), EngineError> {
    if ctx.caller.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("registry changes require an admin"))
    }
}

fn check_version(
    entity: Entity,
    id: Ulid,
    expected: Version,
    actual: Version,
) -> Result<(), EngineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(EngineError::VersionMismatch {
            entity,
            id,
            expected: Some(expected),
            actual: Some(actual),
        })
    }
}
