use std::future::Future;
use std::time::Duration;

use crate::model::{Ms, Sector};

use super::{Engine, EngineError};

// ── Capacity ledger ──────────────────────────────────────────────
//
// Both steps compute the next sector row from the one that was read. The
// caller stages it with `Txn::update_sector`, so the decrement/increment only
// lands if the sector's version is still the one it was computed from.

/// Take one place. Fails when the sector is inactive or full.
pub(crate) fn reserve_slot(sector: &Sector, now: Ms) -> Result<Sector, EngineError> {
    if !sector.is_active_at(now) || sector.available_places == 0 {
        return Err(EngineError::CapacityExhausted(sector.id));
    }
    let mut next = sector.clone();
    next.available_places -= 1;
    Ok(next)
}

/// Give one place back. Going above `max_places` means the counters and the
/// gate log disagree, which is reported rather than clamped.
pub(crate) fn release_slot(sector: &Sector) -> Result<Sector, EngineError> {
    if sector.available_places >= sector.max_places {
        return Err(EngineError::CapacityOverflow(sector.id));
    }
    let mut next = sector.clone();
    next.available_places += 1;
    Ok(next)
}

impl Engine {
    /// Run `attempt` until it stops losing row compare-and-swaps, at most
    /// `capacity_retries` times. Each attempt re-reads everything, so a loser
    /// sees the winner's state (e.g. a reservation the sweeper just expired).
    pub(super) async fn with_contention_retry<T, F, Fut>(
        &self,
        op: &'static str,
        mut attempt: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = self.config.capacity_retries.max(1);
        let mut n = 0;
        loop {
            n += 1;
            match attempt().await {
                Err(e) if e.is_row_contention() && n < attempts => {
                    metrics::counter!(crate::observability::CONTENTION_RETRIES_TOTAL, "op" => op)
                        .increment(1);
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1u64 << (n - 1).min(16));
                    tracing::debug!("{op}: lost row race, retry {n}/{attempts} in {backoff}ms");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SectorType;
    use ulid::Ulid;

    fn sector(max: u32, available: u32) -> Sector {
        Sector {
            id: Ulid::new(),
            parking_id: Ulid::new(),
            name: "AA-01".into(),
            kind: SectorType::Underground,
            max_places: max,
            available_places: available,
            weight: 1,
            active: true,
            deactivation_time: None,
            version: 3,
        }
    }

    #[test]
    fn reserve_decrements_without_touching_version() {
        let s = sector(10, 10);
        let next = reserve_slot(&s, 0).unwrap();
        assert_eq!(next.available_places, 9);
        // The store bumps the version at commit.
        assert_eq!(next.version, 3);
    }

    #[test]
    fn reserve_fails_when_full_or_inactive() {
        let full = sector(1, 0);
        assert_eq!(reserve_slot(&full, 0), Err(EngineError::CapacityExhausted(full.id)));

        let mut inactive = sector(5, 5);
        inactive.active = false;
        assert_eq!(
            reserve_slot(&inactive, 0),
            Err(EngineError::CapacityExhausted(inactive.id))
        );

        let mut lapsed = sector(5, 5);
        lapsed.deactivation_time = Some(100);
        assert!(reserve_slot(&lapsed, 99).is_ok());
        assert!(reserve_slot(&lapsed, 100).is_err());
    }

    #[test]
    fn release_increments() {
        let s = sector(10, 2);
        assert_eq!(release_slot(&s).unwrap().available_places, 3);
    }

    #[test]
    fn release_on_full_sector_is_reported() {
        let s = sector(4, 4);
        let err = release_slot(&s).unwrap_err();
        assert_eq!(err, EngineError::CapacityOverflow(s.id));
        assert_eq!(err.kind(), crate::engine::ErrorKind::Internal);
    }

    #[test]
    fn release_works_on_inactive_sector() {
        let mut s = sector(4, 1);
        s.active = false;
        assert_eq!(release_slot(&s).unwrap().available_places, 2);
    }
}
