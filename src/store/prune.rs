//! Periodic removal of expired codes and tokens.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::{PruneCutoffs, PruneReport, Store, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneSchedule {
    code_ttl: Duration,
    access_ttl: Duration,
    refresh_ttl: Duration,
    interval: std::time::Duration,
}

impl PruneSchedule {
    #[must_use]
    pub fn new(code_ttl_seconds: i64, access_ttl_seconds: i64, refresh_ttl_seconds: i64) -> Self {
        Self {
            code_ttl: Duration::seconds(code_ttl_seconds),
            access_ttl: Duration::seconds(access_ttl_seconds),
            refresh_ttl: Duration::seconds(refresh_ttl_seconds),
            interval: std::time::Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn interval(&self) -> std::time::Duration {
        self.interval
    }

    #[must_use]
    pub fn cutoffs(&self, now: DateTime<Utc>) -> PruneCutoffs {
        PruneCutoffs {
            codes_before: now - self.code_ttl,
            bearers_before: now - self.access_ttl,
            refresh_before: now - self.refresh_ttl,
        }
    }
}

/// Run one pass against `now`.
///
/// # Errors
/// Storage failures.
pub async fn prune_once(
    store: &dyn Store,
    schedule: &PruneSchedule,
    now: DateTime<Utc>,
) -> Result<PruneReport, StoreError> {
    let report = store.prune_expired(&schedule.cutoffs(now)).await?;
    if report.total() > 0 {
        info!(
            codes = report.codes,
            bearers = report.bearers,
            refresh_tokens = report.refresh_tokens,
            "expired credentials pruned"
        );
    } else {
        debug!("nothing to prune");
    }
    Ok(report)
}

/// Prune on a fixed interval until the task is aborted. The first pass runs
/// immediately.
pub fn spawn_prune_task(store: Arc<dyn Store>, schedule: PruneSchedule) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(schedule.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = prune_once(store.as_ref(), &schedule, Utc::now()).await {
                error!("Failed to prune expired credentials: {err:#}");
            }
        }
    })
}
