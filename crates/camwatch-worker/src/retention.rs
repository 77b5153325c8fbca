//! Periodic purge of old events and snapshots.

use std::sync::Arc;
use std::time::Duration;

use camwatch_models::TaskId;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::WorkerResult;
use crate::metrics;
use crate::store::{EventStore, PurgeReport, PurgeScope};

/// Run one sweep: each configured task is purged with its own retention
/// window, external events with `external_days`.
pub async fn sweep_once(
    store: &dyn EventStore,
    now: DateTime<Utc>,
    external_days: u32,
) -> WorkerResult<PurgeReport> {
    let mut scopes: Vec<PurgeScope> = store
        .list_configs()
        .await?
        .into_iter()
        .map(|spec| PurgeScope::Task {
            task_id: TaskId::from_string(spec.task_id),
            before: now - chrono::Duration::days(i64::from(spec.retention_days)),
        })
        .collect();
    scopes.push(PurgeScope::External {
        before: now - chrono::Duration::days(i64::from(external_days)),
    });

    let mut total = PurgeReport::default();
    for scope in &scopes {
        match store.purge_events(scope).await {
            Ok(report) => {
                metrics::record_events_purged(scope.label(), report.events);
                total.events += report.events;
                total.snapshots += report.snapshots;
            }
            Err(e) => warn!(scope = scope.label(), "Purge failed: {}", e),
        }
    }

    if total.events > 0 {
        info!(
            events = total.events,
            snapshots = total.snapshots,
            "Retention sweep purged old events"
        );
    }
    Ok(total)
}

/// Spawn the periodic sweeper. The first sweep runs immediately.
pub fn spawn(
    store: Arc<dyn EventStore>,
    interval: Duration,
    external_days: u32,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = sweep_once(store.as_ref(), Utc::now(), external_days).await {
                warn!("Retention sweep failed: {}", e);
            }
        }
    })
}
