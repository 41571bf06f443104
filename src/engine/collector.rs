//! The retry collector: periodically re-submits eligible resolutions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::EngineInner;
use crate::errors::EngineResult;
use crate::resolution::ResolutionState;
use crate::retry::RetryPattern;
use crate::store::RunnableResolution;

pub(crate) fn spawn_retry_collector(
    inner: Arc<EngineInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = inner.config.retry_collector_interval.as_secs(),
            batch_size = inner.config.collector_batch_size,
            "starting retry collector",
        );
        let mut ticker = interval(inner.config.retry_collector_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match collect(&inner).await {
                        Ok(submitted) if submitted > 0 => {
                            debug!(count = submitted, "collector submitted resolutions");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            metrics::counter!("cairn_collector_errors_total").increment(1);
                            error!(error = %err, "collector tick failed");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("retry collector stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// One collector tick: fetch due resolutions, re-arm crashed ones, submit in
/// round-robin order across templates so one noisy template cannot starve the
/// rest.
pub(crate) async fn collect(inner: &Arc<EngineInner>) -> EngineResult<usize> {
    let now = Utc::now();
    let candidates = inner
        .store
        .find_runnable(now, inner.config.collector_batch_size)
        .await?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut by_template: BTreeMap<String, Vec<RunnableResolution>> = BTreeMap::new();
    for candidate in candidates {
        by_template
            .entry(candidate.template_name.clone())
            .or_default()
            .push(candidate);
    }

    let mut submitted = 0;
    let mut queues: Vec<Vec<RunnableResolution>> = by_template.into_values().collect();
    loop {
        let mut progressed = false;
        for queue in queues.iter_mut() {
            let Some(candidate) = queue.pop() else {
                continue;
            };
            progressed = true;
            if candidate.state == ResolutionState::Crashed
                && !rearm_crashed(inner, candidate.id, now).await?
            {
                continue;
            }
            if inner.submit_tx.try_send(candidate.id).is_err() {
                debug!("submission queue full, deferring to next tick");
                return Ok(submitted);
            }
            submitted += 1;
        }
        if !progressed {
            break;
        }
    }
    Ok(submitted)
}

/// Move a crashed resolution back into the schedulable set, backing off on
/// repeated crashes via the run counter. Returns whether it is due now.
async fn rearm_crashed(
    inner: &Arc<EngineInner>,
    resolution_id: Uuid,
    now: chrono::DateTime<chrono::Utc>,
) -> EngineResult<bool> {
    let resolution = inner.store.get_resolution(resolution_id).await?;
    let backoff = RetryPattern::Seconds.delay(resolution.run_count.min(10));
    let due = now + backoff;
    inner
        .store
        .set_resolution_state(resolution_id, ResolutionState::RetryNow, Some(due))
        .await?;
    metrics::counter!("cairn_resolutions_recovered_total").increment(1);
    Ok(due <= now)
}
