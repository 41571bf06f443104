//! Task-state gauge refresher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::store::Store;

/// Refresh `cairn_task_state{state,template,group}` from the store's
/// aggregation query on a fixed period. The exporter endpoint itself lives
/// outside the engine; this only feeds the process-wide metrics recorder.
pub(crate) fn spawn_state_gauge(
    store: Arc<dyn Store>,
    refresh_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    refresh(store.as_ref()).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("state gauge refresher stopping");
                        break;
                    }
                }
            }
        }
    })
}

async fn refresh(store: &dyn Store) {
    let counts = match store.count_task_states().await {
        Ok(counts) => counts,
        Err(err) => {
            warn!(error = %err, "task state aggregation failed");
            return;
        }
    };
    for row in counts {
        metrics::gauge!(
            "cairn_task_state",
            "state" => row.state,
            "template" => row.template,
            "group" => row.group,
        )
        .set(row.count as f64);
    }
}
