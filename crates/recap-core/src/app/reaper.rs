//! Reaper - lease 期限切れの回収
//!
//! `dequeue_and_lock` も期限切れ lease を直接拾えるので、reaper は必須ではない。
//! 回すと、落ちた worker の job が `pending` として見える（counts が正しくなる）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::ports::QueueStore;

pub(crate) async fn reaper_loop(
    store: Arc<dyn QueueStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "reaper started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match store.reap_expired_leases().await {
            Ok(released) if released.is_empty() => {}
            Ok(released) => info!(count = released.len(), "expired leases returned to pending"),
            Err(e) => error!(error = %e, "lease reaping failed"),
        }
    }

    debug!("reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, JobState, WorkerId};
    use crate::impls::InMemoryQueueStore;

    #[tokio::test]
    async fn reaper_releases_expired_leases_until_shutdown() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
        let id = store
            .enqueue(JobKind::new("summarize"), serde_json::json!({ "meetingId": "m1" }))
            .await
            .unwrap();
        store
            .dequeue_and_lock(&WorkerId::new("crashed-0"), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let reaper = tokio::spawn(reaper_loop(Arc::clone(&store), Duration::from_millis(20), rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);

        tx.send(true).unwrap();
        reaper.await.unwrap();
    }
}
