//! Renewal Coordinator
//!
//! Single source of truth for one entity's attachments. `renew()` refetches
//! the whole entity and republishes it; a background timer does the same
//! before signed URLs run out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fm_core::{BackendResult, EntityRef};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::model::{Attachment, AttachmentKey, ThreadSnapshot};
use crate::renderer::{RenewalError, UrlRenewer};
use crate::source::ThreadSource;

/// Shortest interval the proactive timer accepts
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Counters over the coordinator's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Owns the current snapshot of one ticket or inspection report
pub struct RenewalCoordinator<S: ThreadSource + ?Sized> {
    source: Arc<S>,
    entity: EntityRef,
    snapshot_tx: watch::Sender<Option<ThreadSnapshot>>,
    renewed_at: Mutex<Option<Instant>>,
    counters: Counters,
}

impl<S: ThreadSource + ?Sized> RenewalCoordinator<S> {
    /// Create a coordinator with no snapshot yet; call [`renew`](Self::renew)
    /// to load one.
    pub fn new(source: Arc<S>, entity: EntityRef) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            source,
            entity,
            snapshot_tx,
            renewed_at: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Refetch the entity and replace the snapshot wholesale.
    ///
    /// Concurrent calls each refetch; whichever completes last is kept.
    #[instrument(skip(self), fields(entity = %self.entity, source = self.source.name()))]
    pub async fn renew(&self) -> BackendResult<()> {
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        match self.source.fetch(&self.entity).await {
            Ok(snapshot) => {
                let attachments = snapshot.all_attachments().count();
                self.snapshot_tx.send_replace(Some(snapshot));
                *self.renewed_at.lock() = Some(Instant::now());
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);

                debug!(attachments, "Attachment URLs renewed");
                Ok(())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, transient = e.is_transient(), "Failed to renew attachment URLs");
                Err(e)
            }
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Option<ThreadSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive every republished snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<ThreadSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Current version of one attachment
    pub fn attachment(&self, key: &AttachmentKey) -> Option<Attachment> {
        self.snapshot_tx
            .borrow()
            .as_ref()
            .and_then(|snapshot| snapshot.get(key).cloned())
    }

    /// Time since the last successful renewal
    pub fn snapshot_age(&self) -> Option<Duration> {
        self.renewed_at.lock().map(|at| at.elapsed())
    }

    pub fn stats(&self) -> RenewalStats {
        RenewalStats {
            started: self.counters.started.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl<S: ThreadSource + ?Sized + 'static> RenewalCoordinator<S> {
    /// This coordinator as a renderer callback
    pub fn renewer(self: &Arc<Self>) -> Arc<dyn UrlRenewer> {
        Arc::clone(self) as Arc<dyn UrlRenewer>
    }

    /// Renew every `interval` until the handle is stopped or dropped.
    ///
    /// The first tick fires one interval after the call. Each tick renews on
    /// its own task, so a slow fetch never delays the next tick. The timer
    /// holds only a weak reference and ends once the coordinator is gone.
    pub fn start_proactive_refresh(self: &Arc<Self>, interval: Duration) -> RefreshHandle {
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let entity = self.entity.clone();

        info!(
            entity = %entity,
            interval_secs = interval.as_secs_f64(),
            "Starting proactive URL refresh"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(coordinator) = weak.upgrade() else {
                    break;
                };

                debug!(entity = %entity, "Proactive refresh tick");
                tokio::spawn(async move {
                    // Failures are logged by renew()
                    let _ = coordinator.renew().await;
                });
            }

            debug!(entity = %entity, "Proactive URL refresh stopped");
        });

        RefreshHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[async_trait]
impl<S: ThreadSource + ?Sized + 'static> UrlRenewer for RenewalCoordinator<S> {
    async fn renew_urls(&self) -> Result<(), RenewalError> {
        self.renew().await.map_err(RenewalError::from)
    }
}

impl<S: ThreadSource + ?Sized> std::fmt::Debug for RenewalCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalCoordinator")
            .field("entity", &self.entity)
            .field("source", &self.source.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scope of a proactive refresh timer
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Stop ticking; renewals already started still complete
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.stop();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryThreadSource;
    use fm_core::BackendError;

    async fn coordinator() -> (
        Arc<MemoryThreadSource>,
        Arc<RenewalCoordinator<MemoryThreadSource>>,
    ) {
        let source = Arc::new(MemoryThreadSource::new());
        let ticket = EntityRef::ticket("7");
        source
            .insert(
                ticket.clone(),
                "Leaking roof",
                vec![Attachment::new("a1", "image/jpeg", "")],
            )
            .await;
        let coordinator = Arc::new(RenewalCoordinator::new(Arc::clone(&source), ticket));
        (source, coordinator)
    }

    fn url_of(coordinator: &RenewalCoordinator<MemoryThreadSource>) -> String {
        coordinator
            .attachment(&AttachmentKey::entity("a1"))
            .map(|a| a.url)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_renew_publishes_snapshot() {
        let (source, coordinator) = coordinator().await;
        assert!(coordinator.snapshot().is_none());

        let mut rx = coordinator.subscribe();
        coordinator.renew().await.unwrap();

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone().unwrap();
        assert_eq!(snapshot.title.as_deref(), Some("Leaking roof"));
        assert!(source.is_valid(&url_of(&coordinator)));
        assert!(coordinator.snapshot_age().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_renewals_each_fetch() {
        let (source, coordinator) = coordinator().await;

        let (a, b) = tokio::join!(coordinator.renew(), coordinator.renew());
        assert!(a.is_ok() && b.is_ok());

        assert_eq!(source.fetch_count(), 2);
        assert_eq!(coordinator.stats().succeeded, 2);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_previous_snapshot() {
        let (source, coordinator) = coordinator().await;
        coordinator.renew().await.unwrap();
        let before = url_of(&coordinator);

        source.fail_next_fetches(1);
        let result = coordinator.renew().await;

        assert!(matches!(result, Err(BackendError::Connection(_))));
        assert_eq!(url_of(&coordinator), before);
        assert_eq!(
            coordinator.stats(),
            RenewalStats {
                started: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_renewer_maps_backend_errors() {
        let (source, coordinator) = coordinator().await;
        let renewer = coordinator.renewer();

        assert!(renewer.renew_urls().await.is_ok());

        source.fail_next_fetches(1);
        assert!(matches!(
            renewer.renew_urls().await,
            Err(RenewalError::Backend(BackendError::Connection(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_ticks() {
        let (source, coordinator) = coordinator().await;
        let handle = coordinator.start_proactive_refresh(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(source.fetch_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.fetch_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.fetch_count(), 3);
        assert!(handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_stops_on_drop() {
        let (source, coordinator) = coordinator().await;
        let handle = coordinator.start_proactive_refresh(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(source.fetch_count(), 1);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_timer_task() {
        let (source, coordinator) = coordinator().await;
        let handle = coordinator.start_proactive_refresh(Duration::from_secs(60));

        handle.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!handle.is_running());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ends_with_coordinator() {
        let (source, coordinator) = coordinator().await;
        let handle = coordinator.start_proactive_refresh(Duration::from_secs(60));

        drop(coordinator);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!handle.is_running());
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_overlapping_user_renewal() {
        let (source, coordinator) = coordinator().await;
        // The user-triggered fetch is slow, the proactive one is fast
        source.delay_next_fetches([Duration::from_secs(30), Duration::ZERO]);
        let handle = coordinator.start_proactive_refresh(Duration::from_secs(10));

        let user = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.renew().await })
        };
        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.stop();

        // The tick finished first
        assert_eq!(coordinator.stats().succeeded, 1);
        let after_tick = url_of(&coordinator);

        user.await.unwrap().unwrap();

        let final_url = url_of(&coordinator);
        assert_ne!(final_url, after_tick);
        assert_eq!(coordinator.stats().succeeded, 2);
        assert_eq!(source.fetch_count(), 2);
    }
}
