//! Thread view
//!
//! Wires one coordinator to the renderers of every attachment in a ticket or
//! inspection report chat, and sends new messages through the compressor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fm_core::config::ClientConfig;
use fm_core::{BackendError, BackendResult, EntityRef};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::compress::{compress_many_lossy, CompressionBudget};
use crate::coordinator::{RefreshHandle, RenewalCoordinator};
use crate::model::{AttachmentKey, PendingFile, ThreadMessage, ThreadSnapshot};
use crate::renderer::{
    AttachmentRenderer, DisplayState, MediaLoader, RenderVariant, RendererSettings, UrlRenewer,
};
use crate::source::ThreadSource;

/// Settings for one open thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSettings {
    pub budget: CompressionBudget,
    /// None disables the proactive timer
    pub proactive_refresh: Option<Duration>,
    pub renderer: RendererSettings,
    pub variant: RenderVariant,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ThreadSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            budget: config.compression.into(),
            proactive_refresh: Some(config.renewal.proactive_refresh()),
            renderer: config.renewal.into(),
            variant: RenderVariant::Inline,
        }
    }
}

type RendererList = Vec<(AttachmentKey, Arc<AttachmentRenderer>)>;

/// An open ticket or inspection report chat
pub struct ThreadView<S: ThreadSource + ?Sized + 'static> {
    coordinator: Arc<RenewalCoordinator<S>>,
    renderers: Arc<RwLock<RendererList>>,
    settings: ThreadSettings,
    refresh: Option<RefreshHandle>,
    sync_task: Option<JoinHandle<()>>,
}

impl<S: ThreadSource + ?Sized + 'static> ThreadView<S> {
    /// Fetch the entity, build its renderers and start keeping URLs fresh
    #[instrument(skip(source, entity, settings), fields(entity = %entity, backend = source.name()))]
    pub async fn open(
        source: Arc<S>,
        entity: EntityRef,
        settings: ThreadSettings,
    ) -> BackendResult<Self> {
        let coordinator = Arc::new(RenewalCoordinator::new(source, entity));
        let mut snapshots = coordinator.subscribe();
        coordinator.renew().await?;

        let renderers = Arc::new(RwLock::new(Vec::new()));
        let renewer = coordinator.renewer();
        if let Some(snapshot) = snapshots.borrow_and_update().as_ref() {
            sync_renderers(&renderers, snapshot, &renewer, &settings);
        }

        let sync_task = {
            let renderers = Arc::clone(&renderers);
            tokio::spawn(async move {
                while snapshots.changed().await.is_ok() {
                    let snapshot = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        sync_renderers(&renderers, &snapshot, &renewer, &settings);
                    }
                }
            })
        };

        let refresh = settings
            .proactive_refresh
            .map(|interval| coordinator.start_proactive_refresh(interval));

        info!(
            attachments = renderers.read().len(),
            proactive_refresh = refresh.is_some(),
            "Thread opened"
        );

        Ok(Self {
            coordinator,
            renderers,
            settings,
            refresh,
            sync_task: Some(sync_task),
        })
    }

    pub fn coordinator(&self) -> &Arc<RenewalCoordinator<S>> {
        &self.coordinator
    }

    pub fn settings(&self) -> &ThreadSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> Option<ThreadSnapshot> {
        self.coordinator.snapshot()
    }

    pub fn renderer(&self, key: &AttachmentKey) -> Option<Arc<AttachmentRenderer>> {
        self.renderers
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, r)| Arc::clone(r))
    }

    /// First renderer showing the attachment with this id
    pub fn renderer_for(&self, attachment_id: &str) -> Option<Arc<AttachmentRenderer>> {
        self.renderers
            .read()
            .iter()
            .find(|(k, _)| k.attachment_id == attachment_id)
            .map(|(_, r)| Arc::clone(r))
    }

    /// Renderers in display order
    pub fn renderers(&self) -> RendererList {
        self.renderers.read().clone()
    }

    /// Drive every renderer until it settles
    pub async fn render_all(&self, loader: &dyn MediaLoader) -> Vec<(AttachmentKey, DisplayState)> {
        let renderers = self.renderers();
        let states = futures::future::join_all(
            renderers.iter().map(|(_, renderer)| renderer.render(loader)),
        )
        .await;

        renderers.into_iter().map(|(key, _)| key).zip(states).collect()
    }

    /// Renew now and push the result to the renderers before returning
    pub async fn refresh(&self) -> BackendResult<()> {
        self.coordinator.renew().await?;
        self.sync();
        Ok(())
    }

    /// Compress `files`, post them with `body`, then reload the thread.
    ///
    /// Files the compressor rejects are left out of the upload.
    #[instrument(
        skip(self, body, files),
        fields(entity = %self.coordinator.entity(), files = files.len())
    )]
    pub async fn send_message(
        &self,
        body: Option<&str>,
        files: Vec<PendingFile>,
    ) -> BackendResult<ThreadMessage> {
        let body = body.map(str::trim).filter(|b| !b.is_empty());
        if body.is_none() && files.is_empty() {
            return Err(BackendError::InvalidRequest(
                "a message needs text or at least one file".to_string(),
            ));
        }

        let selected = files.len();
        let files = compress_many_lossy(files, self.settings.budget).await;
        let skipped = selected - files.len();
        if body.is_none() && files.is_empty() {
            return Err(BackendError::InvalidRequest(
                "none of the selected files could be prepared for upload".to_string(),
            ));
        }

        let message = self
            .coordinator
            .source()
            .post_message(self.coordinator.entity(), body, files)
            .await?;

        info!(
            message = %message.id,
            attachments = message.attachments.len(),
            skipped,
            "Message posted"
        );

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Thread reload after posting failed");
        }

        Ok(message)
    }

    /// Stop the proactive timer and snapshot propagation
    pub fn close(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.stop();
        }
        if let Some(task) = self.sync_task.take() {
            task.abort();
            debug!(entity = %self.coordinator.entity(), "Thread closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.sync_task.is_some()
    }

    fn sync(&self) {
        if let Some(snapshot) = self.coordinator.snapshot() {
            let renewer = self.coordinator.renewer();
            sync_renderers(&self.renderers, &snapshot, &renewer, &self.settings);
        }
    }
}

impl<S: ThreadSource + ?Sized + 'static> Drop for ThreadView<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reconcile renderers with a snapshot: reuse by key, add new, drop removed
fn sync_renderers(
    renderers: &RwLock<RendererList>,
    snapshot: &ThreadSnapshot,
    renewer: &Arc<dyn UrlRenewer>,
    settings: &ThreadSettings,
) {
    let mut current = renderers.write();
    let mut previous: HashMap<AttachmentKey, Arc<AttachmentRenderer>> =
        current.drain(..).collect();

    let next: RendererList = snapshot
        .keyed_attachments()
        .map(|(key, attachment)| {
            let renderer = match previous.remove(&key) {
                Some(renderer) => {
                    renderer.set_attachment(attachment.clone());
                    renderer
                }
                None => Arc::new(AttachmentRenderer::new(
                    attachment.clone(),
                    Some(Arc::clone(renewer)),
                    settings.variant,
                    settings.renderer,
                )),
            };
            (key, renderer)
        })
        .collect();

    if !previous.is_empty() {
        debug!(removed = previous.len(), "Dropping renderers for removed attachments");
    }
    *current = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::tests::{encode, textured_image};
    use crate::model::Attachment;
    use crate::renderer::LoadError;
    use crate::source::MemoryThreadSource;
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::{DynamicImage, ImageFormat};

    /// Loads whatever the storage still considers validly signed
    struct SignedUrlLoader(Arc<MemoryThreadSource>);

    #[async_trait]
    impl MediaLoader for SignedUrlLoader {
        async fn load(&self, src: &str) -> Result<(), LoadError> {
            if self.0.is_valid(src) {
                Ok(())
            } else {
                Err(LoadError::Status(403))
            }
        }
    }

    fn settings() -> ThreadSettings {
        ThreadSettings {
            budget: CompressionBudget::new(100_000, 400),
            proactive_refresh: None,
            renderer: RendererSettings::default(),
            variant: RenderVariant::Inline,
        }
    }

    async fn open_ticket(
        settings: ThreadSettings,
    ) -> (Arc<MemoryThreadSource>, ThreadView<MemoryThreadSource>) {
        let source = Arc::new(MemoryThreadSource::new());
        let ticket = EntityRef::ticket("42");
        source
            .insert(
                ticket.clone(),
                "Elevator noise",
                vec![Attachment::new("a1", "image/jpeg", "").with_name("cabin.jpg")],
            )
            .await;
        source
            .push_message(
                &ticket,
                ThreadMessage {
                    id: "m1".to_string(),
                    author: Some("building manager".to_string()),
                    body: Some("Technician report attached".to_string()),
                    created_at: None,
                    attachments: vec![Attachment::new("r1", "application/pdf", "")],
                },
            )
            .await;

        let view = ThreadView::open(Arc::clone(&source), ticket, settings)
            .await
            .unwrap();
        (source, view)
    }

    #[tokio::test]
    async fn test_open_builds_renderers() {
        let (source, view) = open_ticket(settings()).await;

        let renderers = view.renderers();
        assert_eq!(renderers.len(), 2);
        assert_eq!(renderers[0].0, AttachmentKey::entity("a1"));
        assert_eq!(renderers[1].0, AttachmentKey::message("m1", "r1"));
        assert!(renderers.iter().all(|(_, r)| r.has_renewer()));

        let pdf = view.renderer_for("r1").unwrap();
        assert!(source.is_valid(&pdf.attachment().url));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_open_unknown_entity_fails() {
        let source = Arc::new(MemoryThreadSource::new());
        let result =
            ThreadView::open(source, EntityRef::inspection_report("9"), settings()).await;
        assert!(matches!(result, Err(BackendError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_urls_recover_through_parent() {
        let (source, view) = open_ticket(settings()).await;
        let loader = SignedUrlLoader(Arc::clone(&source));

        // The thread sat unrendered past the signature lifetime
        source.expire_urls();
        let states = view.render_all(&loader).await;

        assert!(states.iter().all(|(_, s)| s.is_loaded()), "{:?}", states);
        for (_, renderer) in view.renderers() {
            assert!(source.is_valid(&renderer.attachment().url));
            assert!(renderer.episode().is_none());
        }
        // Initial fetch plus at most one renewal per renderer
        assert!(source.fetch_count() >= 2);
        assert!(source.fetch_count() <= 3);
    }

    #[tokio::test]
    async fn test_loaded_thread_needs_no_renewal() {
        let (source, view) = open_ticket(settings()).await;
        let loader = SignedUrlLoader(Arc::clone(&source));

        let states = view.render_all(&loader).await;

        assert!(states.iter().all(|(_, s)| s.is_loaded()));
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(view.coordinator().stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_send_message_compresses_and_reloads() {
        let (source, view) = open_ticket(settings()).await;
        let photo = PendingFile::from_name(
            "facade.png",
            encode(DynamicImage::ImageRgb8(textured_image(1200, 900)), ImageFormat::Png),
        );
        let quote = PendingFile::from_name("quote.pdf", Bytes::from_static(b"%PDF-1.4"));
        let broken = PendingFile::new("broken.png", "image/png", Bytes::from(vec![7u8; 200_000]));

        let message = view
            .send_message(Some("  Photos from today  "), vec![photo, quote, broken])
            .await
            .unwrap();

        assert_eq!(message.body.as_deref(), Some("Photos from today"));
        assert_eq!(message.attachments.len(), 2);

        let uploads = source.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].content_type, "image/jpeg");
        assert_eq!(uploads[0].name, "facade.jpg");
        assert!(uploads[0].size() <= 100_000);
        assert_eq!(uploads[1].bytes, Bytes::from_static(b"%PDF-1.4"));

        // Reload after posting replaced the list
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(view.renderers().len(), 4);
        let key = AttachmentKey::message(message.id.clone(), message.attachments[0].id.clone());
        assert!(view.renderer(&key).is_some());
    }

    #[tokio::test]
    async fn test_send_message_requires_content() {
        let (source, view) = open_ticket(settings()).await;

        let result = view.send_message(Some("   "), Vec::new()).await;
        assert!(matches!(result, Err(BackendError::InvalidRequest(_))));

        let broken = PendingFile::new("broken.jpg", "image/jpeg", Bytes::from(vec![0u8; 200_000]));
        let result = view.send_message(None, vec![broken]).await;
        assert!(matches!(result, Err(BackendError::InvalidRequest(_))));

        assert!(source.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_renderers() {
        let (_source, view) = open_ticket(settings()).await;
        let before = view.renderer_for("a1").unwrap();
        let old_url = before.attachment().url;

        view.refresh().await.unwrap();

        let after = view.renderer_for("a1").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_ne!(after.attachment().url, old_url);
        assert!(matches!(after.state(), DisplayState::Loading { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_updates_renderers() {
        let mut settings = settings();
        settings.proactive_refresh = Some(Duration::from_secs(1800));
        let (source, mut view) = open_ticket(settings).await;
        let first_url = view.renderer_for("a1").unwrap().attachment().url;

        tokio::time::sleep(Duration::from_secs(1801)).await;

        assert_eq!(source.fetch_count(), 2);
        let renewed = view.renderer_for("a1").unwrap().attachment().url;
        assert_ne!(renewed, first_url);

        view.close();
        assert!(!view.is_open());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn test_settings_from_config() {
        let config = ClientConfig::default();
        let settings = ThreadSettings::from(&config);

        assert_eq!(settings.budget, CompressionBudget::new(1_048_576, 1920));
        assert_eq!(settings.proactive_refresh, Some(Duration::from_secs(1800)));
        assert_eq!(settings.renderer.settle_delay, Duration::from_millis(500));
    }
}
