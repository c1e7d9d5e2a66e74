//! Attachment Renderer
//!
//! Per-attachment state machine that displays a signed URL, notices when it
//! stops resolving, and asks its parent for fresh URLs.
//!
//! ```text
//! Loading ──ok──▶ Loaded
//!    │
//!   fail
//!    ▼
//! Errored ──renewer──▶ RenewingViaParent ──renewed + settle──▶ Loading (cache-busted)
//!    │                        │
//!    │                     failed
//!    │                        ▼
//!    └──────retry()─────── Errored ──retry()──▶ Loading (cache-busted)
//! ```
//!
//! A load that fails after a renewal already completed in the same episode
//! ends in `Errored`; the next automatic renewal needs a successful load or a
//! manual retry first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fm_core::config::RenewalConfig;
use fm_core::BackendError;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache_bust::cache_bust;
use crate::model::Attachment;

/// Why a renewal could not complete
#[derive(Debug, Clone, Error)]
pub enum RenewalError {
    #[error("Renewal request failed: {0}")]
    Backend(#[from] BackendError),
    #[error("Renewal unavailable: {0}")]
    Unavailable(String),
}

/// Why the rendering surface could not show a URL
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("no URL to load")]
    EmptyUrl,
    #[error("rejected with HTTP {0}")]
    Status(u16),
    #[error("network failure: {0}")]
    Network(String),
    #[error("undecodable content: {0}")]
    Decode(String),
}

/// Callback that gets the parent to re-issue attachment URLs
#[async_trait]
pub trait UrlRenewer: Send + Sync {
    async fn renew_urls(&self) -> Result<(), RenewalError>;
}

/// Adapts an async closure into a [`UrlRenewer`]
pub struct FnRenewer<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> UrlRenewer for FnRenewer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RenewalError>> + Send,
{
    async fn renew_urls(&self) -> Result<(), RenewalError> {
        (self.f)().await
    }
}

/// Wrap a closure as a shareable renewer
pub fn renewer_fn<F, Fut>(f: F) -> Arc<dyn UrlRenewer>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RenewalError>> + Send + 'static,
{
    Arc::new(FnRenewer { f })
}

/// Surface that actually fetches and decodes a URL
#[async_trait]
pub trait MediaLoader: Send + Sync {
    async fn load(&self, src: &str) -> Result<(), LoadError>;
}

/// Layout slot the attachment is drawn in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderVariant {
    /// Small square in message bubbles
    Thumbnail,
    /// Inline in the conversation
    #[default]
    Inline,
    /// Full-size viewer
    Gallery,
}

impl RenderVariant {
    /// Fixed placeholder size, so swapping states never shifts layout
    pub fn placeholder_size(&self) -> (u32, u32) {
        match self {
            Self::Thumbnail => (96, 96),
            Self::Inline => (240, 180),
            Self::Gallery => (640, 480),
        }
    }
}

/// What put the renderer into `Errored`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    /// Load failed and no renewer is wired
    LoadFailed,
    /// The renewer itself failed
    RenewalFailed,
    /// The URL still failed after a completed renewal
    FailedAfterRenewal,
}

/// Display state of one attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayState {
    Loading { src: String },
    Loaded { src: String },
    Errored { src: String, cause: ErrorCause },
    RenewingViaParent { src: String },
}

impl DisplayState {
    pub fn src(&self) -> &str {
        match self {
            Self::Loading { src }
            | Self::Loaded { src }
            | Self::Errored { src, .. }
            | Self::RenewingViaParent { src } => src,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Loaded { .. } => "loaded",
            Self::Errored { .. } => "errored",
            Self::RenewingViaParent { .. } => "renewing",
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, Self::Errored { .. })
    }
}

/// Status of the current failure episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    /// Failure recorded, no renewal requested
    Idle,
    /// Renewal in flight
    AwaitingRenewal,
    /// Renewal completed; the next failure is terminal
    Renewed,
    /// Renewal failed or the renewed URL failed too
    Failed,
}

/// Bookkeeping for one run of failures on a renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalEpisode {
    pub status: EpisodeStatus,
    /// Renewer invocations in this episode
    pub renewals: u32,
}

impl RenewalEpisode {
    fn new() -> Self {
        Self {
            status: EpisodeStatus::Idle,
            renewals: 0,
        }
    }
}

/// Overlay drawn on top of the media slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    None,
    /// Neutral fixed-size "renewing" indicator
    Renewing { width: u32, height: u32 },
    /// "Not available" with an optional retry action
    Unavailable {
        width: u32,
        height: u32,
        retry_available: bool,
    },
}

/// Presentation-neutral view of a renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderView {
    /// The media element stays mounted with this source in every state
    pub media_src: String,
    pub media_visible: bool,
    pub overlay: Overlay,
}

/// Renderer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererSettings {
    /// Wait after a renewal before retrying, so the parent's refetch can land
    pub settle_delay: Duration,
}

impl Default for RendererSettings {
    fn default() -> Self {
        RenewalConfig::default().into()
    }
}

impl From<RenewalConfig> for RendererSettings {
    fn from(config: RenewalConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
        }
    }
}

struct Inner {
    attachment: Attachment,
    state: DisplayState,
    episode: Option<RenewalEpisode>,
}

enum FailureAction {
    Renew(Arc<dyn UrlRenewer>),
    Settled,
}

/// State machine for one displayed attachment
pub struct AttachmentRenderer {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<DisplayState>,
    renewer: Option<Arc<dyn UrlRenewer>>,
    variant: RenderVariant,
    settings: RendererSettings,
}

impl AttachmentRenderer {
    pub fn new(
        attachment: Attachment,
        renewer: Option<Arc<dyn UrlRenewer>>,
        variant: RenderVariant,
        settings: RendererSettings,
    ) -> Self {
        let state = DisplayState::Loading {
            src: attachment.url.clone(),
        };
        let (state_tx, _) = watch::channel(state.clone());

        Self {
            inner: Mutex::new(Inner {
                attachment,
                state,
                episode: None,
            }),
            state_tx,
            renewer,
            variant,
            settings,
        }
    }

    pub fn attachment(&self) -> Attachment {
        self.inner.lock().attachment.clone()
    }

    pub fn state(&self) -> DisplayState {
        self.inner.lock().state.clone()
    }

    pub fn episode(&self) -> Option<RenewalEpisode> {
        self.inner.lock().episode
    }

    pub fn variant(&self) -> RenderVariant {
        self.variant
    }

    pub fn has_renewer(&self) -> bool {
        self.renewer.is_some()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.state_tx.subscribe()
    }

    /// Accept a republished attachment from the parent.
    ///
    /// A changed URL restarts loading; anything else is stored silently.
    pub fn set_attachment(&self, attachment: Attachment) {
        let mut inner = self.inner.lock();

        if attachment.id != inner.attachment.id {
            warn!(
                old = %inner.attachment.id,
                new = %attachment.id,
                "Renderer rebound to a different attachment"
            );
            inner.episode = None;
        }

        let url_changed = attachment.url != inner.attachment.url;
        inner.attachment = attachment;

        if url_changed {
            debug!(attachment = %inner.attachment.id, "Attachment URL replaced");
            let state = DisplayState::Loading {
                src: inner.attachment.url.clone(),
            };
            self.publish(&mut inner, state);
        }
    }

    /// The surface finished showing `src`
    pub fn load_succeeded(&self, src: &str) -> bool {
        let mut inner = self.inner.lock();

        match &inner.state {
            DisplayState::Loading { src: current } if current == src => {}
            _ => return false,
        }

        if let Some(episode) = inner.episode.take() {
            debug!(
                attachment = %inner.attachment.id,
                renewals = episode.renewals,
                "Attachment recovered"
            );
        }
        let state = DisplayState::Loaded {
            src: src.to_string(),
        };
        self.publish(&mut inner, state);
        true
    }

    /// The surface failed to show `src`.
    ///
    /// Only the first failure of the current load attempt counts. With a
    /// renewer wired, this resolves once the renewal round-trip and the
    /// settle delay are over.
    pub async fn load_failed(&self, src: &str, error: &LoadError) {
        let action = {
            let mut inner = self.inner.lock();

            match &inner.state {
                DisplayState::Loading { src: current } if current == src => {}
                other => {
                    debug!(
                        attachment = %inner.attachment.id,
                        state = other.name(),
                        "Ignoring load failure outside of its load attempt"
                    );
                    return;
                }
            }

            debug!(attachment = %inner.attachment.id, error = %error, "Attachment failed to load");

            let src = src.to_string();
            let mut episode = inner.episode.unwrap_or_else(RenewalEpisode::new);

            let (state, action) = match (&self.renewer, episode.status) {
                (None, _) => {
                    episode.status = EpisodeStatus::Idle;
                    (
                        DisplayState::Errored {
                            src,
                            cause: ErrorCause::LoadFailed,
                        },
                        FailureAction::Settled,
                    )
                }
                // Joins the renewal already in flight
                (Some(_), EpisodeStatus::AwaitingRenewal) => {
                    (DisplayState::RenewingViaParent { src }, FailureAction::Settled)
                }
                (Some(_), EpisodeStatus::Renewed) | (Some(_), EpisodeStatus::Failed) => {
                    episode.status = EpisodeStatus::Failed;
                    warn!(
                        attachment = %inner.attachment.id,
                        renewals = episode.renewals,
                        "Attachment still unavailable after renewal"
                    );
                    (
                        DisplayState::Errored {
                            src,
                            cause: ErrorCause::FailedAfterRenewal,
                        },
                        FailureAction::Settled,
                    )
                }
                (Some(renewer), EpisodeStatus::Idle) => {
                    episode.status = EpisodeStatus::AwaitingRenewal;
                    episode.renewals += 1;
                    (
                        DisplayState::RenewingViaParent { src },
                        FailureAction::Renew(Arc::clone(renewer)),
                    )
                }
            };

            inner.episode = Some(episode);
            self.publish(&mut inner, state);
            action
        };

        if let FailureAction::Renew(renewer) = action {
            self.run_renewal(renewer).await;
        }
    }

    /// Manual retry from the "not available" state.
    ///
    /// Re-requests the current URL with a fresh cache-busting token and
    /// starts a new episode. Never contacts the renewer.
    pub fn retry(&self) -> bool {
        let mut inner = self.inner.lock();

        if !inner.state.is_errored() {
            return false;
        }

        info!(attachment = %inner.attachment.id, "Manual retry");
        inner.episode = None;
        let state = DisplayState::Loading {
            src: cache_bust(&inner.attachment.url),
        };
        self.publish(&mut inner, state);
        true
    }

    /// Drive loads through `loader` until the attachment is shown or a
    /// failure needs user action.
    pub async fn render(&self, loader: &dyn MediaLoader) -> DisplayState {
        let mut rx = self.subscribe();

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                DisplayState::Loading { src } => {
                    let result = if src.trim().is_empty() {
                        Err(LoadError::EmptyUrl)
                    } else {
                        loader.load(&src).await
                    };

                    match result {
                        Ok(()) => {
                            self.load_succeeded(&src);
                        }
                        Err(e) => self.load_failed(&src, &e).await,
                    }
                }
                DisplayState::RenewingViaParent { .. } => {
                    if rx.changed().await.is_err() {
                        return self.state();
                    }
                }
                settled => return settled,
            }
        }
    }

    /// Presentation for the current state
    pub fn view(&self) -> RenderView {
        let (width, height) = self.variant.placeholder_size();
        let state = self.state();
        let media_src = state.src().to_string();

        match state {
            DisplayState::Loading { .. } => RenderView {
                media_src,
                media_visible: false,
                overlay: Overlay::None,
            },
            DisplayState::Loaded { .. } => RenderView {
                media_src,
                media_visible: true,
                overlay: Overlay::None,
            },
            DisplayState::RenewingViaParent { .. } => RenderView {
                media_src,
                media_visible: false,
                overlay: Overlay::Renewing { width, height },
            },
            DisplayState::Errored { .. } => RenderView {
                media_src,
                media_visible: false,
                overlay: Overlay::Unavailable {
                    width,
                    height,
                    retry_available: true,
                },
            },
        }
    }

    async fn run_renewal(&self, renewer: Arc<dyn UrlRenewer>) {
        let attachment_id = self.inner.lock().attachment.id.clone();
        debug!(attachment = %attachment_id, "Requesting URL renewal from parent");

        let mut guard = RenewalGuard {
            renderer: self,
            armed: true,
        };

        match renewer.renew_urls().await {
            Ok(()) => {
                if let Some(episode) = self.inner.lock().episode.as_mut() {
                    episode.status = EpisodeStatus::Renewed;
                }

                tokio::time::sleep(self.settings.settle_delay).await;
                guard.armed = false;

                let mut inner = self.inner.lock();
                if !matches!(inner.state, DisplayState::RenewingViaParent { .. }) {
                    debug!(attachment = %attachment_id, "Parent already republished the URL");
                    return;
                }
                let state = DisplayState::Loading {
                    src: cache_bust(&inner.attachment.url),
                };
                self.publish(&mut inner, state);
            }
            Err(e) => {
                guard.armed = false;
                warn!(attachment = %attachment_id, error = %e, "Attachment URL renewal failed");

                let mut inner = self.inner.lock();
                if let Some(episode) = inner.episode.as_mut() {
                    episode.status = EpisodeStatus::Failed;
                }
                self.fail_renewing(&mut inner);
            }
        }
    }

    /// Settle a renewal whose driving future was dropped before finishing.
    ///
    /// Before the renewer answered, the episode is closed and the renderer
    /// offers manual retry. During the settle delay the cache-busted swap
    /// happens right away.
    fn abandon_renewal(&self) {
        let mut inner = self.inner.lock();
        let status = inner.episode.map(|e| e.status);
        warn!(
            attachment = %inner.attachment.id,
            episode = ?status,
            "Renewal abandoned before completion"
        );

        match status {
            Some(EpisodeStatus::Renewed) => {
                if matches!(inner.state, DisplayState::RenewingViaParent { .. }) {
                    let state = DisplayState::Loading {
                        src: cache_bust(&inner.attachment.url),
                    };
                    self.publish(&mut inner, state);
                }
            }
            _ => {
                inner.episode = None;
                self.fail_renewing(&mut inner);
            }
        }
    }

    fn fail_renewing(&self, inner: &mut Inner) {
        let src = match &inner.state {
            DisplayState::RenewingViaParent { src } => src.clone(),
            _ => return,
        };
        self.publish(
            inner,
            DisplayState::Errored {
                src,
                cause: ErrorCause::RenewalFailed,
            },
        );
    }

    fn publish(&self, inner: &mut Inner, state: DisplayState) {
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }
}

/// Restores a consistent state if `run_renewal` is dropped mid-flight
struct RenewalGuard<'a> {
    renderer: &'a AttachmentRenderer,
    armed: bool,
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.renderer.abandon_renewal();
        }
    }
}

impl std::fmt::Debug for AttachmentRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AttachmentRenderer")
            .field("attachment", &inner.attachment.id)
            .field("state", &inner.state)
            .field("episode", &inner.episode)
            .field("variant", &self.variant)
            .finish()
    }
}
