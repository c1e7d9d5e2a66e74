//! # fm-attachments
//!
//! Attachment lifecycle for ticket and inspection report threads.
//!
//! ## Features
//!
//! - Adaptive JPEG compression of images before upload
//! - Per-attachment display state machine with expired-URL renewal
//! - Renewal coordinator with proactive refresh of signed URLs
//! - Thread view composing the above over any [`ThreadSource`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use fm_attachments::{MemoryThreadSource, ThreadSettings, ThreadView};
//! use fm_core::EntityRef;
//! use std::sync::Arc;
//!
//! let source = Arc::new(MemoryThreadSource::new());
//! let view = ThreadView::open(source, EntityRef::ticket("42"), ThreadSettings::default()).await?;
//!
//! // Upload a photo; it is shrunk to the configured budget first
//! view.send_message(Some("Water damage"), vec![PendingFile::from_name("wall.png", bytes)]).await?;
//!
//! // Show every attachment, renewing expired URLs on the way
//! let states = view.render_all(&loader).await;
//! ```

pub mod cache_bust;
pub mod compress;
pub mod coordinator;
pub mod model;
pub mod renderer;
pub mod source;
pub mod thread;

pub use cache_bust::{cache_bust, strip_token, with_token};
pub use compress::{
    compress, compress_blocking, compress_many, compress_many_lossy, compress_with_report,
    fit_within, CompressError, CompressResult, CompressionBudget, CompressionOutcome,
    CompressionReport,
};
pub use coordinator::{RefreshHandle, RenewalCoordinator, RenewalStats};
pub use model::{
    human_size, Attachment, AttachmentKey, MediaKind, PendingFile, ThreadMessage, ThreadSnapshot,
};
pub use renderer::{
    renewer_fn, AttachmentRenderer, DisplayState, EpisodeStatus, ErrorCause, LoadError,
    MediaLoader, Overlay, RenderVariant, RenderView, RendererSettings, RenewalEpisode,
    RenewalError, UrlRenewer,
};
pub use source::{MemoryThreadSource, ThreadSource};
pub use thread::{ThreadSettings, ThreadView};
