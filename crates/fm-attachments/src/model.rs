//! Attachment Model
//!
//! Wire representations of attachments, messages, and thread snapshots as
//! returned by the backend, plus files picked by the user before upload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Coarse media category derived from a MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Pdf,
    Other,
}

impl MediaKind {
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type.trim().parse::<mime::Mime>() {
            Ok(m) if m.type_() == mime::IMAGE => Self::Image,
            Ok(m) if m.essence_str() == mime::APPLICATION_PDF.essence_str() => Self::Pdf,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a MIME type names a pixel-based image the compressor can rework
pub fn is_raster_image(media_type: &str) -> bool {
    match media_type.trim().parse::<mime::Mime>() {
        Ok(m) => m.type_() == mime::IMAGE && m.subtype() != mime::SVG,
        Err(_) => false,
    }
}

/// A file attached to a message or entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Unique within the parent message
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// MIME-like type as reported by the backend
    #[serde(default)]
    pub media_type: String,
    /// Signed, time-limited locator; empty while unresolved
    #[serde(default)]
    pub url: String,
    /// Original filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// File size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Attachment {
    pub fn new(
        id: impl Into<String>,
        media_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            media_type: media_type.into(),
            url: url.into(),
            name: None,
            size: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_media_type(&self.media_type)
    }

    pub fn is_image(&self) -> bool {
        self.media_kind() == MediaKind::Image
    }

    pub fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Copy of this attachment pointing at a freshly issued URL
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// One message in a ticket or report thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Full representation of a ticket or inspection report as last fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub messages: Vec<ThreadMessage>,
}

impl ThreadSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            attachments: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Entity-level attachments followed by message attachments, in order
    pub fn all_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments
            .iter()
            .chain(self.messages.iter().flat_map(|m| m.attachments.iter()))
    }

    /// Every attachment paired with the key that identifies it in the thread
    pub fn keyed_attachments(&self) -> impl Iterator<Item = (AttachmentKey, &Attachment)> {
        self.attachments
            .iter()
            .map(|a| (AttachmentKey::entity(&a.id), a))
            .chain(self.messages.iter().flat_map(|m| {
                m.attachments
                    .iter()
                    .map(move |a| (AttachmentKey::message(&m.id, &a.id), a))
            }))
    }

    pub fn find_attachment(&self, id: &str) -> Option<&Attachment> {
        self.all_attachments().find(|a| a.id == id)
    }

    pub fn get(&self, key: &AttachmentKey) -> Option<&Attachment> {
        self.keyed_attachments()
            .find(|(k, _)| k == key)
            .map(|(_, a)| a)
    }
}

/// Attachment ids are only unique within their message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentKey {
    /// None for attachments held by the entity itself
    pub message_id: Option<String>,
    pub attachment_id: String,
}

impl AttachmentKey {
    pub fn entity(attachment_id: impl Into<String>) -> Self {
        Self {
            message_id: None,
            attachment_id: attachment_id.into(),
        }
    }

    pub fn message(message_id: impl Into<String>, attachment_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            attachment_id: attachment_id.into(),
        }
    }
}

impl std::fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message_id {
            Some(message_id) => write!(f, "{}/{}", message_id, self.attachment_id),
            None => write!(f, "{}", self.attachment_id),
        }
    }
}

/// A file chosen by the user but not yet uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Client-side identity, kept across compression
    pub id: Uuid,
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
    /// Locally rendered thumbnail, never uploaded
    pub local_preview: Option<Bytes>,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content_type: content_type.into(),
            bytes,
            local_preview: None,
        }
    }

    /// Build a pending file, guessing the content type from its name
    pub fn from_name(name: impl Into<String>, bytes: Bytes) -> Self {
        let name = name.into();
        let content_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        Self::new(name, content_type, bytes)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_media_type(&self.content_type)
    }

    /// Same file identity with replaced content
    pub fn with_content(
        &self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Bytes,
    ) -> Self {
        Self {
            id: self.id,
            name: name.into(),
            content_type: content_type.into(),
            bytes,
            local_preview: self.local_preview.clone(),
        }
    }

    /// Human-readable file size
    pub fn human_size(&self) -> String {
        human_size(self.size())
    }
}

/// Human-readable byte count
pub fn human_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if size == 0 {
        return "0 B".to_string();
    }

    let size = size as f64;
    let base = 1024.0_f64;
    let i = (size.ln() / base.ln()).floor() as usize;
    let i = i.min(UNITS.len() - 1);

    let value = size / base.powi(i as i32);
    format!("{:.1} {}", value, UNITS[i])
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}
