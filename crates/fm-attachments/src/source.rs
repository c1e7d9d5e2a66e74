//! Thread sources
//!
//! The two backend contracts the attachment core consumes: refetch an entity
//! with freshly signed URLs, and post a message carrying compressed files.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fm_core::{BackendError, BackendResult, EntityRef};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::model::{Attachment, PendingFile, ThreadMessage, ThreadSnapshot};

/// Backend collaborator owning tickets and inspection reports
#[async_trait]
pub trait ThreadSource: Send + Sync {
    /// Fetch the full entity, with attachment URLs signed anew
    async fn fetch(&self, entity: &EntityRef) -> BackendResult<ThreadSnapshot>;

    /// Post a message with already compressed files
    async fn post_message(
        &self,
        entity: &EntityRef,
        body: Option<&str>,
        files: Vec<PendingFile>,
    ) -> BackendResult<ThreadMessage>;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// Stored thread before URLs are signed
#[derive(Debug, Clone, Default)]
struct StoredThread {
    title: Option<String>,
    attachments: Vec<Attachment>,
    messages: Vec<ThreadMessage>,
}

/// In-memory thread source for testing.
///
/// Every fetch signs URLs in a new round. URLs stay valid until
/// [`expire_urls`](Self::expire_urls) invalidates every round issued so far.
pub struct MemoryThreadSource {
    base_url: String,
    threads: RwLock<HashMap<EntityRef, StoredThread>>,
    uploads: Mutex<Vec<PendingFile>>,
    round: AtomicU64,
    valid_from: AtomicU64,
    fetches: AtomicUsize,
    failing_fetches: AtomicUsize,
    fetch_delays: Mutex<VecDeque<Duration>>,
    next_id: AtomicU64,
}

impl Default for MemoryThreadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryThreadSource {
    pub fn new() -> Self {
        Self {
            base_url: "https://storage.test".to_string(),
            threads: RwLock::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            round: AtomicU64::new(0),
            valid_from: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            fetch_delays: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a thread with entity-level attachments
    pub async fn insert(
        &self,
        entity: EntityRef,
        title: impl Into<String>,
        attachments: Vec<Attachment>,
    ) {
        let mut threads = self.threads.write().await;
        threads.insert(
            entity,
            StoredThread {
                title: Some(title.into()),
                attachments,
                messages: Vec::new(),
            },
        );
    }

    /// Add a message to an existing thread
    pub async fn push_message(&self, entity: &EntityRef, message: ThreadMessage) {
        let mut threads = self.threads.write().await;
        threads.entry(entity.clone()).or_default().messages.push(message);
    }

    /// Make the next `count` fetches fail with a connection error
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Delay upcoming fetches, one entry per call, in order
    pub fn delay_next_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.fetch_delays.lock().extend(delays);
    }

    /// Invalidate every URL issued so far without fetching
    pub fn expire_urls(&self) {
        let next = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        self.valid_from.store(next, Ordering::SeqCst);
    }

    /// Whether `url` carries a signature that has not expired
    pub fn is_valid(&self, url: &str) -> bool {
        let valid_from = self.valid_from.load(Ordering::SeqCst);
        url.split(['?', '&', '#'])
            .find_map(|pair| pair.strip_prefix("sig="))
            .and_then(|sig| sig.parse::<u64>().ok())
            .is_some_and(|round| round >= valid_from)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Files received through `post_message`
    pub fn uploads(&self) -> Vec<PendingFile> {
        self.uploads.lock().clone()
    }

    fn sign(&self, entity: &EntityRef, attachment: &Attachment, round: u64) -> Attachment {
        attachment.with_url(format!(
            "{}/{}/{}?sig={}",
            self.base_url,
            entity.path(),
            attachment.id,
            round
        ))
    }
}

#[async_trait]
impl ThreadSource for MemoryThreadSource {
    async fn fetch(&self, entity: &EntityRef) -> BackendResult<ThreadSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = self.fetch_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Connection("simulated outage".to_string()));
        }

        let threads = self.threads.read().await;
        let stored = threads
            .get(entity)
            .ok_or_else(|| BackendError::not_found(entity.kind.as_str(), &entity.id))?;

        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(ThreadSnapshot {
            id: entity.id.clone(),
            title: stored.title.clone(),
            attachments: stored
                .attachments
                .iter()
                .map(|a| self.sign(entity, a, round))
                .collect(),
            messages: stored
                .messages
                .iter()
                .map(|m| ThreadMessage {
                    attachments: m
                        .attachments
                        .iter()
                        .map(|a| self.sign(entity, a, round))
                        .collect(),
                    ..m.clone()
                })
                .collect(),
        })
    }

    async fn post_message(
        &self,
        entity: &EntityRef,
        body: Option<&str>,
        files: Vec<PendingFile>,
    ) -> BackendResult<ThreadMessage> {
        let mut threads = self.threads.write().await;
        let stored = threads
            .get_mut(entity)
            .ok_or_else(|| BackendError::not_found(entity.kind.as_str(), &entity.id))?;

        let attachments = files
            .iter()
            .map(|file| Attachment {
                id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                media_type: file.content_type.clone(),
                url: String::new(),
                name: Some(file.name.clone()),
                size: Some(file.size()),
            })
            .collect();

        let message = ThreadMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            author: None,
            body: body.map(str::to_string),
            created_at: Some(chrono::Utc::now()),
            attachments,
        };
        stored.messages.push(message.clone());
        self.uploads.lock().extend(files);

        let round = self.round.load(Ordering::SeqCst);
        Ok(ThreadMessage {
            attachments: message
                .attachments
                .iter()
                .map(|a| self.sign(entity, a, round))
                .collect(),
            ..message
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
