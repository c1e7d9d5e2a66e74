//! Facility management REST client
//!
//! Implements [`ThreadSource`] over the backend's REST API: fetching a ticket
//! or inspection report with freshly signed attachment URLs, and posting a
//! multipart message.
//!
//! ```no_run
//! use fm_attachments::{ThreadSettings, ThreadView};
//! use fm_client::HttpThreadSource;
//! use fm_core::EntityRef;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(HttpThreadSource::new("http://localhost:3000/api")?);
//! let view = ThreadView::open(source, EntityRef::ticket("42"), ThreadSettings::default()).await?;
//! println!("{} attachments", view.renderers().len());
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::ClientError;

use std::time::Duration;

use async_trait::async_trait;
use fm_attachments::{PendingFile, ThreadMessage, ThreadSnapshot, ThreadSource};
use fm_core::config::ClientConfig;
use fm_core::{BackendError, BackendResult, EntityRef};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Multipart field every uploaded file is appended under
pub const FILES_FIELD: &str = "files";

/// Multipart field carrying the message text
pub const BODY_FIELD: &str = "body";

/// Backend adapter over HTTP.
#[derive(Debug, Clone)]
pub struct HttpThreadSource {
    client: Client,
    base_url: String,
}

/// Builder for configuring an [`HttpThreadSource`].
#[derive(Debug)]
pub struct HttpThreadSourceBuilder {
    base_url: String,
    timeout: Duration,
    client: Option<Client>,
}

impl HttpThreadSourceBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            client: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a custom reqwest Client.
    ///
    /// The builder's timeout is ignored in that case.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<HttpThreadSource, ClientError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ClientError::InvalidBaseUrl(self.base_url));
        }

        let client = match self.client {
            Some(c) => c,
            None => Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| ClientError::Configuration(e.to_string()))?,
        };

        Ok(HttpThreadSource {
            client,
            base_url: self.base_url,
        })
    }
}

impl HttpThreadSource {
    /// Create a client with the default timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        HttpThreadSourceBuilder::new(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> HttpThreadSourceBuilder {
        HttpThreadSourceBuilder::new(base_url)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        HttpThreadSourceBuilder::new(&config.backend.base_url)
            .timeout(config.request_timeout())
            .build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(
        entity: &EntityRef,
        response: Response,
    ) -> BackendResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| BackendError::Deserialization(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let error =
            BackendError::from_status(status.as_u16(), entity.kind.as_str(), &entity.id, &body);
        warn!(
            entity = %entity,
            status = status.as_u16(),
            error = %error,
            "Backend rejected request"
        );
        Err(error)
    }
}

#[async_trait]
impl ThreadSource for HttpThreadSource {
    #[instrument(skip(self), fields(entity = %entity))]
    async fn fetch(&self, entity: &EntityRef) -> BackendResult<ThreadSnapshot> {
        let url = self.url(&entity.path());

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let snapshot: ThreadSnapshot = Self::parse(entity, response).await?;
        debug!(
            attachments = snapshot.all_attachments().count(),
            messages = snapshot.messages.len(),
            "Fetched thread"
        );
        Ok(snapshot)
    }

    #[instrument(skip(self, body, files), fields(entity = %entity, files = files.len()))]
    async fn post_message(
        &self,
        entity: &EntityRef,
        body: Option<&str>,
        files: Vec<PendingFile>,
    ) -> BackendResult<ThreadMessage> {
        let url = self.url(&entity.messages_path());

        let mut form = Form::new();
        if let Some(body) = body {
            form = form.text(BODY_FIELD, body.to_string());
        }
        for file in files {
            let part = Part::bytes(file.bytes.to_vec())
                .file_name(file.name.clone())
                .mime_str(&file.content_type)
                .map_err(|e| {
                    BackendError::InvalidRequest(format!(
                        "{}: unusable content type {}: {}",
                        file.name, file.content_type, e
                    ))
                })?;
            form = form.part(FILES_FIELD, part);
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let message: ThreadMessage = Self::parse(entity, response).await?;
        debug!(message = %message.id, attachments = message.attachments.len(), "Posted message");
        Ok(message)
    }

    fn name(&self) -> &str {
        "http"
    }
}
