//! HTTP/JSON reference implementation of the [`Source`] capability.
//!
//! Speaks a small JSON page-list protocol:
//! - `GET {base}{chapter.url}` returns an array of page objects. Each object
//!   carries `index` plus exactly one of `image_url` (resolved remote image),
//!   `text` (resolved text page), or `page_url` (a reference needing another
//!   round trip).
//! - `GET {base}{page_url}` resolves a reference into an object with one of
//!   `image_url`, `data` (inline base64), or `text`.
//! - Image bytes are streamed from their absolute URL.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{Page, PageContent, Source, SourceError};
use crate::model::{Chapter, SourceId};

/// HTTP connect timeout (30 seconds).
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP read timeout (2 minutes; pages are single images, not archives).
const READ_TIMEOUT_SECS: u64 = 120;

/// Ceiling for body preallocation (8 MiB); `Content-Length` is an untrusted
/// hint and must not size an allocation on its own.
const IMAGE_PREALLOC_CAP: usize = 8 * 1024 * 1024;

/// Wire format of one entry in the page-list response.
#[derive(Debug, Deserialize)]
struct PageEntry {
    index: u32,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    page_url: Option<String>,
}

/// Wire format of a page-resolution response.
#[derive(Debug, Deserialize)]
struct ResolvedEntry {
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// A [`Source`] backed by an HTTP/JSON page-list API.
///
/// Created once per remote catalog and shared behind `Arc<dyn Source>`;
/// reuses one connection-pooled client for all requests.
#[derive(Debug, Clone)]
pub struct HttpSource {
    id: SourceId,
    name: String,
    base_url: Url,
    client: Client,
}

impl HttpSource {
    /// Creates a new HTTP source rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidResponse`] if `base_url` does not parse
    /// or the HTTP client cannot be constructed.
    pub fn new(id: SourceId, name: impl Into<String>, base_url: &str) -> Result<Self, SourceError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SourceError::InvalidResponse(format!("invalid base url: {e}")))?;

        let client = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id,
            name: name.into(),
            base_url,
            client,
        })
    }

    /// Joins a source-relative path against the base URL.
    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::InvalidResponse(format!("invalid endpoint {path}: {e}")))
    }

    /// Sends a GET and returns the response after a status check.
    async fn get(&self, url: Url) -> Result<reqwest::Response, SourceError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SourceError::Network(format!(
                "HTTP {} from {url}",
                response.status().as_u16()
            )));
        }

        Ok(response)
    }
}

/// Clamps the advertised body length to [`IMAGE_PREALLOC_CAP`].
fn prealloc_capacity(content_length: Option<u64>) -> usize {
    content_length
        .and_then(|length| usize::try_from(length).ok())
        .unwrap_or(0)
        .min(IMAGE_PREALLOC_CAP)
}

impl PageEntry {
    fn into_page(self) -> Result<Page, SourceError> {
        let index = self.index;
        if let Some(url) = self.image_url {
            return Ok(Page::Resolved {
                index,
                content: PageContent::RemoteImage { url },
            });
        }
        if let Some(text) = self.text {
            return Ok(Page::Resolved {
                index,
                content: PageContent::Text { text },
            });
        }
        if let Some(url) = self.page_url {
            return Ok(Page::Reference { index, url });
        }
        Err(SourceError::InvalidResponse(format!(
            "page entry {index} has no image_url, text, or page_url"
        )))
    }
}

#[async_trait]
impl Source for HttpSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, chapter), fields(source = %self.name, chapter_id = chapter.id))]
    async fn page_list(&self, chapter: &Chapter) -> Result<Vec<Page>, SourceError> {
        let url = self.endpoint(&chapter.url)?;
        let entries: Vec<PageEntry> = self
            .get(url)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

        debug!(pages = entries.len(), "fetched page list");

        entries.into_iter().map(PageEntry::into_page).collect()
    }

    #[instrument(skip(self, page), fields(source = %self.name, index = page.index()))]
    async fn resolve_page(&self, page: &Page) -> Result<PageContent, SourceError> {
        // Already concrete; resolution is idempotent.
        let (index, url) = match page {
            Page::Resolved { content, .. } => return Ok(content.clone()),
            Page::Reference { index, url } => (index, url),
        };

        let endpoint = self.endpoint(url)?;
        let entry: ResolvedEntry = self
            .get(endpoint)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

        if let Some(url) = entry.image_url {
            return Ok(PageContent::RemoteImage { url });
        }
        if let Some(data) = entry.data {
            return Ok(PageContent::InlineImage { data });
        }
        if let Some(text) = entry.text {
            return Ok(PageContent::Text { text });
        }

        Err(SourceError::UnresolvablePage { index: *index })
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let parsed = Url::parse(url)
            .or_else(|_| self.endpoint(url))
            .map_err(|_| SourceError::InvalidResponse(format!("invalid image url: {url}")))?;

        let response = self.get(parsed).await?;

        let mut bytes = Vec::with_capacity(prealloc_capacity(response.content_length()));
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::Network(e.to_string()))?;
            bytes.extend_from_slice(&chunk);
        }

        debug!(bytes = bytes.len(), "fetched image body");
        Ok(bytes)
    }
}
