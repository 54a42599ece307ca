//! Source capability: pluggable providers of chapter page data.
//!
//! A [`Source`] turns a chapter reference into an ordered list of [`Page`]s
//! and resolves/fetches their content. The download pipeline treats sources
//! as opaque injected capabilities; the only concrete implementation shipped
//! here is [`HttpSource`], which speaks a small JSON page-list API.
//!
//! # Architecture
//!
//! - [`Source`] - Async trait individual sources implement
//! - [`SourceRegistry`] - Lookup from source id to a shared source handle
//! - [`Page`] / [`PageContent`] - Closed sum type over page states and kinds
//! - [`HttpSource`] - Reference implementation over HTTP/JSON

mod http;

pub use http::HttpSource;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Chapter, SourceId};

/// Source operation errors.
///
/// The pipeline does not interpret subtypes beyond "retry or not"; every
/// variant is treated as transient by the worker's fixed retry budget.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Network-level failure (connect, timeout, TLS, non-success status).
    #[error("network error: {0}")]
    Network(String),

    /// Response could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A page could not be resolved to concrete content.
    #[error("unresolvable page at index {index}")]
    UnresolvablePage {
        /// Index of the offending page.
        index: u32,
    },
}

/// Concrete, fetchable content of a resolved page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    /// An image fetched from a remote URL.
    RemoteImage {
        /// Absolute image URL.
        url: String,
    },
    /// An image carried inline as base64.
    InlineImage {
        /// Base64-encoded image bytes.
        data: String,
    },
    /// Plain text content.
    Text {
        /// The text body.
        text: String,
    },
}

/// One page of a chapter.
///
/// A page starts as a [`Page::Reference`] when the source needs another
/// round trip to produce concrete content, or directly as [`Page::Resolved`].
/// Resolution is idempotent; a resolved page never reverts to a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// Needs network resolution before it can be fetched.
    Reference {
        /// Zero-based position within the chapter.
        index: u32,
        /// Source-specific resolution key.
        url: String,
    },
    /// Ready to fetch or write.
    Resolved {
        /// Zero-based position within the chapter.
        index: u32,
        /// Concrete content.
        content: PageContent,
    },
}

impl Page {
    /// Returns the zero-based page index.
    #[must_use]
    pub fn index(&self) -> u32 {
        match self {
            Self::Reference { index, .. } | Self::Resolved { index, .. } => *index,
        }
    }

    /// Returns `true` if the page still needs resolution.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }

    /// Promotes a reference to a resolved page with the given content.
    ///
    /// Resolving an already-resolved page keeps the existing content.
    #[must_use]
    pub fn resolve(self, content: PageContent) -> Self {
        match self {
            Self::Reference { index, .. } => Self::Resolved { index, content },
            resolved @ Self::Resolved { .. } => resolved,
        }
    }
}

/// A pluggable provider of chapter page data.
///
/// Implementations must be cheap to share (`Arc<dyn Source>`) and safe to
/// call from multiple worker tasks; the per-source concurrency limit in the
/// orchestrator guarantees at most one chapter downloads through a source at
/// a time, but resolution and image fetches for that chapter may interleave.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier of this source.
    fn id(&self) -> SourceId;

    /// Human-readable name, used for the on-disk source directory.
    fn name(&self) -> &str;

    /// Lists the pages of a chapter in order.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on network or protocol failure. An empty list
    /// is a valid (if useless) response; the worker escalates it separately.
    async fn page_list(&self, chapter: &Chapter) -> Result<Vec<Page>, SourceError>;

    /// Resolves a reference page into concrete content.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on network failure or when the page cannot be
    /// resolved.
    async fn resolve_page(&self, page: &Page) -> Result<PageContent, SourceError>;

    /// Fetches the raw bytes of a remote image.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Network`] on any transport failure.
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

/// Lookup from source id to a shared source handle.
///
/// The orchestrator and workers hold a registry behind `Arc<dyn
/// SourceRegistry>` so the hosting application can plug in its own catalog.
pub trait SourceRegistry: Send + Sync {
    /// Returns the source for the given id, if registered.
    fn get(&self, id: SourceId) -> Option<Arc<dyn Source>>;
}

impl SourceRegistry for HashMap<SourceId, Arc<dyn Source>> {
    fn get(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        HashMap::get(self, &id).cloned()
    }
}

/// Builds a registry from a list of sources, keyed by their ids.
#[must_use]
pub fn registry_from_sources(sources: Vec<Arc<dyn Source>>) -> Arc<dyn SourceRegistry> {
    let map: HashMap<SourceId, Arc<dyn Source>> = sources
        .into_iter()
        .map(|source| (source.id(), source))
        .collect();
    Arc::new(map)
}
