//! Chapter Download Pipeline
//!
//! This library provides the background download pipeline for an offline
//! manga library: it fetches remote chapter content (paginated image/text
//! resources), persists queue progress, and survives process restarts.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Durable download-queue persistence
//! - [`model`] - Manga/chapter identity types
//! - [`source`] - Pluggable chapter/page providers
//! - [`download`] - Orchestrator actor, worker pool, and compression stage
//!
//! The storage layer, UI, catalog loading, and preference plumbing are the
//! hosting application's concern; this crate consumes them as injected
//! collaborators ([`source::SourceRegistry`], [`DownloadStore`],
//! [`download::CompressPreference`]).

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod model;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use db::Database;
pub use download::{
    CompressPreference, DEFAULT_WORKER_COUNT, DownloadConfig, DownloadError, DownloadState,
    Downloader, DownloaderSnapshot, QueuedDownload,
};
pub use model::{Chapter, ChapterId, Manga, MangaId, SourceId};
pub use source::{HttpSource, Page, PageContent, Source, SourceError, SourceRegistry};
pub use store::{DownloadStore, SavedDownload, StoreError};
