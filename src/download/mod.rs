//! Background download pipeline for chapter content.
//!
//! # Overview
//!
//! The pipeline is built from four pieces:
//! - [`Downloader`] - handle to the orchestrator actor, which owns all
//!   scheduling state and drives the per-chapter state machine
//! - the download worker pool (internal) - one task per pool slot running
//!   the page-fetch/retry pipeline
//! - the compression stage (internal) - packs finished directories into CBZ
//! - [`artifact`] - the on-disk naming conventions shared by all of them
//!
//! Callers interact only through the [`Downloader`] handle; everything else
//! communicates over channels inside the actor's task group.

pub mod artifact;
mod compress;
mod error;
mod orchestrator;
mod queue;
mod worker;

pub use error::DownloadError;
pub use orchestrator::{
    CompressPreference, DEFAULT_WORKER_COUNT, DownloadConfig, Downloader, DownloaderSnapshot,
};
pub use queue::{DownloadState, QueuedDownload};
pub use worker::{
    DEFAULT_RETRY_DELAY, PAGE_FETCH_RETRIES, PAGE_LIST_RETRIES, PAGE_RESOLVE_RETRIES,
};
