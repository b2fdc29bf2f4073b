//! Everything the loader has to say goes through an [`Observer`].
//!
//! The pipeline never logs directly: it hands an [`IngestEvent`] to the
//! observer it was built with. [`TracingObserver`] turns events into `tracing`
//! records; tests plug in their own observer to assert on what happened.
use crate::record::AppsInstalled;
use crate::stats::{LoadOutcome, RunStats, NORMAL_ERR_RATE};
use crate::{LoadError, RecordError};
use std::io;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum IngestEvent<'a> {
    FileStarted {
        path: &'a Path,
        workers: usize,
    },
    /// The line source reached end of input.
    FeedFinished {
        path: &'a Path,
        lines: u64,
    },
    /// The line source failed; lines already queued are still loaded.
    FeedFailed {
        path: &'a Path,
        lines: u64,
        error: &'a io::Error,
    },
    /// `line` is `None` when the line could not be framed or decoded.
    RecordRejected {
        line: Option<&'a str>,
        error: &'a RecordError,
    },
    DryRun {
        key: &'a str,
        record: &'a AppsInstalled<'a>,
        encoded_len: usize,
    },
    FileFinished {
        path: &'a Path,
        stats: RunStats,
        outcome: LoadOutcome,
    },
    FileMarked {
        path: &'a Path,
        marked_as: &'a Path,
    },
    FileFailed {
        path: &'a Path,
        error: &'a LoadError,
    },
}

pub trait Observer: Send + Sync {
    fn record(&self, event: &IngestEvent<'_>);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record(&self, _event: &IngestEvent<'_>) {}
}

/// Default observer: structured `tracing` output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&self, event: &IngestEvent<'_>) {
        match event {
            IngestEvent::FileStarted { path, workers } => {
                info!(path = %path.display(), workers, "Processing file");
            }
            IngestEvent::FeedFinished { path, lines } => {
                info!(path = %path.display(), lines, "Finished reading file");
            }
            IngestEvent::FeedFailed { path, lines, error } => {
                error!(path = %path.display(), lines, error = %error, "Error reading file, queued lines will still be loaded");
            }
            IngestEvent::RecordRejected { line, error } => match error {
                RecordError::Format(_) => debug!(%error, line = ?line, "Skipping malformed line"),
                RecordError::UnknownDeviceType(device_type) => {
                    warn!(device_type = %device_type, "Unknown device type")
                }
                RecordError::Encode(_) | RecordError::Store { .. } => {
                    error!(%error, "Cannot store record")
                }
            },
            IngestEvent::DryRun {
                key,
                record,
                encoded_len,
            } => {
                debug!(key, lat = record.lat, lon = record.lon, apps = ?record.apps, encoded_len, "Dry run, not storing");
            }
            IngestEvent::FileFinished {
                path,
                stats,
                outcome,
            } => match outcome {
                LoadOutcome::NothingProcessed => {
                    info!(path = %path.display(), errors = stats.errors, "Nothing processed")
                }
                LoadOutcome::Acceptable { error_rate } => info!(
                    path = %path.display(),
                    processed = stats.processed,
                    errors = stats.errors,
                    "Acceptable error rate ({error_rate:.4}). Successful load"
                ),
                LoadOutcome::HighErrorRate { error_rate } => error!(
                    path = %path.display(),
                    processed = stats.processed,
                    errors = stats.errors,
                    "High error rate ({error_rate:.4} > {NORMAL_ERR_RATE:.4}). Failed load"
                ),
            },
            IngestEvent::FileMarked { path, marked_as } => {
                debug!(path = %path.display(), marked_as = %marked_as.display(), "Marked file as loaded");
            }
            IngestEvent::FileFailed { path, error } => {
                error!(path = %path.display(), %error, "Error processing file");
            }
        }
    }
}
