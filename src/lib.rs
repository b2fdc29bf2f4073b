//! Concurrent loader for device/installed-apps dumps.
//!
//! - Input: gzip'd (or zstd/plain) TSV lines `dev_type \t dev_id \t lat \t lon \t app,app,...`
//! - Output: protobuf `UserApps` under `dev_type:dev_id` in the memcached shard for `dev_type`.
//!
//! Files are loaded one at a time. Per file, a bounded queue feeds a fixed
//! pool of workers; record-level failures are counted, never fatal, and the
//! file is renamed to `.name` when done.
//!
//! Data shape:
//! - `AppsInstalled<'_>` parsed from a line (see [`parse_apps_installed`])
//! - `FileReport { stats, outcome, feed_error, .. }` per file, `RunSummary` per run
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
mod io;
pub mod logging;
pub mod observer;
pub mod pipeline;
pub mod proto;
mod record;
mod stats;
pub mod store;

pub use crate::codec::{Line, LineDecoder, DEFAULT_MAX_LINE_LENGTH};
pub use crate::config::{LoaderConfig, ShardAddrs};
pub use crate::io::{
    build_line_reader, mark_complete, marked_path, open_lines, Compression, LineStream,
    SourceOptions, COMPLETION_MARKER,
};
pub use crate::observer::{IngestEvent, NoopObserver, Observer, TracingObserver};
pub use crate::pipeline::{find_input_files, FileReport, Loader, PipelineSettings, RunSummary};
pub use crate::proto::{decode_user_apps, ProtobufEncoder, RecordEncoder, UserApps};
pub use crate::record::{parse_apps_installed, AppsInstalled, FormatError, MIN_FIELDS};
pub use crate::stats::{LoadOutcome, RunStats, NORMAL_ERR_RATE};
pub use crate::store::{KvStore, MemcacheClient, MemoryStore, ShardRouter, StoreError};

use std::path::PathBuf;
use thiserror::Error;

/// File-level failure: stops one file, never the whole run.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot mark {} as loaded: {source}", .path.display())]
    Mark {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Record-level failure: counted as an error, the run goes on.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),
    #[error("cannot serialize record: {0}")]
    Encode(#[from] proto::EncodeError),
    #[error("cannot write {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}
