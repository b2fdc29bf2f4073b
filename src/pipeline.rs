//! Per-file ingestion: one feeder, a bounded queue, and a pool of workers.
//!
//! ```text
//! file ─▶ open_lines ─▶ bounded(queue_capacity) ─▶ W workers ─▶ parse ─▶ route ─▶ encode ─▶ put
//!                                                   │
//!                                                   └─▶ RunStats (per worker, summed after join)
//! ```
//!
//! Closing the queue never cancels work: whatever was queued before the feed
//! ended (cleanly or not) is still loaded, and the file is marked afterwards.
use crate::codec::Line;
use crate::config::LoaderConfig;
use crate::io::{mark_complete, open_lines, SourceOptions};
use crate::observer::{IngestEvent, Observer, TracingObserver};
use crate::proto::{ProtobufEncoder, RecordEncoder};
use crate::record::parse_apps_installed;
use crate::stats::{LoadOutcome, RunStats, NORMAL_ERR_RATE};
use crate::store::ShardRouter;
use crate::{LoadError, LoadResult, RecordError};
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Encode but never `put`; every routable record counts as processed.
    pub dry_run: bool,
    pub source: SourceOptions,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        LoaderConfig::default().pipeline_settings()
    }
}

/// What happened to one file that made it to the end.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub stats: RunStats,
    pub outcome: LoadOutcome,
    pub lines_read: u64,
    /// Set when the line source failed part way; the file was still marked.
    pub feed_error: Option<io::Error>,
    pub marked_as: PathBuf,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<FileReport>,
    pub failed: Vec<(PathBuf, LoadError)>,
}

impl RunSummary {
    /// No failed files, no partial reads, no high error rates.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self
                .reports
                .iter()
                .all(|r| r.feed_error.is_none() && !r.outcome.is_high_error_rate())
    }

    pub fn totals(&self) -> RunStats {
        self.reports.iter().map(|r| r.stats).sum()
    }
}

/// Sequential multi-file loader.
pub struct Loader {
    router: Arc<ShardRouter>,
    encoder: Arc<dyn RecordEncoder>,
    observer: Arc<dyn Observer>,
    settings: PipelineSettings,
}

impl Loader {
    pub fn new(router: Arc<ShardRouter>, settings: PipelineSettings) -> Self {
        Self {
            router,
            encoder: Arc::new(ProtobufEncoder),
            observer: Arc::new(TracingObserver),
            settings,
        }
    }

    /// Validate `config` and wire one memcached client per device type.
    pub fn from_config(config: &LoaderConfig) -> LoadResult<Self> {
        config.validate()?;
        let router = ShardRouter::connect_memcache(&config.shards);
        Ok(Self::new(Arc::new(router), config.pipeline_settings()))
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn RecordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Expand `pattern` and load every match, in order.
    pub async fn load_pattern(&self, pattern: &str) -> LoadResult<RunSummary> {
        let files = find_input_files(pattern)?;
        Ok(self.load_files(files).await)
    }

    /// Load files one after another. A file that fails is reported and skipped.
    pub async fn load_files<I, P>(&self, paths: I) -> RunSummary
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut summary = RunSummary::default();
        for path in paths {
            let path = path.as_ref();
            match self.process_file(path).await {
                Ok(report) => summary.reports.push(report),
                Err(error) => {
                    self.observer.record(&IngestEvent::FileFailed { path, error: &error });
                    summary.failed.push((path.to_path_buf(), error));
                }
            }
        }
        summary
    }

    /// Load a single file and mark it complete.
    ///
    /// Errors only for failures that stop the file itself (a worker panicking,
    /// the rename failing). Bad records and read errors end up in the report.
    pub async fn process_file(&self, path: &Path) -> LoadResult<FileReport> {
        let workers = self.settings.workers.max(1);
        self.observer.record(&IngestEvent::FileStarted { path, workers });

        let (tx, rx) = async_channel::bounded::<Line>(self.settings.queue_capacity.max(1));
        let handler = Arc::new(LineHandler {
            router: self.router.clone(),
            encoder: self.encoder.clone(),
            observer: self.observer.clone(),
            dry_run: self.settings.dry_run,
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(run_worker(handler.clone(), rx.clone()));
        }
        drop(rx);

        let (lines_read, feed_error) = self.feed(path, tx).await;
        match &feed_error {
            None => self.observer.record(&IngestEvent::FeedFinished {
                path,
                lines: lines_read,
            }),
            Some(error) => self.observer.record(&IngestEvent::FeedFailed {
                path,
                lines: lines_read,
                error,
            }),
        }

        let mut stats = RunStats::default();
        while let Some(joined) = pool.join_next().await {
            stats += joined?;
        }

        let outcome = stats.classify(NORMAL_ERR_RATE);
        self.observer.record(&IngestEvent::FileFinished {
            path,
            stats,
            outcome,
        });

        let marked_as = mark_complete(path).await.map_err(|source| LoadError::Mark {
            path: path.to_path_buf(),
            source,
        })?;
        self.observer.record(&IngestEvent::FileMarked {
            path,
            marked_as: &marked_as,
        });

        Ok(FileReport {
            path: path.to_path_buf(),
            stats,
            outcome,
            lines_read,
            feed_error,
            marked_as,
        })
    }

    /// Push every line of `path` into the queue. Dropping `tx` on return closes it.
    async fn feed(&self, path: &Path, tx: async_channel::Sender<Line>) -> (u64, Option<io::Error>) {
        let mut lines = match open_lines(path, &self.settings.source).await {
            Ok(lines) => lines,
            Err(LoadError::Io(err)) => return (0, Some(err)),
            Err(err) => return (0, Some(io::Error::other(err))),
        };

        let mut count = 0u64;
        while let Some(next) = lines.next().await {
            match next {
                Ok(line) => {
                    count += 1;
                    if tx.send(line).await.is_err() {
                        // every worker is gone; joining will say why
                        break;
                    }
                }
                Err(err) => return (count, Some(err)),
            }
        }
        (count, None)
    }
}

/// Read-only state shared by the workers of one file.
struct LineHandler {
    router: Arc<ShardRouter>,
    encoder: Arc<dyn RecordEncoder>,
    observer: Arc<dyn Observer>,
    dry_run: bool,
}

impl LineHandler {
    /// `None` for a blank line.
    async fn load_line(&self, line: &str) -> Option<Result<(), RecordError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(self.load_record(line).await)
    }

    async fn load_record(&self, line: &str) -> Result<(), RecordError> {
        let record = parse_apps_installed(line)?;
        let store = self
            .router
            .route(record.device_type)
            .ok_or_else(|| RecordError::UnknownDeviceType(record.device_type.to_string()))?;

        let value = self.encoder.encode(&record)?;
        let key = record.key();
        if self.dry_run {
            self.observer.record(&IngestEvent::DryRun {
                key: &key,
                record: &record,
                encoded_len: value.len(),
            });
            return Ok(());
        }

        store
            .put(&key, value)
            .await
            .map_err(|source| RecordError::Store { key, source })
    }
}

async fn run_worker(handler: Arc<LineHandler>, queue: async_channel::Receiver<Line>) -> RunStats {
    let mut stats = RunStats::default();
    // Err once the feeder is done and the queue is drained
    while let Ok(next) = queue.recv().await {
        let (line, result) = match &next {
            Ok(line) => (Some(line.trim()), handler.load_line(line).await),
            Err(unframed) => (None, Some(Err(RecordError::Format(unframed.clone())))),
        };

        match result {
            None => {}
            Some(Ok(())) => stats.record_success(),
            Some(Err(error)) => {
                stats.record_error();
                handler.observer.record(&IngestEvent::RecordRejected { line, error: &error });
            }
        }
    }
    stats
}

/// Files matching `pattern`, sorted. Names starting with `.` (already loaded)
/// never match.
pub fn find_input_files(pattern: &str) -> LoadResult<Vec<PathBuf>> {
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..Default::default()
    };
    let mut files = Vec::new();
    for entry in glob::glob_with(pattern, options)? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(err) => warn!(path = %err.path().display(), error = %err.error(), "Skipping unreadable path"),
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{decode_user_apps, EncodeError, UserApps};
    use crate::record::AppsInstalled;
    use crate::store::{KvStore, MemoryStore, StoreError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use prost::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    impl Observer for Recorder {
        fn record(&self, event: &IngestEvent<'_>) {
            self.events.lock().unwrap().push(format!("{event:?}"));
        }
    }

    /// Fails every key listed in `fail`.
    struct FlakyStore {
        inner: MemoryStore,
        fail: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.iter().any(|k| *k == key) {
                return Err(StoreError::Rejected("SERVER_ERROR out of memory".into()));
            }
            self.inner.put(key, value).await
        }
    }

    struct CountingEncoder(AtomicUsize);

    impl RecordEncoder for CountingEncoder {
        fn encode(&self, record: &AppsInstalled<'_>) -> Result<Bytes, EncodeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ProtobufEncoder.encode(record)
        }
    }

    /// Fails to encode the record whose device id is `fail`.
    struct FailingEncoder {
        fail: &'static str,
    }

    impl RecordEncoder for FailingEncoder {
        fn encode(&self, record: &AppsInstalled<'_>) -> Result<Bytes, EncodeError> {
            if record.device_id == self.fail {
                let mut full: [u8; 0] = [];
                UserApps::from(record).encode(&mut &mut full[..])?;
            }
            ProtobufEncoder.encode(record)
        }
    }

    fn write_plain(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn idfa_router(store: Arc<dyn KvStore>) -> Arc<ShardRouter> {
        let mut router = ShardRouter::new();
        router.insert("idfa", store);
        Arc::new(router)
    }

    fn settings(workers: usize) -> PipelineSettings {
        PipelineSettings {
            workers,
            queue_capacity: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn counts_every_kind_of_outcome_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(
            dir.path(),
            "apps.tsv",
            &[
                "idfa\tid1\t55.55\t37.37\t42,43,,abc,44",
                "",
                "   ",
                "gaid\tid2\t1\t2\t3",
                "idfa\tid3\t1",
                "idfa\tid4\tnorth\t2\t3",
                "zzzz\tid5\t1\t2\t3",
                "gaid\tbad\t1\t2\t3",
            ],
        );

        let idfa = Arc::new(MemoryStore::new());
        let gaid = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: vec!["gaid:bad"],
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let mut router = ShardRouter::new();
        router.insert("idfa", idfa.clone());
        router.insert("gaid", gaid.clone());
        let loader = Loader::new(Arc::new(router), settings(3)).with_observer(recorder.clone());

        let report = loader.process_file(&path).await.unwrap();

        assert_eq!(report.stats, RunStats { processed: 2, errors: 4 });
        assert_eq!(report.lines_read, 8);
        assert!(report.feed_error.is_none());
        assert!(report.outcome.is_high_error_rate());
        assert_eq!(report.marked_as, dir.path().join(".apps.tsv"));
        assert!(!path.exists());

        let stored = decode_user_apps(&idfa.get("idfa:id1").unwrap()).unwrap();
        assert_eq!(stored.apps, vec![42, 43, 44]);
        assert_eq!((stored.lat, stored.lon), (Some(55.55), Some(37.37)));
        assert!(gaid.inner.get("gaid:id2").is_some());
        assert_eq!(gaid.calls.load(Ordering::SeqCst), 2);

        assert_eq!(recorder.count("RecordRejected"), 4);
        assert_eq!(recorder.count("FileMarked"), 1);
    }

    #[tokio::test]
    async fn unknown_device_type_never_reaches_encoder_or_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(dir.path(), "a.tsv", &["nope\tx\t1\t2\t3", "nope\ty\t1\t2\t3"]);

        let store = Arc::new(MemoryStore::new());
        let encoder = Arc::new(CountingEncoder(AtomicUsize::new(0)));
        let loader = Loader::new(idfa_router(store.clone()), settings(2))
            .with_encoder(encoder.clone())
            .with_observer(Arc::new(crate::NoopObserver));

        let report = loader.process_file(&path).await.unwrap();
        assert_eq!(report.stats, RunStats { processed: 0, errors: 2 });
        assert_eq!(report.outcome, LoadOutcome::NothingProcessed);
        assert_eq!(encoder.0.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_puts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(dir.path(), "a.tsv", &["idfa\tx\t1\t2\t3", "idfa\ty\t1\t2\t7"]);

        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: vec![],
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let loader = Loader::new(
            idfa_router(store.clone()),
            PipelineSettings {
                dry_run: true,
                ..settings(2)
            },
        )
        .with_observer(recorder.clone());

        let report = loader.process_file(&path).await.unwrap();
        assert_eq!(report.stats, RunStats { processed: 2, errors: 0 });
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.count("DryRun"), 2);
    }

    #[tokio::test]
    async fn encode_failure_counts_one_error_and_skips_put() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(
            dir.path(),
            "a.tsv",
            &["idfa\tx\t1\t2\t3", "idfa\tbroken\t1\t2\t3", "idfa\tz\t1\t2\t3"],
        );

        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: vec![],
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let loader = Loader::new(idfa_router(store.clone()), settings(1))
            .with_encoder(Arc::new(FailingEncoder { fail: "broken" }))
            .with_observer(recorder.clone());

        let report = loader.process_file(&path).await.unwrap();
        assert_eq!(report.stats, RunStats { processed: 2, errors: 1 });
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(store.inner.get("idfa:broken").is_none());
        assert!(store.inner.get("idfa:z").is_some());
        assert_eq!(recorder.count("RecordRejected { line: Some(\"idfa\\tbroken"), 1);
    }

    #[tokio::test]
    async fn undecodable_ids_are_rejected_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tsv");
        std::fs::write(
            &path,
            b"idfa\tdev\xff\t1\t2\t3\nidfa\tdev\xfe\t1\t2\t4\nidfa\tdev\t1\t2\t5\n",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let loader = Loader::new(idfa_router(store.clone()), settings(2)).with_observer(recorder.clone());

        let report = loader.process_file(&path).await.unwrap();
        assert_eq!(report.stats, RunStats { processed: 1, errors: 2 });
        assert_eq!(report.lines_read, 3);
        assert!(report.feed_error.is_none());
        assert_eq!(store.len(), 1);
        let stored = decode_user_apps(&store.get("idfa:dev").unwrap()).unwrap();
        assert_eq!(stored.apps, vec![5]);
        assert_eq!(recorder.count("RecordRejected { line: None"), 2);
    }

    #[tokio::test]
    async fn missing_file_is_a_feed_error_and_rename_failure() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Loader::new(Arc::new(ShardRouter::new()), settings(2)).with_observer(Arc::new(crate::NoopObserver));

        let err = loader.process_file(&dir.path().join("gone.tsv.gz")).await.unwrap_err();
        assert!(matches!(err, LoadError::Mark { .. }), "{err}");
    }

    #[tokio::test]
    async fn one_failed_file_does_not_stop_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_plain(dir.path(), "b.tsv", &["idfa\tx\t1\t2\t3"]);
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(idfa_router(store.clone()), settings(1))
            .with_observer(Arc::new(crate::NoopObserver));

        let summary = loader
            .load_files([dir.path().join("a-missing.tsv"), good])
            .await;
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.totals(), RunStats { processed: 1, errors: 0 });
        assert!(!summary.is_clean());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn find_input_files_skips_marked_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tsv.gz", "a.tsv.gz", ".c.tsv.gz", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("d.tsv.gz")).unwrap();

        let pattern = format!("{}/*.tsv.gz", dir.path().display());
        let files = find_input_files(&pattern).unwrap();
        assert_eq!(files, vec![dir.path().join("a.tsv.gz"), dir.path().join("b.tsv.gz")]);
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(matches!(find_input_files("/data/[*.gz"), Err(LoadError::Pattern(_))));
    }
}
