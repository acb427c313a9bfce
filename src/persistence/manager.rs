//! Durable-overflow manager (spec.md §4.B).
//!
//! Append-only JSON-lines log with size-based rotation, sequence numbers,
//! a per-record retry counter, a dead-letter queue, and crash-recovery
//! replay. The write path mirrors `db/writer.rs`'s "accumulate, flush on
//! threshold-or-interval" batching discipline; the mutable file/queue
//! state is guarded by a single `tokio::sync::Mutex`, matching spec.md
//! §5's "a mutex serializes persistence-manager writes."

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PersistenceConfig;
use crate::error::StreamSqlResult;
use crate::value::Record;

use super::types::{DeadLetterEntry, PersistedEnvelope, PersistenceStats};

/// A line dequeued from the recovery queue, carrying its retry history so
/// the backpressure `persist` strategy can decide retry vs. dead-letter.
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    pub record: Record,
    pub retry_count: u32,
}

const EARLY_FLUSH_THRESHOLD: usize = 100;

struct Inner {
    file: Option<File>,
    file_path: PathBuf,
    file_index: u64,
    file_size: u64,
    pending: Vec<String>,
    stats: PersistenceStats,
    recovery_queue: VecDeque<RecoveredRecord>,
    dead_letter: Vec<DeadLetterEntry>,
    stopped: bool,
}

pub struct PersistenceManager {
    data_dir: PathBuf,
    max_file_size_bytes: u64,
    flush_interval: Duration,
    sequence: AtomicU64,
    max_retry_count: AtomicU32,
    inner: Mutex<Inner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    pub fn new(cfg: &PersistenceConfig) -> Self {
        Self {
            data_dir: PathBuf::from(&cfg.data_dir),
            max_file_size_bytes: cfg.max_file_size_bytes,
            flush_interval: cfg.flush_interval(),
            sequence: AtomicU64::new(0),
            max_retry_count: AtomicU32::new(cfg.max_retries),
            inner: Mutex::new(Inner {
                file: None,
                file_path: PathBuf::new(),
                file_index: 0,
                file_size: 0,
                pending: Vec::new(),
                stats: PersistenceStats::default(),
                recovery_queue: VecDeque::new(),
                dead_letter: Vec::new(),
                stopped: false,
            }),
            flusher: Mutex::new(None),
        }
    }

    pub fn set_max_retry_count(&self, n: u32) {
        self.max_retry_count.store(n, Ordering::Relaxed);
    }

    /// Creates the data directory (if missing) and opens the first log
    /// file. Returns an error only if the directory cannot be created or
    /// the file cannot be opened (spec.md §4.B's `Start` error contract).
    pub async fn start(self: &std::sync::Arc<Self>) -> StreamSqlResult<()> {
        fs::create_dir_all(&self.data_dir).await?;

        {
            let mut inner = self.inner.lock().await;
            self.open_new_file(&mut inner).await?;
            inner.stopped = false;
        }

        let this = self.clone();
        let mut handle_guard = self.flusher.lock().await;
        *handle_guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.flush_interval);
            loop {
                ticker.tick().await;
                if this.inner.lock().await.stopped {
                    break;
                }
                if let Err(e) = this.flush_pending().await {
                    error!(error = %e, "persistence flush failed");
                }
            }
        }));

        info!(data_dir = %self.data_dir.display(), "persistence manager started");
        Ok(())
    }

    /// Idempotent: a second `stop()` is a no-op.
    pub async fn stop(&self) -> StreamSqlResult<()> {
        let already_stopped = {
            let mut inner = self.inner.lock().await;
            let was = inner.stopped;
            inner.stopped = true;
            was
        };
        if already_stopped {
            return Ok(());
        }

        self.flush_pending().await?;

        if let Some(handle) = self.flusher.lock().await.take() {
            handle.abort();
        }
        info!("persistence manager stopped");
        Ok(())
    }

    async fn open_new_file(&self, inner: &mut Inner) -> StreamSqlResult<()> {
        let unix_secs = Utc::now().timestamp();
        let path = self
            .data_dir
            .join(format!("streamsql_overflow_{unix_secs}_{}.log", inner.file_index));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        inner.file = Some(file);
        inner.file_path = path;
        inner.file_size = 0;
        Ok(())
    }

    /// Persists a record with an initial retry count of 0 (spec.md §4.B).
    pub async fn persist_data(&self, record: Record) -> StreamSqlResult<()> {
        self.persist_with_retry_limit(record, 0).await
    }

    /// Persists a record carrying a given retry count (used on
    /// re-persist of a recovered record that failed to re-enter the
    /// ingress channel).
    pub async fn persist_with_retry_limit(
        &self,
        record: Record,
        current_retry_count: u32,
    ) -> StreamSqlResult<()> {
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = PersistedEnvelope {
            sequence_id,
            retry_count: current_retry_count,
            persisted_at: Utc::now().timestamp(),
            data: record,
        };

        let line = match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize record for persistence");
                self.inner.lock().await.stats.total_dropped += 1;
                return Ok(());
            }
        };

        let mut inner = self.inner.lock().await;
        inner.pending.push(line);
        inner.stats.total_persisted += 1;

        let should_early_flush = inner.pending.len() > EARLY_FLUSH_THRESHOLD;
        drop(inner);

        if should_early_flush {
            self.flush_pending().await?;
        }
        Ok(())
    }

    /// Moves the in-memory pending buffer to disk and syncs. I/O errors
    /// are logged and counted, never propagated past this manager (spec.md
    /// §4.B, §7 `PersistenceError`).
    async fn flush_pending(&self) -> StreamSqlResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.pending.is_empty() {
            return Ok(());
        }

        let pending_bytes: u64 = inner.pending.iter().map(|l| l.len() as u64 + 1).sum();
        if inner.file_size + pending_bytes > self.max_file_size_bytes && inner.file.is_some() {
            inner.file_index += 1;
            if let Err(e) = self.open_new_file(&mut inner).await {
                error!(error = %e, "failed to rotate persistence log file");
                inner.stats.total_dropped += inner.pending.len() as u64;
                inner.pending.clear();
                return Ok(());
            }
        }

        let lines = std::mem::take(&mut inner.pending);
        let file = match inner.file.as_mut() {
            Some(f) => f,
            None => {
                warn!("persistence flush attempted with no open file");
                inner.stats.total_dropped += lines.len() as u64;
                return Ok(());
            }
        };

        let mut buf = String::new();
        for line in &lines {
            buf.push_str(line);
            buf.push('\n');
        }

        match file.write_all(buf.as_bytes()).await {
            Ok(()) => {
                if let Err(e) = file.sync_all().await {
                    warn!(error = %e, "persistence file sync failed");
                }
                inner.file_size += buf.len() as u64;
            }
            Err(e) => {
                error!(error = %e, "persistence file write failed");
                inner.stats.total_dropped += lines.len() as u64;
            }
        }
        Ok(())
    }

    /// Scans every matching log file in the data directory, parses each
    /// line (skipping malformed lines with a logged warning), enqueues
    /// records in sequence order, and deletes each file after a
    /// successful load.
    pub async fn load_and_recover_data(&self) -> StreamSqlResult<()> {
        let mut entries = Vec::new();
        let mut read_dir = match fs::read_dir(&self.data_dir).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(error = %e, dir = %self.data_dir.display(), "no persistence data directory to recover from");
                return Ok(());
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_overflow_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("streamsql_overflow_") && n.ends_with(".log"))
                .unwrap_or(false);
            if is_overflow_log {
                files.push(path);
            }
        }

        for path in &files {
            match self.read_envelopes(path).await {
                Ok(envs) => entries.extend(envs),
                Err(e) => {
                    error!(error = %e, file = %path.display(), "failed to read persistence log file");
                }
            }
        }

        entries.sort_by_key(|e: &PersistedEnvelope| e.sequence_id);

        let mut inner = self.inner.lock().await;
        for env in entries {
            inner.stats.total_recovered += 1;
            inner.recovery_queue.push_back(RecoveredRecord {
                record: env.data,
                retry_count: env.retry_count,
            });
        }
        drop(inner);

        for path in &files {
            if let Err(e) = fs::remove_file(path).await {
                warn!(error = %e, file = %path.display(), "failed to delete recovered log file");
            }
        }

        Ok(())
    }

    async fn read_envelopes(&self, path: &Path) -> StreamSqlResult<Vec<PersistedEnvelope>> {
        let mut contents = String::new();
        File::open(path)
            .await?
            .read_to_string(&mut contents)
            .await?;

        let mut out = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistedEnvelope>(line) {
                Ok(env) => out.push(env),
                Err(e) => {
                    warn!(file = %path.display(), line = lineno, error = %e, "skipping malformed persistence line");
                }
            }
        }
        Ok(out)
    }

    /// `true` until the recovery queue empties.
    pub async fn is_in_recovery_mode(&self) -> bool {
        !self.inner.lock().await.recovery_queue.is_empty()
    }

    /// Dequeues the next recovered record, in sequence order.
    pub async fn get_recovery_data(&self) -> Option<(RecoveredRecord, bool)> {
        let mut inner = self.inner.lock().await;
        let next = inner.recovery_queue.pop_front()?;
        let has_more = !inner.recovery_queue.is_empty();
        Some((next, has_more))
    }

    pub fn should_retry_recovered_data(&self, rec: &RecoveredRecord) -> bool {
        rec.retry_count < self.max_retry_count.load(Ordering::Relaxed)
    }

    /// Re-persists a recovered record with its retry count incremented
    /// (spec.md §3 invariant: retry count is bumped on every failed
    /// re-enqueue attempt).
    pub async fn repersist_recovered_data(&self, mut rec: RecoveredRecord) -> StreamSqlResult<()> {
        rec.retry_count += 1;
        self.persist_with_retry_limit(rec.record, rec.retry_count)
            .await
    }

    pub async fn move_to_dead_letter_queue(&self, record: Record, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.dead_letter.push(DeadLetterEntry {
            payload: record,
            reason: reason.into(),
            moved_at: Utc::now().timestamp(),
        });
        inner.stats.dead_letter_count += 1;
    }

    pub async fn get_dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().await.dead_letter.clone()
    }

    pub async fn get_stats(&self) -> PersistenceStats {
        let inner = self.inner.lock().await;
        let mut stats = inner.stats;
        stats.pending_recovery = inner.recovery_queue.len() as u64;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rec(n: i64) -> Record {
        let mut r = Record::new();
        r.insert("n".to_string(), crate::value::Value::Number(n as f64));
        r
    }

    async fn manager(dir: &Path) -> Arc<PersistenceManager> {
        let cfg = PersistenceConfig {
            data_dir: dir.to_string_lossy().to_string(),
            max_file_size_bytes: 10 * 1024 * 1024,
            flush_interval_ms: 60_000,
            max_retries: 2,
            retry_interval_ms: 1000,
        };
        let mgr = Arc::new(PersistenceManager::new(&cfg));
        mgr.start().await.unwrap();
        mgr
    }

    #[tokio::test]
    async fn sequence_ids_strictly_increase() {
        let dir = tempdir();
        let mgr = manager(dir.path()).await;
        for i in 0..20 {
            mgr.persist_data(rec(i)).await.unwrap();
        }
        mgr.stop().await.unwrap();
        assert_eq!(mgr.sequence.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn round_trip_recovery_preserves_order_and_retry_zero() {
        let dir = tempdir();
        {
            let mgr = manager(dir.path()).await;
            for i in 0..5 {
                mgr.persist_data(rec(i)).await.unwrap();
            }
            mgr.stop().await.unwrap();
        }

        let fresh = manager(dir.path()).await;
        fresh.load_and_recover_data().await.unwrap();
        assert!(fresh.is_in_recovery_mode().await);

        let mut seen = Vec::new();
        loop {
            match fresh.get_recovery_data().await {
                Some((r, has_more)) => {
                    assert_eq!(r.retry_count, 0);
                    seen.push(r.record.get("n").unwrap().as_f64().unwrap() as i64);
                    if !has_more {
                        break;
                    }
                }
                None => break,
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!fresh.is_in_recovery_mode().await);

        let mut remaining_files = fs::read_dir(dir.path()).await.unwrap();
        assert!(remaining_files.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_budget_moves_to_dead_letter() {
        let dir = tempdir();
        let mgr = manager(dir.path()).await;
        mgr.set_max_retry_count(2);

        let recovered = RecoveredRecord {
            record: rec(1),
            retry_count: 2,
        };
        assert!(!mgr.should_retry_recovered_data(&recovered));
        mgr.move_to_dead_letter_queue(recovered.record.clone(), "retry budget exceeded")
            .await;
        let dlq = mgr.get_dead_letter_queue().await;
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "retry budget exceeded");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_during_recovery() {
        let dir = tempdir();
        fs::create_dir_all(dir.path()).await.unwrap();
        let path = dir.path().join("streamsql_overflow_1_0.log");
        fs::write(&path, "{not json}\n{\"sequence_id\":1,\"retry_count\":0,\"persisted_at\":1,\"data\":{}}\n")
            .await
            .unwrap();

        let cfg = PersistenceConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            max_file_size_bytes: 1024,
            flush_interval_ms: 60_000,
            max_retries: 2,
            retry_interval_ms: 1000,
        };
        let mgr = Arc::new(PersistenceManager::new(&cfg));
        mgr.start().await.unwrap();
        mgr.load_and_recover_data().await.unwrap();
        let (rec, has_more) = mgr.get_recovery_data().await.unwrap();
        assert!(!has_more);
        assert!(rec.record.is_empty());
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!(
                "streamsql_test_{}_{}",
                std::process::id(),
                NEXT_ID.fetch_add(1, Ordering::Relaxed)
            ));
            Self { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
}
