use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio_util::task::TaskTracker;

use studyroom_core::match_record::{LeaderboardEntry, MatchRecord, leaderboard};
use studyroom_core::participant::ParticipantId;

use crate::config::HistoryConfig;

/// Upper bound for a single backoff delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for match records.
pub trait MatchStore: Send + Sync {
    /// Append one record. Must be safe to call again with the same record
    /// after a failure.
    fn append(&self, record: &MatchRecord) -> Result<(), StoreError>;

    /// All stored records, oldest first.
    fn load(&self) -> Result<Vec<MatchRecord>, StoreError>;
}

/// Store that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    records: Mutex<Vec<MatchRecord>>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchStore for MemoryMatchStore {
    fn append(&self, record: &MatchRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<MatchRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// One JSON document per line, appended in the order matches end.
#[derive(Debug)]
pub struct JsonlMatchStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl MatchStore for JsonlMatchStore {
    fn append(&self, record: &MatchRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        // A torn line from an earlier crash must not swallow this record.
        if start > 0 && !ends_with_newline(&mut file, start)? {
            line.insert(0, b'\n');
        }
        if let Err(e) = file.write_all(&line).and_then(|()| file.flush()) {
            if let Err(rollback) = file.set_len(start) {
                tracing::warn!(
                    path = %self.path.display(), error = %rollback,
                    "Failed to roll back partial match record"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<MatchRecord>, StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MatchRecord>(&line) {
                Ok(record) => {
                    if seen.insert(record.id) {
                        records.push(record);
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(), line = lineno + 1, error = %e,
                        "Skipping unreadable match record"
                    );
                },
            }
        }
        Ok(records)
    }
}

fn ends_with_newline(file: &mut std::fs::File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Bounded exponential backoff for durable writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

/// In-memory, bounded match history with broadcast fan-out for the SSE
/// feed.
pub struct MatchHistory {
    records: VecDeque<MatchRecord>,
    broadcast_tx: broadcast::Sender<MatchRecord>,
    max_records: usize,
}

impl MatchHistory {
    pub fn with_capacity(max_records: usize, broadcast_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            records: VecDeque::new(),
            broadcast_tx,
            max_records,
        }
    }

    /// Append a newly finished match and notify subscribers.
    pub fn insert(&mut self, record: MatchRecord) {
        let _ = self.broadcast_tx.send(record.clone());
        self.push(record);
    }

    /// Append without notifying. Used when loading stored records.
    fn push(&mut self, record: MatchRecord) {
        self.records.push_back(record);
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<MatchRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_participant(&self, id: &ParticipantId, limit: usize) -> Vec<MatchRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.includes(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Codes are reused once a room is evicted, so one code can map to
    /// several records. Most recent first.
    pub fn by_room(&self, room_code: &str) -> Vec<MatchRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.room_code == room_code)
            .cloned()
            .collect()
    }

    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let mut board = leaderboard(&self.records);
        board.truncate(limit);
        board
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchRecord> {
        self.broadcast_tx.subscribe()
    }
}

#[derive(Debug, Default)]
struct PersistCounters {
    persisted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub stored: usize,
    pub persisted: u64,
    pub persist_failures: u64,
    pub pending_writes: usize,
}

/// Receives every finished match exactly once. The record is readable
/// immediately; durable persistence happens in the background and is
/// never rolled back.
pub struct HistoryRecorder {
    history: RwLock<MatchHistory>,
    store: Arc<dyn MatchStore>,
    retry: RetryPolicy,
    tasks: TaskTracker,
    counters: Arc<PersistCounters>,
}

impl HistoryRecorder {
    /// Open the store named by the config and load its records.
    pub async fn open(config: &HistoryConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn MatchStore> = match &config.path {
            Some(path) => Arc::new(JsonlMatchStore::new(path)),
            None => Arc::new(MemoryMatchStore::new()),
        };
        Self::with_store(store, config).await
    }

    pub async fn with_store(
        store: Arc<dyn MatchStore>,
        config: &HistoryConfig,
    ) -> Result<Self, StoreError> {
        let mut history =
            MatchHistory::with_capacity(config.max_in_memory, config.broadcast_capacity);

        let loader = Arc::clone(&store);
        let existing = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        if !existing.is_empty() {
            tracing::info!(count = existing.len(), "Loaded match history");
        }
        let mut seen = HashSet::new();
        for record in existing {
            if seen.insert(record.id) {
                history.push(record);
            }
        }

        Ok(Self {
            history: RwLock::new(history),
            store,
            retry: RetryPolicy::from_config(config),
            tasks: TaskTracker::new(),
            counters: Arc::new(PersistCounters::default()),
        })
    }

    /// Record a finished match.
    pub async fn record(&self, record: MatchRecord) {
        tracing::info!(
            match_id = %record.id,
            room = %record.room_code,
            winner = ?record.winner_id.as_ref().map(ParticipantId::as_str),
            reason = ?record.reason,
            "Match recorded"
        );
        self.history.write().await.insert(record.clone());

        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let retry = self.retry;
        self.tasks.spawn(async move {
            if persist_with_retry(store, &record, retry).await {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    pub async fn recent(&self, limit: usize) -> Vec<MatchRecord> {
        self.history.read().await.recent(limit)
    }

    pub async fn by_participant(&self, id: &ParticipantId, limit: usize) -> Vec<MatchRecord> {
        self.history.read().await.by_participant(id, limit)
    }

    pub async fn by_room(&self, room_code: &str) -> Vec<MatchRecord> {
        self.history.read().await.by_room(room_code)
    }

    pub async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        self.history.read().await.leaderboard(limit)
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<MatchRecord> {
        self.history.read().await.subscribe()
    }

    pub async fn stats(&self) -> HistoryStats {
        HistoryStats {
            stored: self.history.read().await.len(),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.failed.load(Ordering::Relaxed),
            pending_writes: self.tasks.len(),
        }
    }

    /// Wait for background writes that are still in flight.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn persist_with_retry(
    store: Arc<dyn MatchStore>,
    record: &MatchRecord,
    retry: RetryPolicy,
) -> bool {
    for attempt in 0..retry.attempts {
        let writer = Arc::clone(&store);
        let pending = record.clone();
        let result = tokio::task::spawn_blocking(move || writer.append(&pending))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                tracing::debug!(match_id = %record.id, attempt = attempt + 1, "Match persisted");
                return true;
            },
            Err(e) => {
                tracing::warn!(
                    match_id = %record.id,
                    attempt = attempt + 1,
                    max_attempts = retry.attempts,
                    error = %e,
                    "Failed to persist match, retrying"
                );
                if attempt + 1 < retry.attempts {
                    tokio::time::sleep(retry.delay(attempt)).await;
                }
            },
        }
    }

    tracing::error!(
        match_id = %record.id,
        room = %record.room_code,
        "Giving up on persisting match"
    );
    false
}
