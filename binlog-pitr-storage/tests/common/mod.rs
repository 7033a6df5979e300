#![allow(dead_code)]

use async_trait::async_trait;
use binlog_pitr_core::{
    ApplySink, BinlogEvent, EventFlags, EventSource, EventStream, LogPosition, PitrError,
    StorageBackend,
};
use binlog_pitr_storage::{
    BackendConfig, Collector, CollectorConfig, CycleReport, LocalBackend, ObjectStore,
    RetryPolicy, SegmentManifest,
};
use futures::StreamExt;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const STREAM_ID: &str = "mysql-primary";

pub fn pos(offset: u64) -> LogPosition {
    LogPosition::new(1, offset)
}

/// Transaction script: `(next offset, ends transaction)`, stamped with the current time.
pub fn script(events: &[(u64, bool)]) -> Vec<BinlogEvent> {
    let now = chrono::Utc::now().timestamp() as u32;
    events
        .iter()
        .map(|&(next, end)| {
            let flags = if end {
                EventFlags::TRANSACTION_END
            } else {
                EventFlags::NONE
            };
            BinlogEvent::new(format!("event@{}", next).into_bytes(), pos(next), now, flags)
        })
        .collect()
}

pub fn memory_store(root: &str) -> Arc<ObjectStore> {
    Arc::new(
        ObjectStore::new(BackendConfig::Local {
            backend: LocalBackend::Memory,
            root: root.to_string(),
        })
        .expect("create memory store"),
    )
}

pub fn manifest_over(backend: Arc<dyn StorageBackend>) -> SegmentManifest {
    SegmentManifest::new(backend, STREAM_ID)
        .expect("manifest")
        .with_read_retry(RetryPolicy::new(3, Duration::from_millis(1)))
}

pub fn fast_collector_config(cycle_ms: u64) -> CollectorConfig {
    CollectorConfig {
        cycle_length: Duration::from_millis(cycle_ms),
        pause_between_cycles: Duration::from_millis(cycle_ms),
        max_segment_bytes: 1024 * 1024,
        append_retry: RetryPolicy::new(4, Duration::from_millis(1)),
        shutdown_grace: None,
        initial_position: LogPosition::ORIGIN,
    }
}

#[derive(Default)]
struct SourceState {
    events: Vec<BinlogEvent>,
    watermark: LogPosition,
    purged_before: LogPosition,
    history_start: Option<LogPosition>,
    open_delay: Option<Duration>,
    opened_from: Vec<LogPosition>,
}

/// In-memory binlog: events become visible as the watermark moves forward.
/// A stream yields the visible events after its start and then stays
/// pending, like an idle replication connection.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    pub fn new(events: Vec<BinlogEvent>) -> Self {
        let source = Self::default();
        source.state.lock().unwrap().events = events;
        source
    }

    pub fn push(&self, events: Vec<BinlogEvent>) {
        self.state.lock().unwrap().events.extend(events);
    }

    pub fn set_watermark(&self, offset: u64) {
        self.state.lock().unwrap().watermark = pos(offset);
    }

    pub fn purge_before(&self, offset: u64) {
        self.state.lock().unwrap().purged_before = pos(offset);
    }

    /// Oldest coordinate the source still serves; a cold start begins here.
    pub fn start_history_at(&self, offset: u64) {
        let mut state = self.state.lock().unwrap();
        state.purged_before = pos(offset);
        state.history_start = Some(pos(offset));
    }

    /// Every later `open_stream` takes this long before it answers.
    pub fn delay_open(&self, delay: Duration) {
        self.state.lock().unwrap().open_delay = Some(delay);
    }

    pub fn opened_from(&self) -> Vec<LogPosition> {
        self.state.lock().unwrap().opened_from.clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn resolve_start(&self, from: LogPosition) -> Result<LogPosition, PitrError> {
        let state = self.state.lock().unwrap();
        match state.history_start {
            Some(start) if from.is_origin() => Ok(start),
            _ => Ok(from),
        }
    }

    async fn open_stream(&self, from: LogPosition) -> Result<EventStream, PitrError> {
        let delay = self.state.lock().unwrap().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if from < state.purged_before {
            return Err(PitrError::PositionUnavailable(from));
        }
        state.opened_from.push(from);
        let visible: Vec<Result<BinlogEvent, PitrError>> = state
            .events
            .iter()
            .filter(|e| e.next > from && e.next <= state.watermark)
            .cloned()
            .map(Ok)
            .collect();
        Ok(tokio_stream::iter(visible)
            .chain(futures::stream::pending())
            .boxed())
    }
}

/// Apply sink recording every batch it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<BinlogEvent>>>>,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.iter().map(|e| e.next.offset).collect())
            .collect()
    }

    pub fn applied(&self) -> Vec<u64> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl ApplySink for RecordingSink {
    async fn apply_all(&mut self, events: &[BinlogEvent]) -> Result<(), PitrError> {
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutFault {
    /// Fail before anything is stored.
    Transient,
    /// Store the object, then report a transient failure.
    AckLost,
    /// Another writer got there first.
    Conflict,
}

/// `StorageBackend` wrapper injecting scripted `put` faults and recording full reads.
pub struct FlakyBackend {
    inner: Arc<dyn StorageBackend>,
    faults: Mutex<VecDeque<PutFault>>,
    full_reads: Mutex<Vec<String>>,
    puts: Mutex<u32>,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            faults: Mutex::new(VecDeque::new()),
            full_reads: Mutex::new(Vec::new()),
            puts: Mutex::new(0),
        }
    }

    pub fn inject(&self, faults: &[PutFault]) {
        self.faults.lock().unwrap().extend(faults.iter().copied());
    }

    pub fn full_reads(&self) -> Vec<String> {
        self.full_reads.lock().unwrap().clone()
    }

    pub fn put_attempts(&self) -> u32 {
        *self.puts.lock().unwrap()
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PitrError> {
        *self.puts.lock().unwrap() += 1;
        let fault = self.faults.lock().unwrap().pop_front();
        match fault {
            Some(PutFault::Transient) => Err(PitrError::transient(key, "injected: connection reset")),
            Some(PutFault::AckLost) => {
                self.inner.put(key, bytes).await?;
                Err(PitrError::transient(key, "injected: response lost"))
            }
            Some(PutFault::Conflict) => Err(PitrError::conflict(key, "injected: already exists")),
            None => self.inner.put(key, bytes).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PitrError> {
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PitrError> {
        self.full_reads.lock().unwrap().push(key.to_string());
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), PitrError> {
        self.inner.delete(key).await
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, PitrError> {
        self.inner.get_range(key, range).await
    }

    fn provider(&self) -> &str {
        "flaky"
    }
}

/// Run one short cycle per watermark, asserting each commits.
pub async fn collect_through(
    collector: &Collector,
    source: &ScriptedSource,
    watermarks: &[u64],
) -> Vec<CycleReport> {
    let cancel = CancellationToken::new();
    let mut reports = Vec::new();
    for &w in watermarks {
        source.set_watermark(w);
        let report = collector.run_cycle(&cancel).await.expect("cycle commits");
        reports.push(report);
    }
    reports
}
