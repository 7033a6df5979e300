use binlog_pitr_core::{BinlogEvent, EventSource, LogPosition, PitrError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::frames::frame_len;
use crate::manifest::{ResumeCursor, SegmentManifest};
use crate::pitr_metrics::{
    COLLECTOR_APPEND_RETRIES_TOTAL, COLLECTOR_CYCLES_TOTAL, COLLECTOR_CYCLE_LATENCY_MS,
    COLLECTOR_EVENTS_TOTAL, COLLECTOR_SEGMENTS_COMMITTED_TOTAL, COLLECTOR_SEGMENT_BYTES_TOTAL,
};
use crate::retry::RetryPolicy;
use crate::segment::Segment;

/// Collector configuration.
///
/// Fields:
/// - `cycle_length`: capture window of one cycle
/// - `pause_between_cycles`: sleep of the outer loop after each committed cycle
/// - `max_segment_bytes`: capture stops early once the encoded payload reaches this size
/// - `append_retry`: bounded retry of transient storage errors on commit
/// - `shutdown_grace`: window to still commit a partial capture on cancellation;
///   `None` aborts the cycle without committing
/// - `initial_position`: resume position used when the manifest is empty
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub cycle_length: Duration,
    pub pause_between_cycles: Duration,
    pub max_segment_bytes: usize,
    pub append_retry: RetryPolicy,
    pub shutdown_grace: Option<Duration>,
    pub initial_position: LogPosition,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cycle_length: Duration::from_secs(60),
            pause_between_cycles: Duration::from_secs(60),
            max_segment_bytes: 64 * 1024 * 1024, // 64 MiB
            append_retry: RetryPolicy::default(),
            shutdown_grace: Some(Duration::from_secs(2)),
            initial_position: LogPosition::ORIGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Events were captured and committed.
    Committed,
    /// Nothing happened on the source; an empty segment advanced time coverage.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub key: String,
    pub sequence: u64,
    pub start: LogPosition,
    pub end: LogPosition,
    pub events: u32,
    pub payload_bytes: u64,
    pub captured_from: DateTime<Utc>,
    pub captured_to: DateTime<Utc>,
    /// Append attempts beyond the first.
    pub append_retries: u32,
}

enum CaptureEnd {
    Deadline,
    SizeCap,
    SourceClosed,
    Cancelled,
}

/// Captures binlog events from an [`EventSource`] and commits them as segments.
///
/// The collector keeps no position of its own: every cycle starts from the
/// resume point derived from the manifest, so a restart after a crash picks
/// up exactly after the last committed segment.
pub struct Collector {
    cfg: CollectorConfig,
    manifest: SegmentManifest,
    source: Arc<dyn EventSource>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("cfg", &self.cfg)
            .field("manifest", &self.manifest)
            .finish()
    }
}

impl Collector {
    pub fn new(cfg: CollectorConfig, manifest: SegmentManifest, source: Arc<dyn EventSource>) -> Self {
        Self {
            cfg,
            manifest,
            source,
        }
    }

    pub fn manifest(&self) -> &SegmentManifest {
        &self.manifest
    }

    /// Cycle loop: run a cycle, pause, repeat until `cancel` fires.
    ///
    /// Any cycle error other than cancellation stops the loop and is returned;
    /// a supervisor restarts the process, which resumes from storage.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PitrError> {
        info!(
            target: "collector",
            stream = %self.manifest.stream_id(),
            cycle_ms = self.cfg.cycle_length.as_millis() as u64,
            "collector started"
        );
        loop {
            match self.run_cycle(&cancel).await {
                Ok(_) => {}
                Err(PitrError::Cancelled) => {
                    info!(target: "collector", "collector stopped, cycle abandoned on cancel");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        target: "collector",
                        stream = %self.manifest.stream_id(),
                        kind = e.kind(),
                        error = %e,
                        "collection cycle failed"
                    );
                    counter!(COLLECTOR_CYCLES_TOTAL.name, "result" => "error").increment(1);
                    return Err(e);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(target: "collector", "collector stopped (cancel)");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.cfg.pause_between_cycles) => {}
            }
        }
    }

    /// Run one resume / capture / commit cycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, PitrError> {
        let started = Instant::now();
        let captured_from = Utc::now();
        let mut cursor = self
            .manifest
            .resolve_resume_point(self.cfg.initial_position)
            .await?;
        let start = self.source.resolve_start(cursor.position).await?;
        if start != cursor.position {
            info!(
                target: "collector",
                requested = %cursor.position,
                start = %start,
                "source history begins later, segment starts at the oldest available position"
            );
            cursor.position = start;
        }

        let (events, ended) = self.capture(&cursor, cancel).await?;
        let captured_to = Utc::now();

        if matches!(ended, CaptureEnd::Cancelled) {
            let Some(grace) = self.cfg.shutdown_grace else {
                return Err(PitrError::Cancelled);
            };
            if events.is_empty() {
                return Err(PitrError::Cancelled);
            }
            info!(
                target: "collector",
                events = events.len(),
                grace_ms = grace.as_millis() as u64,
                "cancelled during capture, committing buffered events"
            );
            let commit = self.commit(&cursor, captured_from, captured_to, events, started);
            return match tokio::time::timeout(grace, commit).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(target: "collector", "grace window elapsed before commit confirmed");
                    Err(PitrError::Cancelled)
                }
            };
        }

        self.commit(&cursor, captured_from, captured_to, events, started)
            .await
    }

    async fn capture(
        &self,
        cursor: &ResumeCursor,
        cancel: &CancellationToken,
    ) -> Result<(Vec<BinlogEvent>, CaptureEnd), PitrError> {
        let deadline = Instant::now() + self.cfg.cycle_length;
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok((Vec::new(), CaptureEnd::Cancelled)),
            opened = tokio::time::timeout_at(deadline, self.source.open_stream(cursor.position)) => match opened {
                Ok(stream) => stream?,
                Err(_) => {
                    warn!(
                        target: "collector",
                        from = %cursor.position,
                        "event source did not open a stream before the cycle deadline"
                    );
                    return Ok((Vec::new(), CaptureEnd::Deadline));
                }
            },
        };
        let mut events = Vec::new();
        let mut bytes = 0usize;

        let ended = loop {
            if bytes >= self.cfg.max_segment_bytes {
                break CaptureEnd::SizeCap;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break CaptureEnd::Cancelled,
                next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                    Err(_) => break CaptureEnd::Deadline,
                    Ok(None) => break CaptureEnd::SourceClosed,
                    Ok(Some(Err(e))) => return Err(e),
                    Ok(Some(Ok(event))) => {
                        bytes += frame_len(&event);
                        events.push(event);
                    }
                },
            }
        };
        drop(stream);

        if matches!(ended, CaptureEnd::SizeCap) {
            info!(
                target: "collector",
                bytes,
                max_bytes = self.cfg.max_segment_bytes,
                "segment size cap reached, cutting cycle short"
            );
        }
        if matches!(ended, CaptureEnd::SourceClosed) {
            warn!(target: "collector", from = %cursor.position, "event source closed the stream");
        }
        Ok((events, ended))
    }

    async fn commit(
        &self,
        cursor: &ResumeCursor,
        captured_from: DateTime<Utc>,
        captured_to: DateTime<Utc>,
        events: Vec<BinlogEvent>,
        started: Instant,
    ) -> Result<CycleReport, PitrError> {
        let segment = Segment::build(
            cursor.next_sequence,
            cursor.position,
            captured_from,
            captured_to,
            events,
        )
        .map_err(|e| PitrError::Fatal(format!("event source produced an invalid stream: {}", e)))?;

        let (key, append_retries) = self.append_with_retries(&segment).await?;

        let header = &segment.header;
        let outcome = if header.event_count == 0 {
            CycleOutcome::Idle
        } else {
            CycleOutcome::Committed
        };
        let provider = self.manifest.backend().provider().to_string();
        counter!(COLLECTOR_SEGMENTS_COMMITTED_TOTAL.name, "provider" => provider.clone())
            .increment(1);
        counter!(COLLECTOR_SEGMENT_BYTES_TOTAL.name, "provider" => provider)
            .increment(header.payload_len);
        counter!(COLLECTOR_EVENTS_TOTAL.name).increment(header.event_count as u64);
        counter!(
            COLLECTOR_CYCLES_TOTAL.name,
            "result" => if outcome == CycleOutcome::Idle { "empty" } else { "committed" }
        )
        .increment(1);
        histogram!(COLLECTOR_CYCLE_LATENCY_MS.name).record(started.elapsed().as_millis() as f64);

        info!(
            target: "collector",
            key = %key,
            start = %header.start,
            end = %header.end,
            events = header.event_count,
            bytes = header.payload_len,
            "cycle committed"
        );

        Ok(CycleReport {
            outcome,
            key,
            sequence: header.sequence,
            start: header.start,
            end: header.end,
            events: header.event_count,
            payload_bytes: header.payload_len,
            captured_from: header.captured_from,
            captured_to: header.captured_to,
            append_retries,
        })
    }

    /// Append with the same buffer until it lands or retries run out.
    ///
    /// A `Conflict` after a transient failure means an earlier attempt may
    /// have been stored with its acknowledgement lost; it counts as success
    /// when the stored header is the one being written.
    async fn append_with_retries(&self, segment: &Segment) -> Result<(String, u32), PitrError> {
        let policy = self.cfg.append_retry;
        let mut attempt = 1u32;
        loop {
            match self.manifest.append(segment).await {
                Ok(key) => return Ok((key, attempt - 1)),
                Err(PitrError::Conflict { key, reason }) if attempt > 1 => {
                    let stored = self.manifest.read_header(&key).await?;
                    if stored == segment.header {
                        info!(
                            target: "collector",
                            key = %key,
                            "segment already stored by an earlier attempt"
                        );
                        return Ok((key, attempt - 1));
                    }
                    return Err(PitrError::Conflict { key, reason });
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        target: "collector",
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "segment append failed, retrying with the same buffer"
                    );
                    counter!(COLLECTOR_APPEND_RETRIES_TOTAL.name).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(policy.exhausted("append segment", e));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
