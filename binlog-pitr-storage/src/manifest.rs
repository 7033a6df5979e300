use binlog_pitr_core::{LogPosition, PitrError, StorageBackend};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::pitr_metrics::{MANIFEST_CONSISTENCY_ISSUES_TOTAL, MANIFEST_LIST_TOTAL};
use crate::retry::RetryPolicy;
use crate::segment::{Segment, SegmentHeader, HEADER_SIZE};

/// Width of the zero-padded sequence in segment keys; lexicographic order of
/// keys equals numeric order of sequences.
pub const SEQUENCE_WIDTH: usize = 20;

/// A segment as seen through the listing: its key plus its decoded header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub key: String,
    pub header: SegmentHeader,
}

/// Where the next collection cycle starts, derived from the newest segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursor {
    pub next_sequence: u64,
    pub position: LogPosition,
    pub last_key: Option<String>,
    pub last_captured_to: Option<DateTime<Utc>>,
}

/// Two segments claiming the same start position. The newer key wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub start: LogPosition,
    pub winner_key: String,
    pub superseded_key: String,
}

/// Result of walking the manifest from a base position towards a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSelection {
    /// Non-empty segments to replay, in order. When `complete`, the last one
    /// is the cutoff segment.
    pub segments: Vec<ManifestEntry>,
    pub issues: Vec<ConsistencyIssue>,
    /// End of the contiguous history walked so far.
    pub reached: LogPosition,
    /// Whether a segment covering the target was found.
    pub complete: bool,
}

impl ChainSelection {
    pub fn cutoff_segment(&self) -> Option<&ManifestEntry> {
        if self.complete {
            self.segments.last()
        } else {
            None
        }
    }
}

/// Durable ordering model over the segment objects of one collection stream.
///
/// Keys are `<stream-id>/<sequence:020>`. The listing is the single source of
/// truth and is re-read on every call; nothing is cached.
#[derive(Clone)]
pub struct SegmentManifest {
    backend: Arc<dyn StorageBackend>,
    stream_id: String,
    read_retry: RetryPolicy,
}

impl std::fmt::Debug for SegmentManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManifest")
            .field("provider", &self.backend.provider())
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl SegmentManifest {
    pub fn new(backend: Arc<dyn StorageBackend>, stream_id: &str) -> Result<Self, PitrError> {
        let stream_id = stream_id.trim_matches('/');
        if stream_id.is_empty() || stream_id.contains('/') {
            return Err(PitrError::Fatal(format!(
                "invalid stream id '{}': must be non-empty and contain no '/'",
                stream_id
            )));
        }
        Ok(Self {
            backend,
            stream_id: stream_id.to_string(),
            read_retry: RetryPolicy::default(),
        })
    }

    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn segment_key(&self, sequence: u64) -> String {
        format!(
            "{}/{:0width$}",
            self.stream_id,
            sequence,
            width = SEQUENCE_WIDTH
        )
    }

    /// Sequence encoded in a segment key, or `None` for foreign objects.
    pub fn parse_sequence(&self, key: &str) -> Option<u64> {
        let name = key
            .strip_prefix(self.stream_id.as_str())?
            .strip_prefix('/')?;
        if name.len() != SEQUENCE_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        name.parse().ok()
    }

    /// Segment keys in logical order. Foreign objects under the prefix are ignored.
    pub async fn list_keys(&self) -> Result<Vec<String>, PitrError> {
        let prefix = format!("{}/", self.stream_id);
        let mut keys = self
            .read_retry
            .run("list segments", || self.backend.list(&prefix))
            .await?;
        counter!(MANIFEST_LIST_TOTAL.name, "provider" => self.backend.provider().to_string())
            .increment(1);
        keys.retain(|k| self.parse_sequence(k).is_some());
        keys.sort();
        Ok(keys)
    }

    /// Header-only read of one segment object.
    pub async fn read_header(&self, key: &str) -> Result<SegmentHeader, PitrError> {
        let bytes = self
            .read_retry
            .run("read segment header", || {
                self.backend.get_range(key, 0..HEADER_SIZE as u64)
            })
            .await?;
        let header = SegmentHeader::decode(&bytes).map_err(|e| PitrError::corrupt(key, e))?;
        if self.parse_sequence(key) != Some(header.sequence) {
            return Err(PitrError::corrupt(
                key,
                format!("header sequence {} does not match key", header.sequence),
            ));
        }
        Ok(header)
    }

    /// List and header-decode every segment of the stream.
    pub async fn list_entries(&self) -> Result<Vec<ManifestEntry>, PitrError> {
        let keys = self.list_keys().await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let header = self.read_header(&key).await?;
            entries.push(ManifestEntry { key, header });
        }
        debug!(
            target: "manifest",
            stream = %self.stream_id,
            segments = entries.len(),
            "listed manifest"
        );
        Ok(entries)
    }

    /// Resume point for the next cycle: the newest segment's end, or
    /// `cold_start` when nothing has been collected yet.
    pub async fn resolve_resume_point(
        &self,
        cold_start: LogPosition,
    ) -> Result<ResumeCursor, PitrError> {
        let keys = self.list_keys().await?;
        let Some(last_key) = keys.last() else {
            return Ok(ResumeCursor {
                next_sequence: 1,
                position: cold_start,
                last_key: None,
                last_captured_to: None,
            });
        };
        let header = self.read_header(last_key).await?;
        Ok(ResumeCursor {
            next_sequence: header.sequence + 1,
            position: header.end,
            last_key: Some(last_key.clone()),
            last_captured_to: Some(header.captured_to),
        })
    }

    /// Persist a new segment under the key derived from its sequence.
    ///
    /// Returns the key. Fails with `Conflict` if the key already exists and
    /// passes `TransientIo` through for the caller to retry.
    pub async fn append(&self, segment: &Segment) -> Result<String, PitrError> {
        let key = self.segment_key(segment.header.sequence);
        self.backend.put(&key, segment.encode()).await?;
        info!(
            target: "manifest",
            stream = %self.stream_id,
            key = %key,
            start = %segment.header.start,
            end = %segment.header.end,
            events = segment.header.event_count,
            "segment appended"
        );
        Ok(key)
    }

    /// Full read of a segment with header and payload verification.
    pub async fn read_segment(&self, entry: &ManifestEntry) -> Result<Segment, PitrError> {
        let bytes = self
            .read_retry
            .run("read segment", || self.backend.get(&entry.key))
            .await?;
        let segment = Segment::decode(&bytes).map_err(|e| PitrError::corrupt(&entry.key, e))?;
        if segment.header != entry.header {
            return Err(PitrError::corrupt(
                &entry.key,
                "object changed since it was listed",
            ));
        }
        Ok(segment)
    }

    /// Ordered, gap-free chain of segments from `from` up to the one covering `to`.
    pub async fn select_chain(
        &self,
        from: LogPosition,
        to: LogPosition,
    ) -> Result<ChainSelection, PitrError> {
        let entries = self.list_entries().await?;
        self.select_chain_from(entries, from, to)
    }

    /// Same as [`select_chain`](Self::select_chain) over an existing listing.
    pub fn select_chain_from(
        &self,
        entries: Vec<ManifestEntry>,
        from: LogPosition,
        to: LogPosition,
    ) -> Result<ChainSelection, PitrError> {
        let selection = select_chain_in(entries, from, to)?;
        for issue in &selection.issues {
            warn!(
                target: "manifest",
                stream = %self.stream_id,
                start = %issue.start,
                winner = %issue.winner_key,
                superseded = %issue.superseded_key,
                "two segments claim the same start position"
            );
            counter!(MANIFEST_CONSISTENCY_ISSUES_TOTAL.name).increment(1);
        }
        Ok(selection)
    }
}

/// Chain selection over an already listed manifest (`entries` in key order).
///
/// - Non-empty segments sharing a start position: the greatest key wins, the
///   others are reported in `issues`.
/// - The walk starts at the first non-empty segment ending after `from`; it
///   must not start after `from`.
/// - Every following segment must start exactly where the previous one ended:
///   a hole is `IncompleteHistory`, an overlap is `Conflict`.
/// - The walk stops at the first segment covering `to`.
pub fn select_chain_in(
    mut entries: Vec<ManifestEntry>,
    from: LogPosition,
    to: LogPosition,
) -> Result<ChainSelection, PitrError> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    if to <= from {
        return Ok(ChainSelection {
            reached: from,
            complete: true,
            ..Default::default()
        });
    }

    let issues = resolve_duplicate_starts(&mut entries);

    let first = entries
        .iter()
        .position(|e| !e.header.is_empty() && e.header.end > from);
    let Some(first) = first else {
        return Ok(ChainSelection {
            issues,
            reached: from,
            ..Default::default()
        });
    };

    let head = &entries[first];
    if head.header.start > from {
        return Err(PitrError::IncompleteHistory {
            expected: from,
            detail: format!(
                "earliest usable segment '{}' starts at {}",
                head.key, head.header.start
            ),
        });
    }

    let mut selection = ChainSelection {
        issues,
        reached: head.header.end,
        ..Default::default()
    };
    selection.complete = head.header.covers(to);
    selection.segments.push(head.clone());

    for entry in entries.into_iter().skip(first + 1) {
        if selection.complete {
            break;
        }
        let start = entry.header.start;
        if start > selection.reached {
            return Err(PitrError::IncompleteHistory {
                expected: selection.reached,
                detail: format!("next segment '{}' starts at {}", entry.key, start),
            });
        }
        if start < selection.reached {
            return Err(PitrError::conflict(
                &entry.key,
                format!(
                    "segment starts at {} inside already covered history ending at {}",
                    start, selection.reached
                ),
            ));
        }
        if entry.header.is_empty() {
            continue;
        }
        selection.reached = entry.header.end;
        selection.complete = entry.header.covers(to);
        selection.segments.push(entry);
    }
    Ok(selection)
}

fn resolve_duplicate_starts(entries: &mut Vec<ManifestEntry>) -> Vec<ConsistencyIssue> {
    // entries are in key order, so the last one seen per start is the newest
    let mut winner: HashMap<LogPosition, usize> = HashMap::new();
    for (idx, e) in entries.iter().enumerate() {
        if !e.header.is_empty() {
            winner.insert(e.header.start, idx);
        }
    }
    let mut issues = Vec::new();
    for (idx, e) in entries.iter().enumerate() {
        if e.header.is_empty() {
            continue;
        }
        if let Some(&w) = winner.get(&e.header.start) {
            if w != idx {
                issues.push(ConsistencyIssue {
                    start: e.header.start,
                    winner_key: entries[w].key.clone(),
                    superseded_key: e.key.clone(),
                });
            }
        }
    }
    let mut idx = 0usize;
    entries.retain(|e| {
        let keep = e.header.is_empty() || winner.get(&e.header.start) == Some(&idx);
        idx += 1;
        keep
    });
    issues
}
