use binlog_pitr_core::{transaction_prefix_len, ApplySink, BinlogEvent, LogPosition, PitrError};
use std::fmt::{self, Display, Formatter};
use tracing::{debug, info, warn};

use crate::segment::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Ready,
    Applying,
    Completed,
    Failed,
}

impl Display for ApplyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplyState::Ready => "ready",
            ApplyState::Applying => "applying",
            ApplyState::Completed => "completed",
            ApplyState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub state: ApplyState,
    pub base: LogPosition,
    /// End of the last transaction handed to the sink, `base` if none.
    pub applied_through: LogPosition,
    pub segments_applied: u64,
    pub events_applied: u64,
    /// Events at or before the base, already present in the target.
    pub events_skipped: u64,
    /// Events beyond the cutoff or belonging to an unfinished transaction.
    pub events_discarded: u64,
}

/// Drives an [`ApplySink`] over an ordered chain of segments.
///
/// The sink only ever sees whole transactions: a transaction that spans a
/// segment boundary is held back and handed over together with the rest of
/// it from the next segment. The final segment is applied up to the cutoff,
/// and whatever is left over after it is dropped.
pub struct ApplyEngine<S: ApplySink> {
    sink: S,
    state: ApplyState,
    base: LogPosition,
    /// End of the last segment consumed; the next one must start here.
    consumed: Option<LogPosition>,
    applied_through: LogPosition,
    pending: Vec<BinlogEvent>,
    segments_applied: u64,
    events_applied: u64,
    events_skipped: u64,
    events_discarded: u64,
}

impl<S: ApplySink> ApplyEngine<S> {
    pub fn new(sink: S, base: LogPosition) -> Self {
        Self {
            sink,
            state: ApplyState::Ready,
            base,
            consumed: None,
            applied_through: base,
            pending: Vec::new(),
            segments_applied: 0,
            events_applied: 0,
            events_skipped: 0,
            events_discarded: 0,
        }
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    pub fn applied_through(&self) -> LogPosition {
        self.applied_through
    }

    /// Events held back because their transaction is not finished yet.
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Apply every complete transaction of a non-final segment.
    pub async fn apply_segment(&mut self, segment: &Segment) -> Result<(), PitrError> {
        let batch = self.admit(segment)?;
        let len = transaction_prefix_len(&batch, None);
        let result = if len > 0 {
            self.sink.apply_all(&batch[..len]).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            self.state = ApplyState::Failed;
            return Err(e);
        }
        self.record_applied(&batch[..len]);
        self.pending = batch[len..].to_vec();
        self.segments_applied += 1;
        debug!(
            target: "apply",
            sequence = segment.header.sequence,
            applied = len,
            carried = self.pending.len(),
            applied_through = %self.applied_through,
            "segment applied"
        );
        Ok(())
    }

    /// Apply the cutoff segment: complete transactions ending at or before
    /// `cutoff` go to the sink, the remainder is discarded.
    pub async fn apply_final_segment(
        &mut self,
        segment: &Segment,
        cutoff: LogPosition,
    ) -> Result<(), PitrError> {
        let batch = self.admit(segment)?;
        let len = transaction_prefix_len(&batch, Some(cutoff));
        if let Err(e) = self.sink.apply_up_to(&batch, cutoff).await {
            self.state = ApplyState::Failed;
            return Err(e);
        }
        self.record_applied(&batch[..len]);
        self.segments_applied += 1;
        self.discard(batch.len() - len, cutoff);
        self.state = ApplyState::Completed;
        info!(
            target: "apply",
            sequence = segment.header.sequence,
            cutoff = %cutoff,
            applied_through = %self.applied_through,
            "cutoff segment applied"
        );
        Ok(())
    }

    /// Close the run without a cutoff segment, dropping any unfinished tail.
    pub fn finish(&mut self) -> Result<(), PitrError> {
        self.ensure_open()?;
        let carried = self.pending.len();
        let at = self.consumed.unwrap_or(self.base);
        self.discard(carried, at);
        self.state = ApplyState::Completed;
        Ok(())
    }

    pub fn report(&self) -> ApplyReport {
        ApplyReport {
            state: self.state,
            base: self.base,
            applied_through: self.applied_through,
            segments_applied: self.segments_applied,
            events_applied: self.events_applied,
            events_skipped: self.events_skipped,
            events_discarded: self.events_discarded,
        }
    }

    pub fn into_parts(self) -> (S, ApplyReport) {
        let report = self.report();
        (self.sink, report)
    }

    fn ensure_open(&self) -> Result<(), PitrError> {
        match self.state {
            ApplyState::Ready | ApplyState::Applying => Ok(()),
            state => Err(PitrError::Fatal(format!(
                "apply engine is {}, no further segments accepted",
                state
            ))),
        }
    }

    /// Check contiguity and return pending events followed by the new ones.
    fn admit(&mut self, segment: &Segment) -> Result<Vec<BinlogEvent>, PitrError> {
        self.ensure_open()?;
        let header = &segment.header;
        match self.consumed {
            None if header.start > self.base => {
                self.state = ApplyState::Failed;
                return Err(PitrError::IncompleteHistory {
                    expected: self.base,
                    detail: format!(
                        "first segment {} starts at {}, after the base",
                        header.sequence, header.start
                    ),
                });
            }
            Some(end) if header.start != end => {
                self.state = ApplyState::Failed;
                return Err(PitrError::IncompleteHistory {
                    expected: end,
                    detail: format!(
                        "segment {} starts at {}",
                        header.sequence, header.start
                    ),
                });
            }
            _ => {}
        }
        self.state = ApplyState::Applying;
        self.consumed = Some(header.end);

        let mut batch = std::mem::take(&mut self.pending);
        batch.reserve(segment.events.len());
        for event in &segment.events {
            if !event.is_preamble() && event.next <= self.base {
                self.events_skipped += 1;
                continue;
            }
            batch.push(event.clone());
        }
        Ok(batch)
    }

    fn record_applied(&mut self, applied: &[BinlogEvent]) {
        if let Some(last) = applied.iter().rev().find(|e| !e.is_preamble()) {
            self.applied_through = last.next;
        }
        self.events_applied += applied.len() as u64;
    }

    fn discard(&mut self, count: usize, at: LogPosition) {
        self.pending.clear();
        if count > 0 {
            warn!(
                target: "apply",
                discarded = count,
                at = %at,
                "dropping events past the last complete transaction"
            );
        }
        self.events_discarded += count as u64;
    }
}
