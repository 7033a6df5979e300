use binlog_pitr_core::{ApplySink, LogPosition, PitrError};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::fmt::{self, Display, Formatter};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply_engine::{ApplyEngine, ApplyReport};
use crate::manifest::{ConsistencyIssue, ManifestEntry, SegmentManifest};
use crate::pitr_metrics::{
    RECOVERY_EVENTS_APPLIED_TOTAL, RECOVERY_RUNS_TOTAL, RECOVERY_SEGMENTS_APPLIED_TOTAL,
    RECOVERY_SEGMENT_FETCH_LATENCY_MS,
};
use crate::retry::RetryPolicy;

/// Where replay has to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTarget {
    /// Stop at the last transaction boundary at or before this coordinate.
    Position(LogPosition),
    /// Apply every transaction committed at or before this instant.
    Timestamp(DateTime<Utc>),
}

impl Display for RecoveryTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTarget::Position(p) => write!(f, "position {}", p),
            RecoveryTarget::Timestamp(t) => write!(f, "time {}", t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecovererConfig {
    /// Position the target database is already consistent up to.
    pub base: LogPosition,
    pub target: RecoveryTarget,
    /// Replay everything that was captured when the target lies beyond the
    /// newest segment, instead of failing with `TargetNotCaptured`.
    pub allow_partial_target: bool,
    pub read_retry: RetryPolicy,
}

/// Segments selected for one run plus the cutoff inside the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub base: LogPosition,
    pub target: RecoveryTarget,
    pub cutoff: LogPosition,
    pub segments: Vec<ManifestEntry>,
    pub issues: Vec<ConsistencyIssue>,
    /// The target was not captured yet and the plan stops at the newest data.
    pub partial: bool,
}

impl RecoveryPlan {
    pub fn cutoff_segment(&self) -> Option<&ManifestEntry> {
        self.segments.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cutoff: LogPosition,
    pub partial: bool,
    pub segments_planned: usize,
    pub apply: ApplyReport,
}

/// Replays captured segments into a recovery target through an [`ApplySink`].
#[derive(Debug, Clone)]
pub struct Recoverer {
    cfg: RecovererConfig,
    manifest: SegmentManifest,
}

impl Recoverer {
    pub fn new(cfg: RecovererConfig, manifest: SegmentManifest) -> Self {
        let manifest = manifest.with_read_retry(cfg.read_retry);
        Self { cfg, manifest }
    }

    pub fn config(&self) -> &RecovererConfig {
        &self.cfg
    }

    /// Resolve the target and select the segment chain, without applying anything.
    pub async fn plan(&self) -> Result<RecoveryPlan, PitrError> {
        let base = self.cfg.base;
        let entries = self.manifest.list_entries().await?;
        let (cutoff, mut partial) = self.resolve_cutoff(&entries).await?;

        let selection = self.manifest.select_chain_from(entries, base, cutoff)?;
        let mut cutoff = cutoff;
        if !selection.complete {
            if !self.cfg.allow_partial_target {
                return Err(PitrError::TargetNotCaptured {
                    target: self.cfg.target.to_string(),
                    latest: selection.reached,
                });
            }
            warn!(
                target: "recoverer",
                target_cutoff = %cutoff,
                reached = %selection.reached,
                "target not captured yet, recovering up to the newest segment"
            );
            cutoff = selection.reached;
            partial = true;
        }

        let plan = RecoveryPlan {
            base,
            target: self.cfg.target,
            cutoff,
            segments: selection.segments,
            issues: selection.issues,
            partial,
        };
        info!(
            target: "recoverer",
            base = %plan.base,
            cutoff = %plan.cutoff,
            segments = plan.segments.len(),
            first = plan.segments.first().map(|e| e.key.as_str()).unwrap_or(""),
            last = plan.segments.last().map(|e| e.key.as_str()).unwrap_or(""),
            partial = plan.partial,
            "recovery plan ready"
        );
        Ok(plan)
    }

    /// Plan and replay. Cancellation is honoured between segments only, where
    /// the sink is always at a transaction boundary.
    pub async fn run<S: ApplySink>(
        &self,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, PitrError> {
        let result = match self.plan().await {
            Ok(plan) => self.execute(&plan, sink, cancel).await,
            Err(e) => Err(e),
        };
        let label = match &result {
            Ok(r) if r.partial => "partial",
            Ok(_) => "completed",
            Err(_) => "error",
        };
        counter!(RECOVERY_RUNS_TOTAL.name, "result" => label).increment(1);
        result
    }

    pub async fn execute<S: ApplySink>(
        &self,
        plan: &RecoveryPlan,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, PitrError> {
        let mut engine = ApplyEngine::new(sink, plan.base);
        let total = plan.segments.len();

        for (idx, entry) in plan.segments.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    target: "recoverer",
                    next_key = %entry.key,
                    applied_through = %engine.applied_through(),
                    "recovery cancelled between segments"
                );
                return Err(PitrError::Cancelled);
            }

            let fetch = Instant::now();
            let segment = self.manifest.read_segment(entry).await?;
            histogram!(RECOVERY_SEGMENT_FETCH_LATENCY_MS.name)
                .record(fetch.elapsed().as_millis() as f64);

            let before = engine.report().events_applied;
            if idx + 1 == total {
                engine.apply_final_segment(&segment, plan.cutoff).await?;
            } else {
                engine.apply_segment(&segment).await?;
            }
            counter!(RECOVERY_SEGMENTS_APPLIED_TOTAL.name).increment(1);
            counter!(RECOVERY_EVENTS_APPLIED_TOTAL.name)
                .increment(engine.report().events_applied - before);
        }
        if total == 0 {
            engine.finish()?;
        }

        let (_sink, apply) = engine.into_parts();
        info!(
            target: "recoverer",
            applied_through = %apply.applied_through,
            segments = apply.segments_applied,
            events = apply.events_applied,
            discarded = apply.events_discarded,
            "recovery completed"
        );
        Ok(RecoveryReport {
            cutoff: plan.cutoff,
            partial: plan.partial,
            segments_planned: total,
            apply,
        })
    }

    /// Turn the target into a coordinate. The flag reports a partial cutoff.
    async fn resolve_cutoff(&self, entries: &[ManifestEntry]) -> Result<(LogPosition, bool), PitrError> {
        let ts = match self.cfg.target {
            RecoveryTarget::Position(p) => return Ok((p, false)),
            RecoveryTarget::Timestamp(ts) => ts,
        };
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Err(PitrError::TargetNotCaptured {
                target: self.cfg.target.to_string(),
                latest: self.cfg.base,
            });
        };
        if ts < first.header.captured_from {
            return Err(PitrError::IncompleteHistory {
                expected: first.header.start,
                detail: format!(
                    "target time {} precedes the earliest capture at {}",
                    ts.to_rfc3339(),
                    first.header.captured_from.to_rfc3339()
                ),
            });
        }
        let Some(entry) = entries.iter().find(|e| e.header.captured_to >= ts) else {
            if self.cfg.allow_partial_target {
                return Ok((last.header.end, true));
            }
            return Err(PitrError::TargetNotCaptured {
                target: self.cfg.target.to_string(),
                latest: last.header.end,
            });
        };
        if entry.header.is_empty() {
            return Ok((entry.header.start, false));
        }

        // the cutoff is the start of the first transaction event written after ts
        let segment = self.manifest.read_segment(entry).await?;
        let limit = ts.timestamp();
        let mut prev = segment.header.start;
        for event in &segment.events {
            if !event.is_preamble() && i64::from(event.timestamp) > limit {
                return Ok((prev, false));
            }
            prev = event.next;
        }
        Ok((segment.header.end, false))
    }
}
