use async_trait::async_trait;

use crate::errors::PitrError;
use crate::event::BinlogEvent;
use crate::position::LogPosition;

/// Downstream primitive that replays binlog events into the recovery target.
///
/// Implementations must apply transactions atomically and tolerate being
/// re-invoked with the same events after a crash.
#[async_trait]
pub trait ApplySink: Send {
    /// Apply every event in `events`. Callers only pass whole transactions,
    /// optionally preceded by preamble events.
    async fn apply_all(&mut self, events: &[BinlogEvent]) -> Result<(), PitrError>;

    /// Apply the complete transactions of `events` that end at or before `cutoff`.
    /// A transaction straddling `cutoff` is not applied.
    async fn apply_up_to(
        &mut self,
        events: &[BinlogEvent],
        cutoff: LogPosition,
    ) -> Result<(), PitrError> {
        let len = transaction_prefix_len(events, Some(cutoff));
        if len == 0 {
            return Ok(());
        }
        self.apply_all(&events[..len]).await
    }
}

/// Length of the longest prefix of `events` that ends on a transaction boundary.
///
/// With a `cutoff`, the prefix additionally stops before the first event whose
/// `next` lies beyond `cutoff`, so a transaction that has not completed by
/// `cutoff` is excluded in full. Preamble events never form a boundary.
pub fn transaction_prefix_len(events: &[BinlogEvent], cutoff: Option<LogPosition>) -> usize {
    let mut len = 0usize;
    for (idx, event) in events.iter().enumerate() {
        if let Some(limit) = cutoff {
            if event.next > limit {
                break;
            }
        }
        if event.ends_transaction() && !event.is_preamble() {
            len = idx + 1;
        }
    }
    len
}
