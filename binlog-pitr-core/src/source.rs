use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::errors::PitrError;
use crate::event::BinlogEvent;
use crate::position::LogPosition;

/// Stream of binlog events in source order. Dropping the stream closes it.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BinlogEvent, PitrError>> + Send>>;

/// A resumable reader of the source database's binlog.
///
/// `open_stream(from)` yields the events that follow `from`, in order. The
/// stream may stay pending while the source is idle; callers bound it with a
/// deadline. If the source has already purged `from`, opening fails with
/// `PitrError::PositionUnavailable`.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn open_stream(&self, from: LogPosition) -> Result<EventStream, PitrError>;

    /// Concrete coordinate a stream opened at `from` starts after.
    ///
    /// A cold start asks for `LogPosition::ORIGIN`; sources that no longer
    /// hold their oldest history answer with the first coordinate they can
    /// still serve, so a segment never claims positions the source dropped.
    async fn resolve_start(&self, from: LogPosition) -> Result<LogPosition, PitrError> {
        Ok(from)
    }
}
