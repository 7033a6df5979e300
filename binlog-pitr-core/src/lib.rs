pub mod apply;
pub mod errors;
pub mod event;
pub mod position;
pub mod source;
pub mod storage;

pub use apply::{transaction_prefix_len, ApplySink};
pub use errors::{PitrError, Result};
pub use event::{BinlogEvent, EventFlags};
pub use position::LogPosition;
pub use source::{EventSource, EventStream};
pub use storage::StorageBackend;
