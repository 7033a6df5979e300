use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A coordinate in the source binlog stream: binlog file sequence number
/// (the numeric suffix of `binlog.000042`) and byte offset inside that file.
///
/// Ordering is by file first, then by offset, which matches the order in which
/// the source server writes events.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct LogPosition {
    pub file_seq: u64,
    pub offset: u64,
}

impl LogPosition {
    /// Start-of-time sentinel used when nothing has been collected yet.
    pub const ORIGIN: LogPosition = LogPosition {
        file_seq: 0,
        offset: 0,
    };

    pub const fn new(file_seq: u64, offset: u64) -> Self {
        Self { file_seq, offset }
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }
}

impl Display for LogPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_seq, self.offset)
    }
}

impl FromStr for LogPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, offset) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("invalid log position '{}', expected <file_seq>:<offset>", s))?;
        let file_seq = file
            .parse::<u64>()
            .map_err(|e| format!("invalid file sequence in '{}': {}", s, e))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|e| format!("invalid offset in '{}': {}", s, e))?;
        Ok(Self { file_seq, offset })
    }
}

impl TryFrom<String> for LogPosition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogPosition> for String {
    fn from(pos: LogPosition) -> Self {
        pos.to_string()
    }
}
