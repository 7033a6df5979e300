use async_trait::async_trait;
use binlog_pitr_core::{BinlogEvent, EventFlags, EventSource, EventStream, LogPosition, PitrError};
use futures::StreamExt;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

pub(crate) const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];
pub(crate) const FIRST_EVENT_OFFSET: u64 = 4;
pub(crate) const EVENT_HEADER_LEN: usize = 19;

const TYPE_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 9;
const QUERY_POST_HEADER_LEN: usize = 13;

pub(crate) mod event_type {
    pub(crate) const QUERY: u8 = 2;
    pub(crate) const STOP: u8 = 3;
    pub(crate) const ROTATE: u8 = 4;
    pub(crate) const INTVAR: u8 = 5;
    pub(crate) const RAND: u8 = 13;
    pub(crate) const USER_VAR: u8 = 14;
    pub(crate) const FORMAT_DESCRIPTION: u8 = 15;
    pub(crate) const XID: u8 = 16;
    pub(crate) const GTID: u8 = 33;
    pub(crate) const ANONYMOUS_GTID: u8 = 34;
    pub(crate) const PREVIOUS_GTIDS: u8 = 35;
}

fn event_timestamp(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn event_size(header: &[u8]) -> u64 {
    u32::from_le_bytes([
        header[SIZE_OFFSET],
        header[SIZE_OFFSET + 1],
        header[SIZE_OFFSET + 2],
        header[SIZE_OFFSET + 3],
    ]) as u64
}

/// Statement text of a QUERY event, if the event is long enough to hold one.
fn query_text(data: &[u8]) -> Option<&[u8]> {
    let post = EVENT_HEADER_LEN;
    if data.len() < post + QUERY_POST_HEADER_LEN {
        return None;
    }
    let db_len = data[post + 8] as usize;
    let status_len = u16::from_le_bytes([data[post + 11], data[post + 12]]) as usize;
    let start = post + QUERY_POST_HEADER_LEN + status_len + db_len + 1;
    data.get(start..)
}

fn starts_with_keyword(text: &[u8], keyword: &str) -> bool {
    let text = match text.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(idx) => &text[idx..],
        None => return false,
    };
    text.len() >= keyword.len() && text[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

/// Derives transaction boundary flags from raw event types.
///
/// A BEGIN query opens a transaction that an XID event or a COMMIT/ROLLBACK
/// query closes. Events outside a transaction are self-contained, except the
/// format and GTID bookkeeping events which never form a boundary.
#[derive(Debug, Default, Clone)]
pub(crate) struct TransactionTracker {
    in_txn: bool,
}

impl TransactionTracker {
    pub(crate) fn in_transaction(&self) -> bool {
        self.in_txn
    }

    pub(crate) fn classify(&mut self, data: &[u8]) -> EventFlags {
        match data[TYPE_OFFSET] {
            event_type::FORMAT_DESCRIPTION
            | event_type::PREVIOUS_GTIDS
            | event_type::ROTATE
            | event_type::STOP => EventFlags::PREAMBLE,
            event_type::GTID
            | event_type::ANONYMOUS_GTID
            | event_type::INTVAR
            | event_type::RAND
            | event_type::USER_VAR => EventFlags::NONE,
            event_type::XID => {
                self.in_txn = false;
                EventFlags::TRANSACTION_END
            }
            event_type::QUERY => {
                let text = query_text(data).unwrap_or_default();
                if starts_with_keyword(text, "BEGIN") {
                    self.in_txn = true;
                    EventFlags::NONE
                } else if starts_with_keyword(text, "COMMIT") || starts_with_keyword(text, "ROLLBACK")
                {
                    self.in_txn = false;
                    EventFlags::TRANSACTION_END
                } else {
                    self.boundary_unless_open()
                }
            }
            _ => self.boundary_unless_open(),
        }
    }

    fn boundary_unless_open(&self) -> EventFlags {
        if self.in_txn {
            EventFlags::NONE
        } else {
            EventFlags::TRANSACTION_END
        }
    }
}

/// Event source tailing the binlog files of a MySQL server from its data directory.
///
/// Files are named `<basename>.<seq>`; a position is `(seq, byte offset)`. A
/// ROTATE or STOP event moves the reader to the first event of the next file.
#[derive(Debug, Clone)]
pub(crate) struct BinlogDirSource {
    dir: PathBuf,
    basename: String,
    poll_interval: Duration,
}

impl BinlogDirSource {
    pub(crate) fn new(dir: impl Into<PathBuf>, basename: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
            poll_interval,
        }
    }

    /// Sequence numbers of the binlog files present, ascending.
    pub(crate) async fn list_files(&self) -> Result<Vec<u64>, PitrError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_fatal(&self.dir, e))?;
        let prefix = format!("{}.", self.basename);
        let mut seqs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_fatal(&self.dir, e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(seq) = suffix.parse::<u64>() {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn reader_at(&self, file_seq: u64) -> BinlogReader {
        BinlogReader {
            dir: self.dir.clone(),
            basename: self.basename.clone(),
            poll_interval: self.poll_interval,
            file_seq,
            offset: FIRST_EVENT_OFFSET,
            file: None,
            tracker: TransactionTracker::default(),
            queued: VecDeque::new(),
            pending_preamble: None,
            format_description: None,
        }
    }
}

#[async_trait]
impl EventSource for BinlogDirSource {
    async fn resolve_start(&self, from: LogPosition) -> Result<LogPosition, PitrError> {
        if !from.is_origin() {
            return Ok(from);
        }
        match self.list_files().await?.first() {
            Some(first) => Ok(LogPosition::new(*first, FIRST_EVENT_OFFSET)),
            None => Err(PitrError::Fatal(format!(
                "no binlog files named '{}.*' in {}",
                self.basename,
                self.dir.display()
            ))),
        }
    }

    async fn open_stream(&self, from: LogPosition) -> Result<EventStream, PitrError> {
        let files = self.list_files().await?;
        let (first, last) = match (files.first(), files.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Err(PitrError::Fatal(format!(
                    "no binlog files named '{}.*' in {}",
                    self.basename,
                    self.dir.display()
                )))
            }
        };

        let from_file = if from.is_origin() {
            LogPosition::new(first, FIRST_EVENT_OFFSET)
        } else {
            from
        };
        if from_file.file_seq < first
            || from_file.offset < FIRST_EVENT_OFFSET
            || from_file.file_seq > last + 1
            || (from_file.file_seq == last + 1 && from_file.offset != FIRST_EVENT_OFFSET)
        {
            return Err(PitrError::PositionUnavailable(from));
        }

        let mut reader = self.reader_at(from_file.file_seq);
        if from_file.offset > FIRST_EVENT_OFFSET {
            reader.fast_forward(from_file).await?;
        }
        info!(
            target: "binlog_source",
            from = %from_file,
            "opened binlog stream"
        );

        let stream = futures::stream::try_unfold(reader, |mut reader| async move {
            let event = reader.next_event().await?;
            Ok(Some((event, reader)))
        });
        Ok(stream.boxed())
    }
}

struct BinlogReader {
    dir: PathBuf,
    basename: String,
    poll_interval: Duration,
    file_seq: u64,
    offset: u64,
    file: Option<File>,
    tracker: TransactionTracker,
    queued: VecDeque<BinlogEvent>,
    /// Emitted just before the first event read after a mid-file resume.
    pending_preamble: Option<BinlogEvent>,
    format_description: Option<BinlogEvent>,
}

impl BinlogReader {
    fn path_for(&self, file_seq: u64) -> PathBuf {
        self.dir.join(format!("{}.{:06}", self.basename, file_seq))
    }

    fn position(&self) -> LogPosition {
        LogPosition::new(self.file_seq, self.offset)
    }

    /// Opens the current file once it exists and carries the magic header.
    async fn ensure_open(&mut self) -> Result<bool, PitrError> {
        if self.file.is_some() {
            return Ok(true);
        }
        let path = self.path_for(self.file_seq);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_fatal(&path, e)),
        };
        let len = file.metadata().await.map_err(|e| io_fatal(&path, e))?.len();
        if len < FIRST_EVENT_OFFSET {
            return Ok(false);
        }
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .await
            .map_err(|e| io_fatal(&path, e))?;
        if magic != BINLOG_MAGIC {
            return Err(PitrError::Fatal(format!(
                "{} is not a binlog file",
                path.display()
            )));
        }
        self.file = Some(file);
        Ok(true)
    }

    /// Header and declared size of the event at the current offset, or `None`
    /// while it is not fully written yet. Leaves the file positioned at the body.
    async fn read_header(&mut self) -> Result<Option<([u8; EVENT_HEADER_LEN], u64)>, PitrError> {
        let path = self.path_for(self.file_seq);
        let offset = self.offset;
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let len = file.metadata().await.map_err(|e| io_fatal(&path, e))?.len();
        if len < offset + EVENT_HEADER_LEN as u64 {
            return Ok(None);
        }

        let mut header = [0u8; EVENT_HEADER_LEN];
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_fatal(&path, e))?;
        file.read_exact(&mut header)
            .await
            .map_err(|e| io_fatal(&path, e))?;
        let size = event_size(&header);
        if size < EVENT_HEADER_LEN as u64 {
            return Err(PitrError::Fatal(format!(
                "event at {}:{} in {} declares size {}",
                self.file_seq,
                offset,
                path.display(),
                size
            )));
        }
        if len < offset + size {
            return Ok(None);
        }
        Ok(Some((header, size)))
    }

    /// Bytes of the event at the current offset, or `None` while it is not
    /// fully written yet.
    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>, PitrError> {
        let Some((header, size)) = self.read_header().await? else {
            return Ok(None);
        };
        let path = self.path_for(self.file_seq);
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let mut data = vec![0u8; size as usize];
        data[..EVENT_HEADER_LEN].copy_from_slice(&header);
        file.read_exact(&mut data[EVENT_HEADER_LEN..])
            .await
            .map_err(|e| io_fatal(&path, e))?;
        Ok(Some(data))
    }

    /// Turns raw bytes at the current offset into an event and advances past it.
    fn advance(&mut self, data: Vec<u8>) -> BinlogEvent {
        let flags = self.tracker.classify(&data);
        let event_type = data[TYPE_OFFSET];
        let timestamp = event_timestamp(&data);
        let next = match event_type {
            event_type::ROTATE | event_type::STOP => {
                debug!(
                    target: "binlog_source",
                    file_seq = self.file_seq,
                    "binlog file closed, moving to the next one"
                );
                self.file = None;
                LogPosition::new(self.file_seq + 1, FIRST_EVENT_OFFSET)
            }
            _ => LogPosition::new(self.file_seq, self.offset + data.len() as u64),
        };
        self.file_seq = next.file_seq;
        self.offset = next.offset;
        let event = BinlogEvent::new(data, next, timestamp, flags);
        if event_type == event_type::FORMAT_DESCRIPTION {
            self.format_description = Some(event.clone());
        }
        event
    }

    /// A file that ended without ROTATE (server crash) is followed by the next one.
    async fn switch_if_abandoned(&mut self) -> Result<bool, PitrError> {
        let next_path = self.path_for(self.file_seq + 1);
        let exists = tokio::fs::try_exists(&next_path)
            .await
            .map_err(|e| io_fatal(&next_path, e))?;
        if !exists {
            return Ok(false);
        }
        // the next file is created only after the current one is complete
        if self.read_raw().await?.is_some() {
            return Ok(false);
        }
        info!(
            target: "binlog_source",
            file_seq = self.file_seq,
            "binlog file ended without rotate, continuing with the next file"
        );
        self.file = None;
        self.file_seq += 1;
        self.offset = FIRST_EVENT_OFFSET;
        Ok(true)
    }

    /// Replays the current file from its first event up to `target` without
    /// emitting, rebuilding transaction state. Only QUERY and format
    /// description bodies are read; every other event is skipped by its
    /// header. The file's format description is replayed at `target` ahead of
    /// the next event so every capture that starts mid-file stays decodable
    /// on its own.
    async fn fast_forward(&mut self, target: LogPosition) -> Result<(), PitrError> {
        if !self.ensure_open().await? {
            return Err(PitrError::PositionUnavailable(target));
        }
        let mut skipped = 0u64;
        while self.offset < target.offset {
            let Some((header, size)) = self.read_header().await? else {
                return Err(PitrError::PositionUnavailable(target));
            };
            let end = self.offset + size;
            if end > target.offset {
                return Err(PitrError::Fatal(format!(
                    "{} is not an event boundary (event spans {}:{}..{})",
                    target, self.file_seq, self.offset, end
                )));
            }
            match header[TYPE_OFFSET] {
                event_type::ROTATE | event_type::STOP => {
                    return Err(PitrError::Fatal(format!(
                        "{} lies beyond the end of binlog file {}",
                        target, target.file_seq
                    )));
                }
                event_type::QUERY | event_type::FORMAT_DESCRIPTION => {
                    let Some(data) = self.read_raw().await? else {
                        return Err(PitrError::PositionUnavailable(target));
                    };
                    self.advance(data);
                }
                _ => {
                    self.tracker.classify(&header);
                    self.offset = end;
                    skipped += 1;
                }
            }
        }

        debug!(
            target: "binlog_source",
            position = %target,
            in_transaction = self.tracker.in_transaction(),
            skipped,
            "fast-forwarded to resume position"
        );
        let Some(fde) = self.format_description.take() else {
            return Err(PitrError::Fatal(format!(
                "binlog file {} has no format description event",
                target.file_seq
            )));
        };
        self.pending_preamble = Some(BinlogEvent::new(
            fde.data,
            target,
            fde.timestamp,
            EventFlags::PREAMBLE,
        ));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<BinlogEvent, PitrError> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(event);
            }
            if self.ensure_open().await? {
                if let Some(data) = self.read_raw().await? {
                    let event = self.advance(data);
                    if let Some(preamble) = self.pending_preamble.take() {
                        self.queued.push_back(event);
                        return Ok(preamble);
                    }
                    return Ok(event);
                }
                if self.switch_if_abandoned().await? {
                    continue;
                }
            }
            debug!(
                target: "binlog_source",
                position = %self.position(),
                "waiting for new binlog events"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn io_fatal(path: &Path, err: std::io::Error) -> PitrError {
    PitrError::Fatal(format!("binlog read failed on {}: {}", path.display(), err))
}
