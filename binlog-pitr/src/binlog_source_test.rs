#[cfg(test)]
mod tests {
    use crate::binlog_source::{
        event_type, BinlogDirSource, TransactionTracker, BINLOG_MAGIC, EVENT_HEADER_LEN,
        FIRST_EVENT_OFFSET,
    };
    use binlog_pitr_core::{
        BinlogEvent, EventFlags, EventSource, EventStream, LogPosition, PitrError, StorageBackend,
    };
    use binlog_pitr_storage::{
        BackendConfig, Collector, CollectorConfig, LocalBackend, ObjectStore, SegmentManifest,
    };
    use futures::StreamExt;
    use std::sync::Arc;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASENAME: &str = "binlog";

    fn raw_event(timestamp: u32, type_code: u8, body: &[u8]) -> Vec<u8> {
        let size = (EVENT_HEADER_LEN + body.len()) as u32;
        let mut data = Vec::with_capacity(size as usize);
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.push(type_code);
        data.extend_from_slice(&1u32.to_le_bytes()); // server id
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // log pos
        data.extend_from_slice(&0u16.to_le_bytes()); // flags
        data.extend_from_slice(body);
        data
    }

    fn format_description() -> Vec<u8> {
        raw_event(1_700_000_000, event_type::FORMAT_DESCRIPTION, &[4u8; 40])
    }

    fn query(timestamp: u32, sql: &str) -> Vec<u8> {
        let db = b"shop";
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes()); // thread id
        body.extend_from_slice(&0u32.to_le_bytes()); // exec time
        body.push(db.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes()); // error code
        body.extend_from_slice(&3u16.to_le_bytes()); // status vars length
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(db);
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        raw_event(timestamp, event_type::QUERY, &body)
    }

    fn xid(timestamp: u32) -> Vec<u8> {
        raw_event(timestamp, event_type::XID, &42u64.to_le_bytes())
    }

    fn rotate(next_file: &str) -> Vec<u8> {
        let mut body = FIRST_EVENT_OFFSET.to_le_bytes().to_vec();
        body.extend_from_slice(next_file.as_bytes());
        raw_event(0, event_type::ROTATE, &body)
    }

    fn write_binlog(dir: &Path, seq: u64, events: &[Vec<u8>]) {
        let mut bytes = BINLOG_MAGIC.to_vec();
        for event in events {
            bytes.extend_from_slice(event);
        }
        std::fs::write(dir.join(format!("{}.{:06}", BASENAME, seq)), bytes).expect("write binlog");
    }

    fn append_binlog(dir: &Path, seq: u64, event: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.join(format!("{}.{:06}", BASENAME, seq)))
            .expect("open binlog");
        file.write_all(event).expect("append");
    }

    /// Offsets at which each event of `events` ends, assuming they start at 4.
    fn ends(events: &[Vec<u8>]) -> Vec<u64> {
        let mut at = FIRST_EVENT_OFFSET;
        events
            .iter()
            .map(|e| {
                at += e.len() as u64;
                at
            })
            .collect()
    }

    fn source(dir: &TempDir) -> BinlogDirSource {
        BinlogDirSource::new(dir.path(), BASENAME, Duration::from_millis(10))
    }

    async fn take(stream: &mut EventStream, n: usize) -> Vec<BinlogEvent> {
        let mut out = Vec::new();
        for _ in 0..n {
            let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("event within deadline")
                .expect("stream open")
                .expect("event");
            out.push(next);
        }
        out
    }

    fn transaction_file() -> Vec<Vec<u8>> {
        vec![
            format_description(),
            query(1_700_000_010, "BEGIN"),
            query(1_700_000_010, "INSERT INTO orders VALUES (1)"),
            xid(1_700_000_010),
            query(1_700_000_020, "CREATE TABLE audit (id INT)"),
        ]
    }

    #[test]
    fn tracker_keeps_transactions_whole() {
        let mut tracker = TransactionTracker::default();
        assert_eq!(tracker.classify(&format_description()), EventFlags::PREAMBLE);
        assert_eq!(tracker.classify(&query(1, "begin")), EventFlags::NONE);
        assert!(tracker.in_transaction());
        assert_eq!(tracker.classify(&query(1, "UPDATE t SET a = 1")), EventFlags::NONE);
        assert_eq!(tracker.classify(&query(1, "COMMIT")), EventFlags::TRANSACTION_END);
        assert!(!tracker.in_transaction());
        assert_eq!(tracker.classify(&query(1, "DROP TABLE t")), EventFlags::TRANSACTION_END);
        assert_eq!(tracker.classify(&raw_event(1, event_type::GTID, &[0; 25])), EventFlags::NONE);
        assert_eq!(tracker.classify(&query(1, "BEGIN")), EventFlags::NONE);
        assert_eq!(tracker.classify(&query(1, "ROLLBACK")), EventFlags::TRANSACTION_END);
    }

    #[tokio::test]
    async fn stream_from_origin_starts_at_first_file() {
        let dir = TempDir::new().expect("tempdir");
        let events = transaction_file();
        write_binlog(dir.path(), 3, &events);
        write_binlog(dir.path(), 4, &[format_description()]);

        let mut stream = source(&dir)
            .open_stream(LogPosition::ORIGIN)
            .await
            .expect("open");
        let got = take(&mut stream, events.len()).await;

        let flags: Vec<EventFlags> = got.iter().map(|e| e.flags).collect();
        assert_eq!(
            flags,
            vec![
                EventFlags::PREAMBLE,
                EventFlags::NONE,
                EventFlags::NONE,
                EventFlags::TRANSACTION_END,
                EventFlags::TRANSACTION_END,
            ]
        );
        let nexts: Vec<LogPosition> = got.iter().map(|e| e.next).collect();
        let expected: Vec<LogPosition> = ends(&events).into_iter().map(|o| LogPosition::new(3, o)).collect();
        assert_eq!(nexts, expected);
        assert_eq!(got[4].data, events[4]);
        assert_eq!(got[4].timestamp, 1_700_000_020);
    }

    /// Test: resuming mid-file replays the format description first.
    ///
    /// Expected
    /// - The first event is a preamble carrying the file's format description at `from`
    /// - The next event is the one that follows `from`
    #[tokio::test]
    async fn resume_mid_file_replays_format_description() {
        let dir = TempDir::new().expect("tempdir");
        let events = transaction_file();
        write_binlog(dir.path(), 1, &events);
        let from = LogPosition::new(1, ends(&events)[3]);

        let mut stream = source(&dir).open_stream(from).await.expect("open");
        let got = take(&mut stream, 2).await;

        assert!(got[0].is_preamble());
        assert_eq!(got[0].next, from);
        assert_eq!(got[0].data, events[0]);
        assert_eq!(got[1].data, events[4]);
        assert!(got[1].ends_transaction());
    }

    #[tokio::test]
    async fn resume_inside_an_open_transaction_keeps_its_state() {
        let dir = TempDir::new().expect("tempdir");
        let events = transaction_file();
        write_binlog(dir.path(), 1, &events);
        // right after BEGIN
        let from = LogPosition::new(1, ends(&events)[1]);

        let mut stream = source(&dir).open_stream(from).await.expect("open");
        let got = take(&mut stream, 3).await;
        assert!(got[0].is_preamble());
        assert_eq!(got[1].flags, EventFlags::NONE);
        assert_eq!(got[2].flags, EventFlags::TRANSACTION_END);
    }

    #[tokio::test]
    async fn position_inside_an_event_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let events = transaction_file();
        write_binlog(dir.path(), 1, &events);

        let err = match source(&dir).open_stream(LogPosition::new(1, ends(&events)[1] + 3)).await {
            Ok(_) => panic!("open must fail"),
            Err(err) => err,
        };
        assert!(matches!(err, PitrError::Fatal(_)));
    }

    #[tokio::test]
    async fn rotate_moves_to_the_next_file() {
        let dir = TempDir::new().expect("tempdir");
        let first = vec![format_description(), query(10, "CREATE TABLE a (id INT)"), rotate("binlog.000002")];
        let second = vec![format_description(), query(20, "CREATE TABLE b (id INT)")];
        write_binlog(dir.path(), 1, &first);
        write_binlog(dir.path(), 2, &second);

        let mut stream = source(&dir)
            .open_stream(LogPosition::ORIGIN)
            .await
            .expect("open");
        let got = take(&mut stream, 5).await;

        assert!(got[2].is_preamble());
        assert_eq!(got[2].next, LogPosition::new(2, FIRST_EVENT_OFFSET));
        assert_eq!(got[3].next, LogPosition::new(2, ends(&second)[0]));
        assert_eq!(got[4].next, LogPosition::new(2, ends(&second)[1]));
        assert_eq!(got[4].data, second[1]);
    }

    #[tokio::test]
    async fn purged_file_is_position_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        write_binlog(dir.path(), 5, &transaction_file());

        let from = LogPosition::new(4, 120);
        let err = match source(&dir).open_stream(from).await {
            Ok(_) => panic!("open must fail"),
            Err(err) => err,
        };
        assert!(matches!(err, PitrError::PositionUnavailable(p) if p == from));
    }

    #[tokio::test]
    async fn empty_directory_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("binlog.index"), b"").expect("index");
        let err = match source(&dir).open_stream(LogPosition::ORIGIN).await {
            Ok(_) => panic!("open must fail"),
            Err(err) => err,
        };
        assert!(matches!(err, PitrError::Fatal(_)));
    }

    #[tokio::test]
    async fn stream_waits_for_events_appended_later() {
        let dir = TempDir::new().expect("tempdir");
        write_binlog(dir.path(), 1, &[format_description()]);

        let mut stream = source(&dir)
            .open_stream(LogPosition::ORIGIN)
            .await
            .expect("open");
        let got = take(&mut stream, 1).await;
        assert!(got[0].is_preamble());

        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err(), "idle source must stay pending");

        let late = query(30, "CREATE TABLE late (id INT)");
        append_binlog(dir.path(), 1, &late);
        let got = take(&mut stream, 1).await;
        assert_eq!(got[0].data, late);
        assert!(got[0].ends_transaction());
    }

    /// Test: resuming after large row events reaches the right state.
    ///
    /// Expected
    /// - Row events between BEGIN and the resume point keep the transaction open
    /// - The next event is read intact and closes the transaction
    #[tokio::test]
    async fn resume_after_large_row_events_keeps_transaction_state() {
        const WRITE_ROWS: u8 = 30;
        let dir = TempDir::new().expect("tempdir");
        let rows = vec![0xabu8; 256 * 1024];
        let events = vec![
            format_description(),
            query(1_700_000_010, "BEGIN"),
            raw_event(1_700_000_010, WRITE_ROWS, &rows),
            raw_event(1_700_000_010, WRITE_ROWS, &rows),
            xid(1_700_000_010),
        ];
        write_binlog(dir.path(), 1, &events);
        let from = LogPosition::new(1, ends(&events)[3]);

        let mut stream = source(&dir).open_stream(from).await.expect("open");
        let got = take(&mut stream, 2).await;

        assert!(got[0].is_preamble());
        assert_eq!(got[0].data, events[0]);
        assert_eq!(got[1].data, events[4]);
        assert_eq!(got[1].flags, EventFlags::TRANSACTION_END);
        assert_eq!(got[1].next, LogPosition::new(1, ends(&events)[4]));
    }

    #[tokio::test]
    async fn cold_start_resolves_to_the_oldest_file() {
        let dir = TempDir::new().expect("tempdir");
        write_binlog(dir.path(), 5, &transaction_file());
        write_binlog(dir.path(), 6, &[format_description()]);

        let src = source(&dir);
        let start = src.resolve_start(LogPosition::ORIGIN).await.expect("resolve");
        assert_eq!(start, LogPosition::new(5, FIRST_EVENT_OFFSET));
        let resume = LogPosition::new(6, 120);
        assert_eq!(src.resolve_start(resume).await.expect("resolve"), resume);
    }

    /// Test: a first cycle over a directory whose oldest files were purged.
    ///
    /// Expected
    /// - The segment starts at the first event of the oldest file present
    /// - A recovery base in a purged file is reported as incomplete history
    #[tokio::test]
    async fn first_segment_never_claims_purged_files() {
        let dir = TempDir::new().expect("tempdir");
        let events = transaction_file();
        write_binlog(dir.path(), 5, &events);

        let store: Arc<dyn StorageBackend> = Arc::new(
            ObjectStore::new(BackendConfig::Local {
                backend: LocalBackend::Memory,
                root: "purged-history".to_string(),
            })
            .expect("store"),
        );
        let manifest = SegmentManifest::new(store, "orders-db").expect("manifest");
        let cfg = CollectorConfig {
            cycle_length: Duration::from_millis(100),
            pause_between_cycles: Duration::from_millis(10),
            shutdown_grace: None,
            initial_position: LogPosition::ORIGIN,
            ..Default::default()
        };
        let collector = Collector::new(cfg, manifest, Arc::new(source(&dir)));

        let report = collector
            .run_cycle(&tokio_util::sync::CancellationToken::new())
            .await
            .expect("cycle");
        assert_eq!(report.start, LogPosition::new(5, FIRST_EVENT_OFFSET));
        assert_eq!(report.end, LogPosition::new(5, *ends(&events).last().expect("events")));

        match collector
            .manifest()
            .select_chain(LogPosition::new(2, 100), report.end)
            .await
        {
            Err(PitrError::IncompleteHistory { expected, .. }) => {
                assert_eq!(expected, LogPosition::new(2, 100))
            }
            Err(other) => panic!("expected IncompleteHistory, got {:?}", other),
            Ok(_) => panic!("a base in a purged file must not resolve"),
        }
    }
}
