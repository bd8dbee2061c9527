use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Take};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::segment::{decode_record, recover_record, LogLayout, PartitionKey, SegmentId};
use crate::{LedgerError, LogPosition, LoggedEvent, Watermark};

/// Counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub events: u64,
    pub corrupt_records: u64,
    pub bytes_scanned: u64,
    pub segments_scanned: u64,
}

/// Unindexed bytes, split into complete records and trailing fragments that
/// no newline terminates yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBacklog {
    pub pending_bytes: u64,
    pub torn_tail_bytes: u64,
    pub torn_segments: u64,
}

const TAIL_PROBE_CHUNK: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct SegmentPlan {
    segment: SegmentId,
    start: u64,
    end: u64,
}

struct OpenScan {
    plan: SegmentPlan,
    reader: BufReader<Take<File>>,
    position: u64,
}

/// Read-only access to the segment tree.
#[derive(Debug, Clone)]
pub struct LogReader {
    layout: LogLayout,
}

impl LogReader {
    #[must_use]
    pub fn new(layout: LogLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// Events after `watermark` in replay order (partition, sequence number,
    /// byte offset). The scan only covers bytes present when it was created,
    /// so it always terminates even while producers keep appending.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the segment tree cannot be listed.
    pub fn read_from(&self, watermark: &Watermark) -> Result<LogScan, LedgerError> {
        let mut plan = VecDeque::new();
        for segment in self.layout.list_all_segments()? {
            let Some(start) = watermark.resume_offset(segment) else {
                continue;
            };
            let end = self.segment_len(segment)?;
            if start < end {
                plan.push_back(SegmentPlan {
                    segment,
                    start,
                    end,
                });
            }
        }
        Ok(LogScan::new(self.layout.clone(), plan, watermark.clone()))
    }

    /// Every event in partitions `from..=to`, from the start of each segment.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the segment tree cannot be listed.
    pub fn read_partition_range(
        &self,
        from: PartitionKey,
        to: PartitionKey,
    ) -> Result<LogScan, LedgerError> {
        let mut plan = VecDeque::new();
        for partition in self.layout.list_partitions()? {
            if partition < from || partition > to {
                continue;
            }
            for segment in self.layout.list_segments(partition)? {
                let end = self.segment_len(segment)?;
                if end > 0 {
                    plan.push_back(SegmentPlan {
                        segment,
                        start: 0,
                        end,
                    });
                }
            }
        }
        Ok(LogScan::new(self.layout.clone(), plan, Watermark::origin()))
    }

    /// Complete records present in the log that `watermark` has not consumed
    /// yet, in bytes. An unterminated trailing fragment is not counted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the segment tree cannot be listed.
    pub fn pending_bytes(&self, watermark: &Watermark) -> Result<u64, LedgerError> {
        Ok(self.backlog(watermark)?.pending_bytes)
    }

    /// Unconsumed bytes per kind. A fragment left by a crashed append stays
    /// in `torn_tail_bytes` until a later append terminates it.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when a segment cannot be listed or read.
    pub fn backlog(&self, watermark: &Watermark) -> Result<LogBacklog, LedgerError> {
        let mut backlog = LogBacklog::default();
        for segment in self.layout.list_all_segments()? {
            let Some(start) = watermark.resume_offset(segment) else {
                continue;
            };
            let end = self.segment_len(segment)?;
            if start >= end {
                continue;
            }
            let fragment = self.trailing_fragment_len(segment, start, end)?;
            backlog.pending_bytes += end - start - fragment;
            if fragment > 0 {
                backlog.torn_tail_bytes += fragment;
                backlog.torn_segments += 1;
            }
        }
        Ok(backlog)
    }

    /// Length of the bytes after the last newline in `start..end`.
    fn trailing_fragment_len(
        &self,
        segment: SegmentId,
        start: u64,
        end: u64,
    ) -> Result<u64, LedgerError> {
        let mut file = File::open(self.layout.segment_path(segment))
            .map_err(|err| LedgerError::io("failed to open segment", &err))?;
        let mut chunk_end = end;
        let mut buf = Vec::new();
        while chunk_end > start {
            let chunk_start = chunk_end.saturating_sub(TAIL_PROBE_CHUNK).max(start);
            buf.resize(usize::try_from(chunk_end - chunk_start).unwrap_or(0), 0);
            file.seek(SeekFrom::Start(chunk_start))
                .map_err(|err| LedgerError::io("failed to seek segment", &err))?;
            file.read_exact(&mut buf)
                .map_err(|err| LedgerError::io("failed to read segment", &err))?;
            if let Some(index) = buf.iter().rposition(|byte| *byte == b'\n') {
                return Ok(end - (chunk_start + index as u64 + 1));
            }
            chunk_end = chunk_start;
        }
        Ok(end - start)
    }

    fn segment_len(&self, segment: SegmentId) -> Result<u64, LedgerError> {
        match fs::metadata(self.layout.segment_path(segment)) {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(LedgerError::io("failed to stat segment", &err)),
        }
    }
}

/// Lazy, finite iterator over logged events.
///
/// [`LogScan::cursor`] is the watermark covering everything yielded so far;
/// it only ever sits on a complete-record boundary.
pub struct LogScan {
    layout: LogLayout,
    plan: VecDeque<SegmentPlan>,
    current: Option<OpenScan>,
    cursor: Watermark,
    stats: ScanStats,
    line: Vec<u8>,
    failed: bool,
}

impl LogScan {
    fn new(layout: LogLayout, plan: VecDeque<SegmentPlan>, cursor: Watermark) -> Self {
        Self {
            layout,
            plan,
            current: None,
            cursor,
            stats: ScanStats::default(),
            line: Vec::new(),
            failed: false,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> &Watermark {
        &self.cursor
    }

    #[must_use]
    pub fn into_cursor(self) -> Watermark {
        self.cursor
    }

    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    fn open(&self, plan: SegmentPlan) -> Result<OpenScan, LedgerError> {
        let path = self.layout.segment_path(plan.segment);
        let mut file =
            File::open(&path).map_err(|err| LedgerError::io("failed to open segment", &err))?;
        file.seek(SeekFrom::Start(plan.start))
            .map_err(|err| LedgerError::io("failed to seek segment", &err))?;
        Ok(OpenScan {
            plan,
            reader: BufReader::new(file.take(plan.end - plan.start)),
            position: plan.start,
        })
    }

    fn next_event(&mut self) -> Result<Option<LoggedEvent>, LedgerError> {
        loop {
            if self.current.is_none() {
                let Some(plan) = self.plan.pop_front() else {
                    return Ok(None);
                };
                self.current = Some(self.open(plan)?);
                self.stats.segments_scanned += 1;
            }
            let Some(scan) = self.current.as_mut() else {
                continue;
            };

            self.line.clear();
            let read = scan
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|err| LedgerError::io("failed to read segment", &err))?;
            if read == 0 || self.line.last() != Some(&b'\n') {
                // End of the snapshot, or a record still being written.
                self.current = None;
                continue;
            }

            let segment = scan.plan.segment;
            let record_start = scan.position;
            scan.position += read as u64;
            let record_end = scan.position;
            self.stats.bytes_scanned += read as u64;
            self.cursor.advance(segment, record_end);

            let body = &self.line[..read - 1];
            if let Some(event) = decode_record(body) {
                self.stats.events += 1;
                return Ok(Some(LoggedEvent {
                    position: LogPosition {
                        segment,
                        offset: record_start,
                        end_offset: record_end,
                    },
                    event,
                }));
            }

            self.stats.corrupt_records += 1;
            if let Some((skipped, event)) = recover_record(body) {
                warn!(
                    segment = %segment,
                    offset = record_start,
                    skipped_bytes = skipped,
                    "torn record prefix skipped"
                );
                self.stats.events += 1;
                return Ok(Some(LoggedEvent {
                    position: LogPosition {
                        segment,
                        offset: record_start + skipped as u64,
                        end_offset: record_end,
                    },
                    event,
                }));
            }

            warn!(
                segment = %segment,
                offset = record_start,
                length = read,
                "corrupt record skipped"
            );
        }
    }
}

impl Iterator for LogScan {
    type Item = Result<LoggedEvent, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_event() {
            Ok(event) => event.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for LogScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogScan")
            .field("remaining_segments", &self.plan.len())
            .field("cursor", &self.cursor)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::encode_record;
    use crate::{Deadline, Event, EventWriter, NewEvent, SchemaRegistry};
    use serde_json::json;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use ulid::Ulid;

    const DAY_MS: i64 = 1_770_465_600_000;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn unique_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("runledger-reader-{label}-{}", Ulid::new()))
    }

    fn phase(run_id: &str, name: &str, occurred_at_ms: i64) -> NewEvent {
        NewEvent {
            event_type: "phase.completed".to_string(),
            schema_version: 1,
            occurred_at_ms,
            run_id: Some(run_id.to_string()),
            payload: json!({ "phase": name, "duration_ms": 1200 }),
        }
    }

    fn collect(scan: LogScan) -> (Vec<LoggedEvent>, Watermark, ScanStats) {
        let mut scan = scan;
        let mut events = Vec::new();
        for item in scan.by_ref() {
            events.push(must(item));
        }
        let stats = scan.stats();
        (events, scan.into_cursor(), stats)
    }

    fn phases(events: &[LoggedEvent]) -> Vec<String> {
        events
            .iter()
            .map(|logged| logged.event.payload["phase"].as_str().unwrap_or("").to_string())
            .collect()
    }

    fn first_segment(root: &Path) -> PathBuf {
        let layout = LogLayout::new(root);
        let segments = must(layout.list_all_segments());
        layout.segment_path(segments[0])
    }

    #[test]
    fn torn_tail_is_invisible_until_completed_by_later_append() {
        let root = unique_root("torn");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        let reader = LogReader::new(LogLayout::new(&root));

        must(writer.append(&phase("R1", "plan", DAY_MS), Deadline::none()));
        must(writer.append(&phase("R1", "fit", DAY_MS), Deadline::none()));

        // Simulate a crash halfway through a third append.
        let torn = Event {
            event_id: Ulid::new(),
            event_type: crate::EventType::PhaseCompleted,
            schema_version: 1,
            occurred_at_ms: DAY_MS,
            recorded_at_ms: DAY_MS,
            run_id: Some("R1".to_string()),
            idempotency_key: "R1:phase.completed:crashed".to_string(),
            payload: json!({ "phase": "crashed", "duration_ms": 1 }),
        };
        let line = must(encode_record(&torn));
        let path = first_segment(&root);
        let mut file = must(OpenOptions::new().append(true).open(&path));
        must(file.write_all(&line[..line.len() / 2]));
        drop(file);

        let (events, cursor, stats) = collect(must(reader.read_from(&Watermark::origin())));
        assert_eq!(phases(&events), vec!["plan", "fit"]);
        assert_eq!(stats.corrupt_records, 0);
        assert_eq!(cursor.last_offset_indexed(), events[1].position.end_offset);

        must(writer.append(&phase("R1", "report", DAY_MS), Deadline::none()));

        let (resumed, _, stats) = collect(must(reader.read_from(&cursor)));
        assert_eq!(phases(&resumed), vec!["report"]);
        assert_eq!(stats.corrupt_records, 1);
        assert!(resumed[0].position.offset > events[1].position.end_offset);

        let (all, _, _) = collect(must(reader.read_from(&Watermark::origin())));
        assert_eq!(phases(&all), vec!["plan", "fit", "report"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn backlog_separates_torn_tail_from_pending_records() {
        let root = unique_root("backlog");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        let reader = LogReader::new(LogLayout::new(&root));
        must(writer.append(&phase("R1", "plan", DAY_MS), Deadline::none()));

        let path = first_segment(&root);
        let mut file = must(OpenOptions::new().append(true).open(&path));
        must(file.write_all(b"1a2b3c4d {\"event_id\":"));
        drop(file);

        let origin = must(reader.backlog(&Watermark::origin()));
        assert_eq!(origin.torn_tail_bytes, 21);
        assert_eq!(origin.torn_segments, 1);
        assert!(origin.pending_bytes > 0);

        let (_, cursor, _) = collect(must(reader.read_from(&Watermark::origin())));
        let caught_up = must(reader.backlog(&cursor));
        assert_eq!(caught_up.pending_bytes, 0);
        assert_eq!(caught_up.torn_tail_bytes, 21);
        assert_eq!(must(reader.pending_bytes(&cursor)), 0);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_complete_record_is_skipped() {
        let root = unique_root("corrupt");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        must(writer.append(&phase("R1", "plan", DAY_MS), Deadline::none()));
        let path = first_segment(&root);
        let mut file = must(OpenOptions::new().append(true).open(&path));
        must(file.write_all(b"0000beef {\"not\":\"an event\"}\n"));
        drop(file);
        must(writer.append(&phase("R1", "fit", DAY_MS), Deadline::none()));

        let reader = LogReader::new(LogLayout::new(&root));
        let (events, _, stats) = collect(must(reader.read_from(&Watermark::origin())));
        assert_eq!(phases(&events), vec!["plan", "fit"]);
        assert_eq!(stats.corrupt_records, 1);
        assert_eq!(stats.events, 2);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resuming_from_any_cursor_yields_the_same_sequence() {
        let root = unique_root("resume");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            512,
        ));
        let names: Vec<String> = (0..12).map(|index| format!("p{index:02}")).collect();
        for name in &names {
            must(writer.append(&phase("R1", name, DAY_MS), Deadline::none()));
        }

        let reader = LogReader::new(LogLayout::new(&root));
        let (full, _, _) = collect(must(reader.read_from(&Watermark::origin())));
        let (again, _, _) = collect(must(reader.read_from(&Watermark::origin())));
        assert_eq!(full, again);
        assert_eq!(phases(&full), names);

        for split in 0..names.len() {
            let mut head = must(reader.read_from(&Watermark::origin()));
            let mut taken = Vec::new();
            for _ in 0..split {
                if let Some(item) = head.next() {
                    taken.push(must(item));
                }
            }
            let (tail, _, _) = collect(must(reader.read_from(head.cursor())));
            taken.extend(tail);
            assert_eq!(taken, full);
        }

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scan_is_bounded_by_lengths_at_creation() {
        let root = unique_root("snapshot");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        let reader = LogReader::new(LogLayout::new(&root));
        must(writer.append(&phase("R1", "plan", DAY_MS), Deadline::none()));

        let scan = must(reader.read_from(&Watermark::origin()));
        must(writer.append(&phase("R1", "fit", DAY_MS), Deadline::none()));
        let (events, cursor, _) = collect(scan);
        assert_eq!(phases(&events), vec!["plan"]);

        let (later, _, _) = collect(must(reader.read_from(&cursor)));
        assert_eq!(phases(&later), vec!["fit"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn late_arrivals_in_older_partitions_are_picked_up() {
        let root = unique_root("late");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        let reader = LogReader::new(LogLayout::new(&root));

        must(writer.append(&phase("R1", "day-two", DAY_MS + 86_400_000), Deadline::none()));
        let (_, cursor, _) = collect(must(reader.read_from(&Watermark::origin())));
        assert_eq!(must(reader.pending_bytes(&cursor)), 0);

        must(writer.append(&phase("R1", "day-one", DAY_MS), Deadline::none()));
        assert!(must(reader.pending_bytes(&cursor)) > 0);
        let (late, _, _) = collect(must(reader.read_from(&cursor)));
        assert_eq!(phases(&late), vec!["day-one"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn partition_range_is_inclusive() {
        let root = unique_root("range");
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        for day in 0..4 {
            let name = format!("day{day}");
            must(writer.append(&phase("R1", &name, DAY_MS + day * 86_400_000), Deadline::none()));
        }

        let reader = LogReader::new(LogLayout::new(&root));
        let from = must(PartitionKey::parse("2026-02-08"));
        let to = must(PartitionKey::parse("2026-02-09"));
        let (events, _, _) = collect(must(reader.read_partition_range(from, to)));
        assert_eq!(phases(&events), vec!["day1", "day2"]);

        let _ = fs::remove_dir_all(root);
    }
}
