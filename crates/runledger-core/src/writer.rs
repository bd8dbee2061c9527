use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, Write};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::event::idempotency_key;
use crate::segment::{encode_record, sync_parent_dir, LogLayout, PartitionKey, SegmentId};
use crate::{now_epoch_ms, Deadline, Event, LedgerConfig, LedgerError, NewEvent, SchemaRegistry};

/// Where an appended event landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub event_id: Ulid,
    pub partition: PartitionKey,
    pub sequence_no: u32,
    pub offset: u64,
    pub idempotency_key: String,
}

#[derive(Debug)]
struct OpenSegment {
    segment: SegmentId,
    file: File,
}

type PartitionSlot = Arc<Mutex<Option<OpenSegment>>>;

/// Appends validated events to day-partitioned, size-rotated segments.
///
/// Shareable across threads. Several writers (in this or other processes) may
/// target the same log root; every record is one `O_APPEND` write, and
/// segment creation uses `create_new` so racing rotations converge on the same
/// next segment.
#[derive(Debug)]
pub struct EventWriter {
    layout: LogLayout,
    registry: SchemaRegistry,
    rotation_threshold_bytes: u64,
    partitions: Mutex<BTreeMap<PartitionKey, PartitionSlot>>,
}

impl EventWriter {
    /// Opens a writer rooted at `layout`, creating the root and publishing
    /// the schema catalog.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for a zero threshold and
    /// [`LedgerError::Io`] when the root or catalog cannot be written.
    pub fn open(
        layout: LogLayout,
        registry: SchemaRegistry,
        rotation_threshold_bytes: u64,
    ) -> Result<Self, LedgerError> {
        if rotation_threshold_bytes == 0 {
            return Err(LedgerError::Configuration(
                "rotation_threshold_bytes MUST be >= 1".to_string(),
            ));
        }
        fs::create_dir_all(layout.root())
            .map_err(|err| LedgerError::io("failed to create log root", &err))?;
        registry.write_catalog(&layout.catalog_path())?;

        Ok(Self {
            layout,
            registry,
            rotation_threshold_bytes,
            partitions: Mutex::new(BTreeMap::new()),
        })
    }

    /// Opens a writer with the builtin registry and configured threshold.
    ///
    /// # Errors
    /// Same as [`EventWriter::open`], plus configuration validation.
    pub fn with_config(layout: LogLayout, config: &LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Self::open(
            layout,
            SchemaRegistry::builtin(),
            config.rotation_threshold_bytes,
        )
    }

    #[must_use]
    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Validates and durably appends one event. The receipt is returned only
    /// after the record reached stable storage.
    ///
    /// # Errors
    /// - [`LedgerError::Validation`] / [`LedgerError::UnknownSchemaVersion`]:
    ///   nothing was written.
    /// - [`LedgerError::DeadlineExceeded`]: nothing was written.
    /// - [`LedgerError::Durability`]: the write or flush failed; a record
    ///   whose flush failed is truncated away, and partial bytes are
    ///   invisible to readers.
    pub fn append(&self, input: &NewEvent, deadline: Deadline) -> Result<AppendReceipt, LedgerError> {
        deadline.check("append")?;

        let event = self.build_event(input)?;
        let partition = PartitionKey::from_epoch_ms(event.occurred_at_ms).map_err(|err| {
            LedgerError::validation(event.event_type.as_str(), "occurred_at_ms", err.to_string())
        })?;
        let line = encode_record(&event)?;

        let slot = self.slot(partition);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let open = self.current_segment(&mut guard, partition)?;

        deadline.check("append")?;

        let segment = open.segment;
        let end = match write_record(&mut open.file, &line) {
            Ok(end) => end,
            Err(err) => {
                // The handle may sit behind a torn record; reopen next time.
                *guard = None;
                return Err(LedgerError::Durability(format!(
                    "append to {segment} failed: {err}"
                )));
            }
        };
        let offset = end - line.len() as u64;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            segment = %segment,
            offset,
            "event appended"
        );

        Ok(AppendReceipt {
            event_id: event.event_id,
            partition,
            sequence_no: segment.sequence_no,
            offset,
            idempotency_key: event.idempotency_key,
        })
    }

    fn build_event(&self, input: &NewEvent) -> Result<Event, LedgerError> {
        let event_type =
            self.registry
                .validate(&input.event_type, input.schema_version, &input.payload)?;

        let run_id = input
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|run_id| !run_id.is_empty());
        if event_type.requires_run_id() && run_id.is_none() {
            return Err(LedgerError::validation(
                event_type.as_str(),
                "run_id",
                "run_id is required",
            ));
        }

        let payload = self
            .registry
            .decode(event_type, input.schema_version, &input.payload)?;
        let idempotency_key = idempotency_key(run_id, event_type, &payload.discriminator());

        Ok(Event {
            event_id: Ulid::new(),
            event_type,
            schema_version: input.schema_version,
            occurred_at_ms: input.occurred_at_ms,
            recorded_at_ms: now_epoch_ms(),
            run_id: run_id.map(str::to_string),
            idempotency_key,
            payload: input.payload.clone(),
        })
    }

    fn slot(&self, partition: PartitionKey) -> PartitionSlot {
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(partitions.entry(partition).or_default())
    }

    /// Resolves the segment the next record goes to, rotating when the
    /// current one reached the threshold or another writer already rotated.
    fn current_segment<'a>(
        &self,
        slot: &'a mut Option<OpenSegment>,
        partition: PartitionKey,
    ) -> Result<&'a mut OpenSegment, LedgerError> {
        let mut current = match slot.take() {
            Some(open) => open,
            None => self.open_latest(partition)?,
        };

        loop {
            let next = current.segment.next();
            let next_path = self.layout.segment_path(next);
            if next_path.exists() {
                current = self.open_existing(next)?;
                continue;
            }

            let size = current
                .file
                .metadata()
                .map_err(|err| LedgerError::io("failed to stat segment", &err))?
                .len();
            if size < self.rotation_threshold_bytes {
                break;
            }

            match OpenOptions::new().append(true).create_new(true).open(&next_path) {
                Ok(file) => {
                    sync_parent_dir(&next_path)?;
                    info!(segment = %next, previous_size = size, "segment rotated");
                    current = OpenSegment {
                        segment: next,
                        file,
                    };
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    current = self.open_existing(next)?;
                }
                Err(err) => return Err(LedgerError::io("failed to create segment", &err)),
            }
        }

        Ok(slot.insert(current))
    }

    fn open_latest(&self, partition: PartitionKey) -> Result<OpenSegment, LedgerError> {
        if let Some(segment) = self.layout.latest_segment(partition)? {
            return self.open_existing(segment);
        }

        let dir = self.layout.partition_dir(partition);
        fs::create_dir_all(&dir)
            .map_err(|err| LedgerError::io("failed to create partition directory", &err))?;
        sync_parent_dir(&dir)?;

        let segment = SegmentId::new(partition, 1);
        let path = self.layout.segment_path(segment);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| LedgerError::io("failed to create segment", &err))?;
        sync_parent_dir(&path)?;
        debug!(segment = %segment, "segment opened");
        Ok(OpenSegment { segment, file })
    }

    fn open_existing(&self, segment: SegmentId) -> Result<OpenSegment, LedgerError> {
        let file = OpenOptions::new()
            .append(true)
            .open(self.layout.segment_path(segment))
            .map_err(|err| LedgerError::io("failed to open segment", &err))?;
        debug!(segment = %segment, "segment opened");
        Ok(OpenSegment { segment, file })
    }
}

/// One append-mode write of the full line followed by a data flush. Returns
/// the end offset of the record.
fn write_record(file: &mut File, line: &[u8]) -> std::io::Result<u64> {
    write_record_with(file, line, File::sync_data)
}

/// When the flush fails the record is cut off again, so a retried append
/// cannot leave two readable copies. A record another writer has already
/// appended behind is left in place.
fn write_record_with(
    file: &mut File,
    line: &[u8],
    sync: impl FnOnce(&File) -> std::io::Result<()>,
) -> std::io::Result<u64> {
    file.write_all(line)?;
    let end = file.stream_position()?;
    if let Err(err) = sync(file) {
        if file.metadata()?.len() == end {
            file.set_len(end - line.len() as u64)?;
        }
        return Err(err);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::decode_record;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use std::thread;

    const DAY_MS: i64 = 1_770_465_600_000;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn unique_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("runledger-writer-{label}-{}", Ulid::new()))
    }

    fn writer(root: &Path, threshold: u64) -> EventWriter {
        must(EventWriter::open(
            LogLayout::new(root),
            SchemaRegistry::builtin(),
            threshold,
        ))
    }

    fn trial(run_id: &str, trial_index: u64, padding: usize) -> NewEvent {
        NewEvent {
            event_type: "trial.recorded".to_string(),
            schema_version: 1,
            occurred_at_ms: DAY_MS,
            run_id: Some(run_id.to_string()),
            payload: json!({
                "trial_index": trial_index,
                "params": { "pad": "x".repeat(padding) },
                "metrics": { "sharpe": 1.5 }
            }),
        }
    }

    fn read_segment(path: &Path) -> Vec<(usize, Event)> {
        let bytes = must(fs::read(path));
        bytes
            .split_inclusive(|byte| *byte == b'\n')
            .map(|line| {
                assert_eq!(line.last(), Some(&b'\n'), "every record ends in a newline");
                let body = &line[..line.len() - 1];
                match decode_record(body) {
                    Some(event) => (line.len(), event),
                    None => panic!("undecodable record in {}", path.display()),
                }
            })
            .collect()
    }

    fn all_events(root: &Path) -> Vec<(SegmentId, Event)> {
        let layout = LogLayout::new(root);
        let mut events = Vec::new();
        for segment in must(layout.list_all_segments()) {
            for (_, event) in read_segment(&layout.segment_path(segment)) {
                events.push((segment, event));
            }
        }
        events
    }

    #[test]
    fn append_reports_offset_of_a_readable_record() {
        let root = unique_root("offset");
        let writer = writer(&root, 1024 * 1024);

        let first = must(writer.append(&trial("R1", 0, 8), Deadline::none()));
        let second = must(writer.append(&trial("R1", 1, 8), Deadline::none()));

        assert_eq!(first.offset, 0);
        assert_eq!(first.sequence_no, 1);
        assert_eq!(first.partition.to_string(), "2026-02-07");
        assert_eq!(first.idempotency_key, "R1:trial.recorded:0");
        assert!(second.offset > first.offset);

        let records = read_segment(&writer.layout().segment_path(SegmentId::new(first.partition, 1)));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0 as u64, second.offset);
        assert_eq!(records[1].1.event_id, second.event_id);
        assert!(writer.layout().catalog_path().exists());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn validation_failure_writes_nothing() {
        let root = unique_root("invalid");
        let writer = writer(&root, 1024);

        let mut input = trial("R1", 0, 0);
        input.payload = json!({ "params": {}, "metrics": {} });
        match writer.append(&input, Deadline::none()) {
            Err(LedgerError::Validation { field, .. }) => assert_eq!(field, "trial_index"),
            other => panic!("expected validation error, got {other:?}"),
        }

        let mut missing_run = trial("R1", 0, 0);
        missing_run.run_id = None;
        match writer.append(&missing_run, Deadline::none()) {
            Err(LedgerError::Validation { field, .. }) => assert_eq!(field, "run_id"),
            other => panic!("expected validation error, got {other:?}"),
        }

        let mut future_version = trial("R1", 0, 0);
        future_version.schema_version = 9;
        assert!(matches!(
            writer.append(&future_version, Deadline::none()),
            Err(LedgerError::UnknownSchemaVersion { version: 9, .. })
        ));

        assert!(must(writer.layout().list_all_segments()).is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn expired_deadline_aborts_without_writing() {
        let root = unique_root("deadline");
        let writer = writer(&root, 1024);

        let result = writer.append(
            &trial("R1", 0, 0),
            Deadline::at(std::time::Instant::now()),
        );
        assert!(matches!(result, Err(LedgerError::DeadlineExceeded(_))));
        assert!(all_events(&root).is_empty());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_flush_truncates_the_record_it_wrote() {
        let root = unique_root("flush");
        must(fs::create_dir_all(&root));
        let path = root.join("segment-000001.log");
        let mut file = must(OpenOptions::new().append(true).create(true).open(&path));
        must(write_record(&mut file, b"first\n"));

        let failed = write_record_with(&mut file, b"second\n", |_| {
            Err(std::io::Error::other("device went away"))
        });
        assert!(failed.is_err());
        assert_eq!(must(fs::read(&path)), b"first\n".to_vec());

        // The retry lands where the failed record started.
        assert_eq!(must(write_record(&mut file, b"third\n")), 12);
        assert_eq!(must(fs::read(&path)), b"first\nthird\n".to_vec());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_flush_keeps_records_appended_behind_it() {
        let root = unique_root("flush-shared");
        must(fs::create_dir_all(&root));
        let path = root.join("segment-000001.log");
        let mut file = must(OpenOptions::new().append(true).create(true).open(&path));

        let failed = write_record_with(&mut file, b"mine\n", |_| {
            let mut other = OpenOptions::new().append(true).open(&path)?;
            other.write_all(b"theirs\n")?;
            Err(std::io::Error::other("device went away"))
        });
        assert!(failed.is_err());
        assert_eq!(must(fs::read(&path)), b"mine\ntheirs\n".to_vec());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn artifact_without_run_is_accepted() {
        let root = unique_root("artifact");
        let writer = writer(&root, 1024);

        let receipt = must(writer.append(
            &NewEvent {
                event_type: "artifact.created".to_string(),
                schema_version: 1,
                occurred_at_ms: DAY_MS,
                run_id: None,
                payload: json!({ "artifact_id": "a-1", "kind": "alert", "uri": "s3://b/a-1" }),
            },
            Deadline::none(),
        ));
        assert_eq!(receipt.idempotency_key, "*:artifact.created:a-1");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn events_are_partitioned_by_occurred_day() {
        let root = unique_root("partition");
        let writer = writer(&root, 1024 * 1024);

        let mut late = trial("R1", 0, 0);
        late.occurred_at_ms = DAY_MS + 86_400_000;
        must(writer.append(&late, Deadline::none()));
        must(writer.append(&trial("R1", 1, 0), Deadline::none()));

        let partitions: Vec<String> = must(writer.layout().list_partitions())
            .into_iter()
            .map(|partition| partition.to_string())
            .collect();
        assert_eq!(partitions, vec!["2026-02-07", "2026-02-08"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn concurrent_threads_never_interleave_records() {
        let root = unique_root("threads");
        let writer = Arc::new(writer(&root, 4096));
        let threads = 8;
        let per_thread = 50_u64;

        let handles: Vec<_> = (0..threads)
            .map(|thread_no| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for trial_index in 0..per_thread {
                        let input = trial(&format!("R{thread_no}"), trial_index, 32);
                        if let Err(err) = writer.append(&input, Deadline::none()) {
                            panic!("append failed: {err}");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }

        let events = all_events(&root);
        assert_eq!(events.len() as u64, threads * per_thread);

        let mut ids: Vec<Ulid> = events.iter().map(|(_, event)| event.event_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), events.len());

        // Each thread's own appends stay in order.
        let mut last_index: BTreeMap<String, i64> = BTreeMap::new();
        for (_, event) in &events {
            let run_id = event.run_id.clone().unwrap_or_default();
            let index = event.payload["trial_index"].as_i64().unwrap_or(-1);
            let previous = last_index.insert(run_id, index).unwrap_or(-1);
            assert!(index > previous);
        }

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn independent_writers_share_a_partition_safely() {
        let root = unique_root("writers");
        let first = Arc::new(writer(&root, 2048));
        let second = Arc::new(writer(&root, 2048));

        let handles: Vec<_> = [("A", first), ("B", second)]
            .into_iter()
            .map(|(run_id, writer)| {
                thread::spawn(move || {
                    for trial_index in 0..60 {
                        if let Err(err) =
                            writer.append(&trial(run_id, trial_index, 24), Deadline::none())
                        {
                            panic!("append failed: {err}");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }

        let events = all_events(&root);
        assert_eq!(events.len(), 120);
        let sequences: Vec<u32> = must(LogLayout::new(&root).list_all_segments())
            .into_iter()
            .map(|segment| segment.sequence_no)
            .collect();
        let expected: Vec<u32> = (1..=sequences.len() as u32).collect();
        assert_eq!(sequences, expected);

        let _ = fs::remove_dir_all(root);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn rotation_respects_threshold(
            paddings in prop::collection::vec(0_usize..400, 1..40),
            threshold in 256_u64..2048,
        ) {
            let root = unique_root("rotation");
            let writer = writer(&root, threshold);
            for (trial_index, padding) in paddings.iter().enumerate() {
                let input = trial("R1", trial_index as u64, *padding);
                prop_assert!(writer.append(&input, Deadline::none()).is_ok());
            }

            let layout = LogLayout::new(&root);
            let segments = must(layout.list_all_segments());
            let sequences: Vec<u32> = segments.iter().map(|segment| segment.sequence_no).collect();
            let expected: Vec<u32> = (1..=segments.len() as u32).collect();
            prop_assert_eq!(sequences, expected);

            let mut replayed = Vec::new();
            for (position, segment) in segments.iter().enumerate() {
                let records = read_segment(&layout.segment_path(*segment));
                prop_assert!(!records.is_empty());
                let size: u64 = records.iter().map(|(len, _)| *len as u64).sum();
                let last_len = records.last().map_or(0, |(len, _)| *len as u64);
                if position + 1 < segments.len() {
                    // Rotated only once full; the last record started below the threshold.
                    prop_assert!(size >= threshold);
                    prop_assert!(size - last_len < threshold);
                }
                replayed.extend(records.into_iter().map(|(_, event)| event.payload["trial_index"].clone()));
            }

            let expected: Vec<Value> = (0..paddings.len()).map(|index| json!(index)).collect();
            prop_assert_eq!(replayed, expected);
            let _ = fs::remove_dir_all(root);
        }
    }
}
