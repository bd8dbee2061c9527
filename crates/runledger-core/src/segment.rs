use std::fmt::{Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Month};
use ulid::Ulid;

use crate::{from_epoch_ms, to_epoch_ms, Event, LedgerError};

pub const SCHEMA_CATALOG_FILE: &str = "schema_registry.json";
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";
const CHECKSUM_WIDTH: usize = 8;

/// UTC calendar day an event belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey(Date);

impl PartitionKey {
    #[must_use]
    pub fn from_date(date: Date) -> Self {
        Self(date)
    }

    /// Partition for a producer timestamp.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the timestamp is outside
    /// the representable calendar range.
    pub fn from_epoch_ms(occurred_at_ms: i64) -> Result<Self, LedgerError> {
        Ok(Self(from_epoch_ms(occurred_at_ms)?.date()))
    }

    /// Parses `YYYY-MM-DD`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for malformed or impossible dates.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let invalid = || LedgerError::Configuration(format!("invalid partition day: {raw}"));
        let mut parts = raw.split('-');
        let (Some(year), Some(month), Some(day), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }

        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let day: u8 = day.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
        Ok(Self(date))
    }

    #[must_use]
    pub fn date(self) -> Date {
        self.0
    }

    /// Midnight UTC of the partition day, in milliseconds since epoch.
    #[must_use]
    pub fn start_ms(self) -> i64 {
        to_epoch_ms(self.0.midnight().assume_utc())
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionKey> for String {
    fn from(value: PartitionKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentId {
    pub partition: PartitionKey,
    pub sequence_no: u32,
}

impl SegmentId {
    #[must_use]
    pub fn new(partition: PartitionKey, sequence_no: u32) -> Self {
        Self {
            partition,
            sequence_no,
        }
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{SEGMENT_PREFIX}{:06}{SEGMENT_SUFFIX}", self.sequence_no)
    }

    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.partition, self.sequence_no + 1)
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:06}", self.partition, self.sequence_no)
    }
}

impl FromStr for SegmentId {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (partition, sequence) = raw
            .split_once('/')
            .ok_or_else(|| LedgerError::Configuration(format!("invalid segment id: {raw}")))?;
        let sequence_no: u32 = sequence
            .parse()
            .map_err(|_| LedgerError::Configuration(format!("invalid segment id: {raw}")))?;
        Ok(Self::new(PartitionKey::parse(partition)?, sequence_no))
    }
}

impl TryFrom<String> for SegmentId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SegmentId> for String {
    fn from(value: SegmentId) -> Self {
        value.to_string()
    }
}

/// Directory layout: `<root>/<YYYY-MM-DD>/segment-<sequence_no>.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn partition_dir(&self, partition: PartitionKey) -> PathBuf {
        self.root.join(partition.to_string())
    }

    #[must_use]
    pub fn segment_path(&self, segment: SegmentId) -> PathBuf {
        self.partition_dir(segment.partition)
            .join(segment.file_name())
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(SCHEMA_CATALOG_FILE)
    }

    /// Partitions present on disk, ascending.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the root cannot be listed.
    pub fn list_partitions(&self) -> Result<Vec<PartitionKey>, LedgerError> {
        let mut partitions = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(partitions),
            Err(err) => return Err(LedgerError::io("failed to list log root", &err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| LedgerError::io("failed to list log root", &err))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(partition) = entry
                .file_name()
                .to_str()
                .and_then(|name| PartitionKey::parse(name).ok())
            {
                partitions.push(partition);
            }
        }

        partitions.sort();
        Ok(partitions)
    }

    /// Segments of one partition, ascending by sequence number.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the partition cannot be listed.
    pub fn list_segments(&self, partition: PartitionKey) -> Result<Vec<SegmentId>, LedgerError> {
        let mut segments = Vec::new();
        let entries = match fs::read_dir(self.partition_dir(partition)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
            Err(err) => return Err(LedgerError::io("failed to list partition", &err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| LedgerError::io("failed to list partition", &err))?;
            let name = entry.file_name();
            let Some(sequence_no) = name.to_str().and_then(parse_segment_file_name) else {
                continue;
            };
            segments.push(SegmentId::new(partition, sequence_no));
        }

        segments.sort();
        Ok(segments)
    }

    /// Every segment in the log in replay order.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when a directory cannot be listed.
    pub fn list_all_segments(&self) -> Result<Vec<SegmentId>, LedgerError> {
        let mut all = Vec::new();
        for partition in self.list_partitions()? {
            all.extend(self.list_segments(partition)?);
        }
        Ok(all)
    }

    /// Highest-numbered segment of a partition, if any exists.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the partition cannot be listed.
    pub fn latest_segment(&self, partition: PartitionKey) -> Result<Option<SegmentId>, LedgerError> {
        Ok(self.list_segments(partition)?.pop())
    }
}

fn parse_segment_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|value| *value >= 1)
}

/// Frames an event as `<crc32 hex> <json>\n`.
pub(crate) fn encode_record(event: &Event) -> Result<Vec<u8>, LedgerError> {
    let json = serde_json::to_vec(event).map_err(|err| {
        LedgerError::validation(event.event_type.as_str(), "payload", err.to_string())
    })?;
    if json.len() > MAX_RECORD_BYTES {
        return Err(LedgerError::validation(
            event.event_type.as_str(),
            "payload",
            format!("encoded record exceeds {MAX_RECORD_BYTES} bytes"),
        ));
    }

    let mut line = Vec::with_capacity(json.len() + CHECKSUM_WIDTH + 2);
    line.extend_from_slice(format!("{:08x} ", crc32fast::hash(&json)).as_bytes());
    line.extend_from_slice(&json);
    line.push(b'\n');
    Ok(line)
}

/// Decodes one framed line (without its trailing newline).
pub(crate) fn decode_record(line: &[u8]) -> Option<Event> {
    if line.len() <= CHECKSUM_WIDTH + 1 || line[CHECKSUM_WIDTH] != b' ' {
        return None;
    }
    let checksum = std::str::from_utf8(&line[..CHECKSUM_WIDTH]).ok()?;
    let expected = u32::from_str_radix(checksum, 16).ok()?;
    let body = &line[CHECKSUM_WIDTH + 1..];
    if crc32fast::hash(body) != expected {
        return None;
    }
    serde_json::from_slice(body).ok()
}

/// Finds a valid record glued behind a torn prefix, e.g. the remains of a
/// crashed append followed by a later complete append on the same line.
/// Returns the byte index where the recovered record starts.
pub(crate) fn recover_record(line: &[u8]) -> Option<(usize, Event)> {
    let min_len = CHECKSUM_WIDTH + 2;
    if line.len() <= min_len {
        return None;
    }
    (1..line.len() - min_len).find_map(|start| {
        let candidate = &line[start..];
        let framed = candidate[..CHECKSUM_WIDTH]
            .iter()
            .all(u8::is_ascii_hexdigit)
            && candidate[CHECKSUM_WIDTH] == b' '
            && candidate[CHECKSUM_WIDTH + 1] == b'{';
        if !framed {
            return None;
        }
        decode_record(candidate).map(|event| (start, event))
    })
}

/// Writes `bytes` to `path` via a synced temporary file and rename, so
/// readers observe either the old or the new content.
///
/// # Errors
/// Returns [`LedgerError::Io`] when any step fails.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| LedgerError::io("failed to create parent directory", &err))?;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| LedgerError::Io(format!("invalid target path {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Ulid::new()));

    if let Err(err) = write_then_rename(&temp_path, path, bytes) {
        let _ = fs::remove_file(&temp_path);
        return Err(LedgerError::io(
            &format!("failed to write {}", path.display()),
            &err,
        ));
    }

    sync_parent_dir(path)
}

fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(temp_path, path)
}

/// Makes a newly created or renamed directory entry durable.
///
/// # Errors
/// Returns [`LedgerError::Io`] when the directory cannot be synced.
pub fn sync_parent_dir(path: &Path) -> Result<(), LedgerError> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let dir = File::open(parent)
                .map_err(|err| LedgerError::io("failed to open parent directory", &err))?;
            dir.sync_all()
                .map_err(|err| LedgerError::io("failed to sync parent directory", &err))?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
