use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::segment::{PartitionKey, SegmentId};

/// Where a record sits in the log: `[offset, end_offset)` of `segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub segment: SegmentId,
    pub offset: u64,
    pub end_offset: u64,
}

impl LogPosition {
    #[must_use]
    pub fn partition(&self) -> PartitionKey {
        self.segment.partition
    }

    #[must_use]
    pub fn sequence_no(&self) -> u32 {
        self.segment.sequence_no
    }
}

/// Progress through the log.
///
/// Each segment carries its own consumed byte offset, always on a record
/// boundary, so appends that land in an older partition after a newer one was
/// indexed are still picked up. Segments ordered before `floor` count as fully
/// consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WatermarkDocument", into = "WatermarkDocument")]
pub struct Watermark {
    cursors: BTreeMap<SegmentId, u64>,
    floor: Option<SegmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkDocument {
    last_partition_indexed: Option<PartitionKey>,
    #[serde(default)]
    last_sequence_no: u32,
    #[serde(default)]
    last_offset_indexed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    floor: Option<SegmentId>,
    #[serde(default)]
    segments: Vec<SegmentCursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentCursor {
    segment: SegmentId,
    offset: u64,
}

impl From<Watermark> for WatermarkDocument {
    fn from(value: Watermark) -> Self {
        Self {
            last_partition_indexed: value.last_partition_indexed(),
            last_sequence_no: value.last_sequence_no(),
            last_offset_indexed: value.last_offset_indexed(),
            floor: value.floor,
            segments: value
                .cursors
                .into_iter()
                .map(|(segment, offset)| SegmentCursor { segment, offset })
                .collect(),
        }
    }
}

impl From<WatermarkDocument> for Watermark {
    fn from(value: WatermarkDocument) -> Self {
        let mut watermark = Self {
            cursors: value
                .segments
                .into_iter()
                .map(|cursor| (cursor.segment, cursor.offset))
                .collect(),
            floor: value.floor,
        };

        // A document carrying only the summary position means everything up
        // to that point was consumed.
        if watermark.cursors.is_empty() {
            if let Some(partition) = value.last_partition_indexed {
                let last = SegmentId::new(partition, value.last_sequence_no.max(1));
                watermark.floor = Some(watermark.floor.map_or(last, |floor| floor.max(last)));
                watermark.cursors.insert(last, value.last_offset_indexed);
            }
        }
        watermark
    }
}

impl Watermark {
    /// Nothing consumed; the next scan starts at the oldest segment.
    #[must_use]
    pub fn origin() -> Self {
        Self::default()
    }

    /// Treats every partition before `partition` as consumed and everything
    /// from `partition` onward as unread.
    #[must_use]
    pub fn since(partition: PartitionKey) -> Self {
        Self {
            cursors: BTreeMap::new(),
            floor: Some(SegmentId::new(partition, 1)),
        }
    }

    #[must_use]
    pub fn is_origin(&self) -> bool {
        self.cursors.is_empty() && self.floor.is_none()
    }

    #[must_use]
    pub fn floor(&self) -> Option<SegmentId> {
        self.floor
    }

    /// Byte offset to resume `segment` from, or `None` when it lies before
    /// the floor.
    #[must_use]
    pub fn resume_offset(&self, segment: SegmentId) -> Option<u64> {
        if self.floor.is_some_and(|floor| segment < floor) {
            return None;
        }
        Some(self.cursors.get(&segment).copied().unwrap_or(0))
    }

    /// Records that `segment` was consumed up to `offset`. Cursors never move
    /// backwards.
    pub fn advance(&mut self, segment: SegmentId, offset: u64) {
        let cursor = self.cursors.entry(segment).or_insert(0);
        *cursor = (*cursor).max(offset);
    }

    /// Folds the cursors of `other` into this watermark, keeping this floor.
    pub fn merge(&mut self, other: &Watermark) {
        for (segment, offset) in other.segments() {
            self.advance(segment, offset);
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = (SegmentId, u64)> + '_ {
        self.cursors.iter().map(|(segment, offset)| (*segment, *offset))
    }

    #[must_use]
    pub fn last_partition_indexed(&self) -> Option<PartitionKey> {
        self.last_cursor().map(|(segment, _)| segment.partition)
    }

    #[must_use]
    pub fn last_sequence_no(&self) -> u32 {
        self.last_cursor().map_or(0, |(segment, _)| segment.sequence_no)
    }

    #[must_use]
    pub fn last_offset_indexed(&self) -> u64 {
        self.last_cursor().map_or(0, |(_, offset)| offset)
    }

    fn last_cursor(&self) -> Option<(SegmentId, u64)> {
        self.cursors
            .iter()
            .next_back()
            .map(|(segment, offset)| (*segment, *offset))
    }
}
