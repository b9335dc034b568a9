use crate::packet::{ExtentId, PartitionId};
use std::cmp::{max, min};
use std::collections::{BTreeMap, HashMap};

/// A file range stored contiguously in one extent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExtentDescriptor {
    pub file_offset: u64,
    pub partition_id: PartitionId,
    pub extent_id: ExtentId,
    pub extent_offset: u64,
    pub size: u64,
}

impl ExtentDescriptor {
    pub fn end(&self) -> u64 {
        self.file_offset + self.size
    }

    /// Sub-range `[start, end)` of this descriptor, in file offsets.
    pub fn slice(&self, start: u64, end: u64) -> ExtentDescriptor {
        debug_assert!(self.file_offset <= start && start < end && end <= self.end());

        ExtentDescriptor {
            file_offset: start,
            partition_id: self.partition_id,
            extent_id: self.extent_id,
            extent_offset: self.extent_offset + (start - self.file_offset),
            size: end - start,
        }
    }

    /// True when `other` maps file offsets into the same extent at the same displacement, so
    /// replacing `self` with `other` loses no data.
    fn same_mapping(&self, other: &ExtentDescriptor) -> bool {
        self.partition_id == other.partition_id
            && self.extent_id == other.extent_id
            && self.file_offset.wrapping_sub(self.extent_offset) == other.file_offset.wrapping_sub(other.extent_offset)
    }

    fn owner(&self) -> (PartitionId, ExtentId) {
        (self.partition_id, self.extent_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot cache an empty extent {0:?}")]
    EmptyExtent(ExtentDescriptor),
}

/// One piece of a cached read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheSegment {
    Extent(ExtentDescriptor),
    Hole { file_offset: u64, size: u64 },
}

/// Per-file mapping from non-overlapping file ranges to extents.
///
/// Ranges superseded by a new write stay tracked as pending discards, attributed to the extent
/// that superseded them, until `remove_discard` confirms the metadata service recorded the change.
#[derive(Debug, Default)]
pub struct ExtentCache {
    extents: BTreeMap<u64, ExtentDescriptor>,
    pending_discards: HashMap<(PartitionId, ExtentId), Vec<ExtentDescriptor>>,
}

impl ExtentCache {
    pub fn new() -> Self {
        ExtentCache::default()
    }

    /// Inserts `extent`, trimming or removing whatever it overlaps.
    ///
    /// With `is_new_write`, the overlapped pieces become pending discards of `extent` and every
    /// pending discard of `extent` (including ones left over from an earlier failed commit) is
    /// appended to `discards` in ascending file offset order. Without it the cache is being
    /// refreshed from the metadata service, and overlapped pieces are dropped silently.
    pub fn append(
        &mut self,
        extent: ExtentDescriptor,
        is_new_write: bool,
        discards: &mut Vec<ExtentDescriptor>,
    ) -> Result<(), CacheError> {
        if extent.size == 0 {
            return Err(CacheError::EmptyExtent(extent));
        }

        let start = extent.file_offset;
        let end = extent.end();
        let overlapping: Vec<ExtentDescriptor> = self
            .extents
            .range(..end)
            .rev()
            .take_while(|(_, cached)| cached.end() > start)
            .map(|(_, cached)| *cached)
            .collect();

        let mut superseded = Vec::new();
        for old in overlapping.into_iter().rev() {
            self.extents.remove(&old.file_offset);
            if old.file_offset < start {
                let left = old.slice(old.file_offset, start);
                self.extents.insert(left.file_offset, left);
            }
            if old.end() > end {
                let right = old.slice(end, old.end());
                self.extents.insert(right.file_offset, right);
            }
            if !old.same_mapping(&extent) {
                superseded.push(old.slice(max(old.file_offset, start), min(old.end(), end)));
            }
        }
        self.extents.insert(start, extent);

        if !is_new_write {
            return Ok(());
        }

        let pending = self.pending_discards.entry(extent.owner()).or_default();
        for piece in superseded {
            if !pending.contains(&piece) {
                pending.push(piece);
            }
        }
        pending.sort_by_key(|piece| piece.file_offset);
        discards.extend(pending.iter().copied());
        if pending.is_empty() {
            self.pending_discards.remove(&extent.owner());
        }

        Ok(())
    }

    /// Forgets exactly the given pending discards. Returns how many were found.
    pub fn remove_discard(&mut self, discards: &[ExtentDescriptor]) -> usize {
        let mut removed = 0;
        for pending in self.pending_discards.values_mut() {
            let before = pending.len();
            pending.retain(|piece| !discards.contains(piece));
            removed += before - pending.len();
        }
        self.pending_discards.retain(|_, pending| !pending.is_empty());

        removed
    }

    pub fn pending_discards(&self) -> Vec<ExtentDescriptor> {
        let mut all: Vec<ExtentDescriptor> = self.pending_discards.values().flatten().copied().collect();
        all.sort_by_key(|piece| (piece.file_offset, piece.partition_id, piece.extent_id));

        all
    }

    pub fn extents(&self) -> Vec<ExtentDescriptor> {
        self.extents.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// End of the furthest cached range.
    pub fn file_size(&self) -> u64 {
        self.extents.values().next_back().map(|e| e.end()).unwrap_or(0)
    }

    /// Splits `[offset, offset + len)` into cached pieces and holes, in order.
    pub fn lookup(&self, offset: u64, len: u64) -> Vec<CacheSegment> {
        let end = offset + len;
        let mut segments = Vec::new();
        let mut cursor = offset;

        let first_key = self
            .extents
            .range(..=offset)
            .next_back()
            .filter(|(_, cached)| cached.end() > offset)
            .map(|(key, _)| *key)
            .unwrap_or(offset);

        for cached in self.extents.range(first_key..end).map(|(_, cached)| cached) {
            let piece_start = max(cached.file_offset, offset);
            let piece_end = min(cached.end(), end);
            if piece_start >= piece_end {
                continue;
            }
            if piece_start > cursor {
                segments.push(CacheSegment::Hole {
                    file_offset: cursor,
                    size: piece_start - cursor,
                });
            }
            segments.push(CacheSegment::Extent(cached.slice(piece_start, piece_end)));
            cursor = piece_end;
        }
        if cursor < end {
            segments.push(CacheSegment::Hole {
                file_offset: cursor,
                size: end - cursor,
            });
        }

        segments
    }
}
