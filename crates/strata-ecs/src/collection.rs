//! Sparse chunk selections within one archetype.

use crate::archetype::ArchetypeId;

/// A contiguous run of slots inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk_index: usize,
    pub start: usize,
    pub len: usize,
}

impl ChunkRange {
    /// One past the last slot, saturating on overflow.
    fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }
}

/// An explicit subset of one archetype's chunks, as sorted, non-overlapping
/// [`ChunkRange`]s.
///
/// Built by
/// [`EntityManager::chunk_collections_for_entities`](crate::manager::EntityManager::chunk_collections_for_entities)
/// or by hand. Ranges are resolved against the archetype when a query runs;
/// a range beyond the current chunk contents is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchetypeChunkCollection {
    archetype: ArchetypeId,
    ranges: Vec<ChunkRange>,
}

impl ArchetypeChunkCollection {
    /// A collection covering whole chunks.
    pub fn from_chunks(archetype: ArchetypeId, chunks: &[(usize, usize)]) -> Self {
        let ranges = chunks
            .iter()
            .map(|&(chunk_index, len)| ChunkRange {
                chunk_index,
                start: 0,
                len,
            })
            .collect();
        Self::from_ranges(archetype, ranges)
    }

    /// Build from `(chunk_index, slot)` pairs. Duplicates are removed and
    /// neighbouring slots merged into ranges.
    pub fn from_slots(archetype: ArchetypeId, mut slots: Vec<(usize, usize)>) -> Self {
        slots.sort_unstable();
        slots.dedup();
        let mut ranges: Vec<ChunkRange> = Vec::new();
        for (chunk_index, slot) in slots {
            match ranges.last_mut() {
                Some(last) if last.chunk_index == chunk_index && last.end() == slot => {
                    last.len += 1;
                }
                _ => ranges.push(ChunkRange {
                    chunk_index,
                    start: slot,
                    len: 1,
                }),
            }
        }
        Self { archetype, ranges }
    }

    /// Build from explicit ranges. Empty ranges are dropped, the rest sorted
    /// by position, and overlapping ranges in one chunk merged so no slot is
    /// visited twice.
    pub fn from_ranges(archetype: ArchetypeId, mut ranges: Vec<ChunkRange>) -> Self {
        ranges.retain(|r| r.len > 0);
        ranges.sort_unstable_by_key(|r| (r.chunk_index, r.start));
        let mut merged: Vec<ChunkRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if last.chunk_index == r.chunk_index && r.start < last.end() => {
                    last.len = last.end().max(r.end()) - last.start;
                }
                _ => merged.push(r),
            }
        }
        Self {
            archetype,
            ranges: merged,
        }
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of slots covered.
    pub fn num_slots(&self) -> usize {
        self.ranges.iter().map(|r| r.len).sum()
    }
}
