//! Copy planning over CBT extent lists.
//!
//! The hypervisor reports changed extents at fine granularity; copying them
//! one at a time wastes a round trip per extent. Nearby extents are merged
//! into chunks, paying for the small gaps in between to amortize round-trip
//! cost, with a hard cap on chunk size so workers stay balanced.

use crate::agent::vsphere::DiskExtent;

/// Merge extents separated by at most this many bytes.
pub const MAX_COALESCE_GAP: u64 = 1 << 20; // 1 MiB

/// No chunk grows beyond this, merged or not.
pub const MAX_CHUNK_SIZE: u64 = 32 << 20; // 32 MiB

/// One unit of copy work: read `length` bytes at `offset` from the source,
/// write them at the same offset on the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

/// Coalesces an extent list into bounded chunks.
///
/// Extents are sorted by offset first; CBT results are usually ordered but
/// the protocol does not promise it. Oversized extents are split so no
/// chunk exceeds `MAX_CHUNK_SIZE`.
pub fn coalesce_extents(extents: &[DiskExtent]) -> Vec<Chunk> {
    let mut sorted: Vec<DiskExtent> = extents.iter().filter(|e| e.length > 0).copied().collect();
    sorted.sort_by_key(|e| e.offset);

    let mut merged: Vec<Chunk> = Vec::new();
    for extent in sorted {
        match merged.last_mut() {
            Some(last) => {
                let last_end = last.offset + last.length;
                let gap = extent.offset.saturating_sub(last_end);
                let merged_length = (extent.offset + extent.length) - last.offset;

                if extent.offset >= last_end
                    && gap <= MAX_COALESCE_GAP
                    && merged_length <= MAX_CHUNK_SIZE
                {
                    last.length = merged_length;
                } else {
                    merged.push(Chunk {
                        offset: extent.offset,
                        length: extent.length,
                    });
                }
            }
            None => merged.push(Chunk {
                offset: extent.offset,
                length: extent.length,
            }),
        }
    }

    // Second pass: split anything the merge left oversized
    let mut chunks = Vec::with_capacity(merged.len());
    for chunk in merged {
        let mut offset = chunk.offset;
        let mut remaining = chunk.length;
        while remaining > MAX_CHUNK_SIZE {
            chunks.push(Chunk {
                offset,
                length: MAX_CHUNK_SIZE,
            });
            offset += MAX_CHUNK_SIZE;
            remaining -= MAX_CHUNK_SIZE;
        }
        if remaining > 0 {
            chunks.push(Chunk {
                offset,
                length: remaining,
            });
        }
    }

    chunks
}

/// Total payload bytes a chunk list will move.
pub fn total_bytes(chunks: &[Chunk]) -> u64 {
    chunks.iter().map(|c| c.length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn extent(offset: u64, length: u64) -> DiskExtent {
        DiskExtent { offset, length }
    }

    #[test]
    fn adjacent_extents_merge() {
        let chunks = coalesce_extents(&[extent(0, MIB), extent(MIB, MIB)]);
        assert_eq!(chunks, vec![Chunk { offset: 0, length: 2 * MIB }]);
    }

    #[test]
    fn gap_at_the_limit_merges_beyond_it_does_not() {
        let within = coalesce_extents(&[extent(0, MIB), extent(2 * MIB, MIB)]);
        assert_eq!(within.len(), 1, "1 MiB gap must merge");
        assert_eq!(within[0].length, 3 * MIB, "the gap bytes ride along");

        let beyond = coalesce_extents(&[extent(0, MIB), extent(2 * MIB + 1, MIB)]);
        assert_eq!(beyond.len(), 2, "gap over 1 MiB must not merge");
    }

    #[test]
    fn merge_never_exceeds_the_chunk_cap() {
        let chunks = coalesce_extents(&[extent(0, 31 * MIB), extent(31 * MIB, 2 * MIB)]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.length <= MAX_CHUNK_SIZE));
    }

    #[test]
    fn oversized_extent_is_split() {
        let chunks = coalesce_extents(&[extent(0, 70 * MIB)]);
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, length: 32 * MIB },
                Chunk { offset: 32 * MIB, length: 32 * MIB },
                Chunk { offset: 64 * MIB, length: 6 * MIB },
            ]
        );
    }

    #[test]
    fn unsorted_input_is_handled() {
        let chunks = coalesce_extents(&[extent(10 * MIB, MIB), extent(0, MIB)]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].offset < chunks[1].offset);
    }

    #[test]
    fn overlapping_extents_do_not_merge_backwards() {
        // CBT never reports overlaps, but a malformed extent must not
        // shrink the plan
        let chunks = coalesce_extents(&[extent(0, 4 * MIB), extent(2 * MIB, MIB)]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(total_bytes(&chunks), 5 * MIB);
    }

    #[test]
    fn empty_and_zero_length_extents_yield_no_work() {
        assert!(coalesce_extents(&[]).is_empty());
        assert!(coalesce_extents(&[extent(0, 0)]).is_empty());
    }
}
