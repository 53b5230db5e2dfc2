//! Segmentation plan for a single uploaded object.
//!
//! An object of `total_size` bytes is delivered by the client as fixed-size
//! chunks and written to the backend as fixed-size segments. Every segment
//! except the last holds exactly `segment_chunks` chunks.

use std::ops::Range;

/// Size of one encrypted crypt4gh block including its MAC.
pub const CHUNK_SIZE: u64 = 65_564;

/// Chunks per segment, chosen so a segment stays just under 5 GiB.
pub const SEGMENT_CHUNKS: u64 = 81_885;

/// Bytes per segment (`SEGMENT_CHUNKS * CHUNK_SIZE`).
pub const SEGMENT_SIZE: u64 = SEGMENT_CHUNKS * CHUNK_SIZE;

/// Derived segment/chunk geometry of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Declared object size in bytes.
    pub total_size: u64,

    /// Bytes per full segment.
    pub segment_size: u64,

    /// Bytes per full chunk.
    pub chunk_size: u64,

    /// Chunks per full segment.
    pub segment_chunks: u64,

    /// `ceil(total_size / segment_size)`.
    pub total_segments: u64,

    /// `ceil(total_size / chunk_size)`.
    pub total_chunks: u64,

    /// Bytes in the final short segment, 0 when the size divides evenly.
    pub remainder_segment: u64,

    /// Chunks in the final short segment, 0 when the size divides evenly.
    pub remainder_chunks: u64,
}

impl SegmentPlan {
    /// Build the plan for `total_size` bytes.
    ///
    /// `segment_size` must be a non-zero multiple of the non-zero `chunk_size`;
    /// anything else is a programming error in the caller's limits.
    pub fn new(total_size: u64, segment_size: u64, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        assert!(
            segment_size >= chunk_size && segment_size % chunk_size == 0,
            "segment size must be a multiple of the chunk size"
        );

        let remainder_segment = total_size % segment_size;
        Self {
            total_size,
            segment_size,
            chunk_size,
            segment_chunks: segment_size / chunk_size,
            total_segments: total_size.div_ceil(segment_size),
            total_chunks: total_size.div_ceil(chunk_size),
            remainder_segment,
            remainder_chunks: remainder_segment.div_ceil(chunk_size),
        }
    }

    /// Global chunk indices belonging to `segment`.
    ///
    /// The last segment always ends at `total_chunks`, so the final short
    /// chunk is never dropped.
    pub fn chunk_range(&self, segment: u64) -> Range<u64> {
        let start = segment * self.segment_chunks;
        let end = if segment + 1 >= self.total_segments {
            self.total_chunks
        } else {
            start + self.segment_chunks
        };
        start..end.max(start)
    }

    /// Number of chunks in the last segment.
    pub fn final_segment_chunks(&self) -> u64 {
        match self.total_segments {
            0 => 0,
            _ if self.remainder_segment == 0 => self.segment_chunks,
            _ => self.remainder_chunks,
        }
    }

    pub fn is_last_segment(&self, segment: u64) -> bool {
        segment + 1 == self.total_segments
    }
}

/// Object name of segment `segment` (zero based) under its group prefix.
///
/// Segment numbers on the backend start from 1 and are zero-padded to eight
/// digits so that lexical listing order matches object order.
pub fn segment_object_name(object: &str, segment_id: &str, segment: u64) -> String {
    format!("{}/{}/{:08}", object, segment_id, segment + 1)
}

/// Value of the `X-Object-Manifest` header pointing at an upload's segments.
pub fn manifest_prefix(segments_container: &str, object: &str, segment_id: &str) -> String {
    format!("{}/{}/{}/", segments_container, object, segment_id)
}
