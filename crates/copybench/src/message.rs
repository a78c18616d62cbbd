//! # Message Model
//!
//! The benchmark payload: 8 independently allocated segments of equal size.
//! On the wire a message is just `per_segment_size * 8` opaque bytes; the
//! segmented shape only exists so the strategies differ in how many copies
//! they need to hand it to the kernel.
//!
//! The effective size is `max(1, requested / 8) * 8`. Sizes that are not a
//! multiple of 8 are truncated (1023 → 1016) and sizes below 8 round up to
//! 8, so the effective size, not the requested one, is what gets measured.

use std::io::IoSlice;

use bytes::Bytes;

use crate::error::TransferError;

/// Number of segments in every message.
pub const SEGMENT_COUNT: usize = 8;

/// Size of one segment for a requested total message size.
pub fn per_segment_size(total_size: usize) -> usize {
    (total_size / SEGMENT_COUNT).max(1)
}

/// Bytes that actually travel on the wire for a requested size.
pub fn effective_size(total_size: usize) -> usize {
    per_segment_size(total_size) * SEGMENT_COUNT
}

/// A fully allocated 8-segment message.
///
/// Segment heap storage never moves once built, so raw pointers handed to
/// the kernel stay valid for as long as the `Message` value is alive,
/// wherever the value itself is moved to.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    segments: Vec<Bytes>,
    segment_size: usize,
}

impl Message {
    /// Allocate all segments or none.
    ///
    /// Segment `i` is filled with `b'A' + i`. Any allocation failure drops
    /// the segments built so far and reports [`TransferError::Alloc`].
    pub fn new(total_size: usize) -> Result<Self, TransferError> {
        let segment_size = per_segment_size(total_size);
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(SEGMENT_COUNT)
            .map_err(|_| TransferError::Alloc {
                bytes: SEGMENT_COUNT * std::mem::size_of::<Bytes>(),
            })?;

        for i in 0..SEGMENT_COUNT {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(segment_size)
                .map_err(|_| TransferError::Alloc {
                    bytes: segment_size,
                })?;
            buf.resize(segment_size, b'A' + i as u8);
            segments.push(Bytes::from(buf));
        }

        Ok(Message {
            segments,
            segment_size,
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Total bytes on the wire.
    pub fn len(&self) -> usize {
        self.segment_size * self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Serialise into `out`, reusing its capacity. This is the staging copy
    /// the full-copy strategy pays for.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
    }

    /// Slices covering every byte from `offset` onwards, in wire order.
    pub fn slices_from(&self, offset: usize) -> Vec<&[u8]> {
        let mut skip = offset;
        let mut out = Vec::with_capacity(SEGMENT_COUNT);
        for seg in &self.segments {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            out.push(&seg[skip..]);
            skip = 0;
        }
        out
    }

    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments.iter().map(|s| IoSlice::new(s)).collect()
    }
}

// ─── MessagePool ─────────────────────────────────────────────────────────────

/// Free list of reusable messages for one session.
///
/// Synchronous strategies hand the same message straight back, so the pool
/// never holds more than one. Zero-copy keeps up to `watermark` messages in
/// the tracker, so the pool grows to at most `watermark + 1`.
#[derive(Debug)]
pub struct MessagePool {
    size: usize,
    free: Vec<Message>,
    allocated: usize,
}

impl MessagePool {
    pub fn new(size: usize) -> Self {
        MessagePool {
            size,
            free: Vec::new(),
            allocated: 0,
        }
    }

    /// Take a free message, allocating a new one if none is available.
    pub fn acquire(&mut self) -> Result<Message, TransferError> {
        if let Some(msg) = self.free.pop() {
            return Ok(msg);
        }
        let msg = Message::new(self.size)?;
        self.allocated += 1;
        Ok(msg)
    }

    pub fn restore(&mut self, message: Message) {
        self.free.push(message);
    }

    pub fn restore_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.free.extend(messages);
    }

    /// Messages ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_sizes_for_reference_inputs() {
        let cases = [
            (1usize, 1usize),
            (7, 1),
            (8, 1),
            (1023, 127),
            (1024, 128),
            (1_000_000, 125_000),
        ];
        for (total, per_seg) in cases {
            assert_eq!(per_segment_size(total), per_seg, "total = {total}");
            assert_eq!(effective_size(total), per_seg * SEGMENT_COUNT);
        }
        // Truncation for sizes that are not a multiple of 8.
        assert_eq!(effective_size(1023), 1016);
        assert!(effective_size(1_000_000) <= 1_000_000);
    }

    #[test]
    fn message_fills_segments_with_pattern() {
        let msg = Message::new(64).unwrap();
        assert_eq!(msg.segments().len(), SEGMENT_COUNT);
        assert_eq!(msg.len(), 64);
        for (i, seg) in msg.segments().iter().enumerate() {
            assert_eq!(seg.len(), 8);
            assert!(seg.iter().all(|&b| b == b'A' + i as u8));
        }
    }

    #[test]
    fn tiny_message_still_has_every_segment() {
        let msg = Message::new(1).unwrap();
        assert_eq!(msg.segment_size(), 1);
        assert_eq!(msg.len(), 8);
        assert!(!msg.is_empty());
    }

    #[test]
    fn allocation_failure_is_reported_not_aborted() {
        let err = Message::new(usize::MAX).unwrap_err();
        assert!(matches!(err, TransferError::Alloc { .. }));
    }

    #[test]
    fn serialized_bytes_match_segment_order() {
        let msg = Message::new(16).unwrap();
        let mut out = Vec::new();
        msg.serialize_into(&mut out);
        assert_eq!(out, b"AABBCCDDEEFFGGHH");

        // Capacity is reused, content replaced.
        msg.serialize_into(&mut out);
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn slices_from_offset_skip_sent_prefix() {
        let msg = Message::new(16).unwrap();
        let all: Vec<u8> = msg.slices_from(0).concat();
        assert_eq!(all, b"AABBCCDDEEFFGGHH");

        let rest: Vec<u8> = msg.slices_from(5).concat();
        assert_eq!(rest, b"CDDEEFFGGHH");
        assert_eq!(msg.slices_from(5).len(), 6);

        assert!(msg.slices_from(16).is_empty());
    }

    #[test]
    fn pool_reuses_restored_messages() {
        let mut pool = MessagePool::new(32);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);

        pool.restore(a);
        pool.restore(b);
        assert_eq!(pool.idle(), 2);

        let _c = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.idle(), 1);
    }
}
