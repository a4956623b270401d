//! Reassembly of one raw frame from consecutive notification payloads.

use log::trace;

use crate::error::FrameError;
use crate::protocol::SOURCE_BYTES_PER_PIXEL;

/// A pixel-aligned slice of the raw frame ready for conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSegment {
    /// Byte offset of `data` inside the raw frame.
    pub offset: usize,
    pub data: Vec<u8>,
}

/// Owns the raw receive buffer and its write cursor.
///
/// Packets are assumed to arrive in order and without gaps; the assembler only
/// checks that they fit.  [`FrameAssembler::append`] must be called from a
/// single place per session so that cursor advancement is never concurrent.
#[derive(Debug)]
pub struct FrameAssembler {
    raw: Vec<u8>,
    /// Next byte to be written.
    cursor: usize,
    /// Everything before this offset has been handed out by `take_ready`.
    dispatched: usize,
    packets: usize,
}

impl FrameAssembler {
    /// Create an assembler for frames of exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: vec![0; capacity],
            cursor: 0,
            dispatched: 0,
            packets: 0,
        }
    }

    /// Copy `segment` into the frame at the cursor.
    ///
    /// Returns `Ok(true)` exactly once per frame, on the packet that fills the
    /// buffer.  A packet that would overflow the buffer, or any packet after
    /// completion, is rejected and leaves the assembler untouched.
    pub fn append(&mut self, segment: &[u8]) -> Result<bool, FrameError> {
        let capacity = self.raw.len();
        if self.is_complete() {
            return Err(FrameError::AlreadyComplete);
        }
        let end = self.cursor + segment.len();
        if end > capacity {
            return Err(FrameError::Overflow {
                cursor: self.cursor,
                len: segment.len(),
                capacity,
            });
        }
        self.raw[self.cursor..end].copy_from_slice(segment);
        self.cursor = end;
        self.packets += 1;
        trace!(
            "append: packet #{} len={} cursor={}/{}",
            self.packets,
            segment.len(),
            self.cursor,
            capacity
        );
        Ok(self.is_complete())
    }

    /// Hand out the bytes received since the last call, trimmed to whole
    /// pixels.  An odd trailing byte stays behind until its partner arrives.
    pub fn take_ready(&mut self) -> Option<RawSegment> {
        let aligned = self.cursor - self.cursor % SOURCE_BYTES_PER_PIXEL;
        if aligned <= self.dispatched {
            return None;
        }
        let offset = self.dispatched;
        self.dispatched = aligned;
        Some(RawSegment {
            offset,
            data: self.raw[offset..aligned].to_vec(),
        })
    }

    /// Start a new frame.  The buffer is zeroed so stale pixels from a
    /// discarded frame can never leak into the next one.
    pub fn reset(&mut self) {
        self.raw.fill(0);
        self.cursor = 0;
        self.dispatched = 0;
        self.packets = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.raw.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.raw.len()
    }

    /// Packets appended to the current frame.
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Bytes not yet handed out through [`FrameAssembler::take_ready`].
    pub fn undispatched(&self) -> usize {
        self.cursor - self.dispatched
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn qvga_completes_on_packet_1200() {
        let mut asm = FrameAssembler::new(320 * 240 * 2);
        let packet = [0xAB; 128];
        for i in 0..1199 {
            assert!(!asm.append(&packet).unwrap(), "completed early at {i}");
        }
        assert_eq!(asm.packets(), 1199);
        assert!(!asm.is_complete());
        assert!(asm.append(&packet).unwrap());
        assert_eq!(asm.packets(), 1200);
        assert_eq!(asm.cursor(), 153_600);
    }

    #[test]
    fn overflow_is_rejected_without_moving_the_cursor() {
        let mut asm = FrameAssembler::new(10);
        asm.append(&[1; 8]).unwrap();
        let err = asm.append(&[2; 4]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Overflow {
                cursor: 8,
                len: 4,
                capacity: 10
            }
        );
        assert_eq!(asm.cursor(), 8);
        assert_eq!(asm.packets(), 1);
        assert!(asm.append(&[3; 2]).unwrap());
    }

    #[test]
    fn append_after_completion_is_rejected() {
        let mut asm = FrameAssembler::new(4);
        assert!(asm.append(&[0; 4]).unwrap());
        assert_eq!(asm.append(&[0; 1]), Err(FrameError::AlreadyComplete));
        asm.reset();
        assert_eq!(asm.cursor(), 0);
        assert!(!asm.append(&[0; 2]).unwrap());
    }

    #[test]
    fn take_ready_hands_out_whole_pixels_once() {
        let mut asm = FrameAssembler::new(12);
        asm.append(&[1, 2, 3]).unwrap();
        let seg = asm.take_ready().unwrap();
        assert_eq!(seg, RawSegment { offset: 0, data: vec![1, 2] });
        assert_eq!(asm.take_ready(), None);

        asm.append(&[4, 5, 6]).unwrap();
        let seg = asm.take_ready().unwrap();
        assert_eq!(seg, RawSegment { offset: 2, data: vec![3, 4, 5, 6] });

        asm.append(&[7, 8, 9, 10, 11, 12]).unwrap();
        let seg = asm.take_ready().unwrap();
        assert_eq!(seg.offset, 6);
        assert_eq!(seg.data, vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(asm.undispatched(), 0);
        assert!(asm.is_complete());
    }

    #[test]
    fn reset_clears_the_buffer() {
        let mut asm = FrameAssembler::new(4);
        asm.append(&[9, 9]).unwrap();
        asm.reset();
        assert_eq!(asm.raw(), &[0, 0, 0, 0]);
        assert_eq!(asm.packets(), 0);
        assert_eq!(asm.take_ready(), None);
    }

    proptest! {
        #[test]
        fn completion_fires_exactly_once_on_the_last_packet(
            lens in prop::collection::vec(1usize..300, 1..60)
        ) {
            let capacity: usize = lens.iter().sum();
            let mut asm = FrameAssembler::new(capacity);
            let mut completions = 0;
            for (i, len) in lens.iter().enumerate() {
                let before = asm.cursor();
                let done = asm.append(&vec![0x5A; *len]).unwrap();
                prop_assert_eq!(asm.cursor(), before + len);
                if done {
                    completions += 1;
                    prop_assert_eq!(i, lens.len() - 1);
                }
            }
            prop_assert_eq!(completions, 1);
            prop_assert_eq!(asm.packets(), lens.len());
        }

        #[test]
        fn dispatched_segments_tile_the_frame(
            lens in prop::collection::vec(1usize..100, 1..40)
        ) {
            let mut capacity: usize = lens.iter().sum();
            let mut lens = lens;
            if capacity % 2 == 1 {
                lens.push(1);
                capacity += 1;
            }
            let mut asm = FrameAssembler::new(capacity);
            let mut next = 0;
            for len in &lens {
                asm.append(&vec![1; *len]).unwrap();
                while let Some(seg) = asm.take_ready() {
                    prop_assert_eq!(seg.offset, next);
                    prop_assert_eq!(seg.offset % 2, 0);
                    prop_assert_eq!(seg.data.len() % 2, 0);
                    next += seg.data.len();
                }
            }
            prop_assert_eq!(next, capacity);
        }
    }
}
