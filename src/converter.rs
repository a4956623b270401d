//! RGB565 → RGB888 pixel conversion and the per-frame conversion barrier.
//!
//! [`convert_segment`] is pure: the same input always produces the same
//! output, and each segment's output position is derived from its own source
//! offset.  That is what lets [`ConversionBarrier`] run units concurrently on
//! the runtime's worker threads while the session keeps receiving packets.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use tokio::task::JoinSet;

use crate::assembler::RawSegment;
use crate::error::ConversionFault;
use crate::protocol::{converted_offset, DISPLAY_BYTES_PER_PIXEL, SOURCE_BYTES_PER_PIXEL};

// ── Pixel math ───────────────────────────────────────────────────────────────

/// Expand one big-endian RGB565 pixel to 8-bit channels.
///
/// Channels are widened by bit replication (the top bits are copied into the
/// freed low bits), so full-scale 5- and 6-bit values map to exactly 255:
///
/// ```
/// # use ble_image_rx::converter::rgb565_to_rgb888;
/// assert_eq!(rgb565_to_rgb888(0xF8, 0x00), [255, 0, 0]);
/// assert_eq!(rgb565_to_rgb888(0x07, 0xE0), [0, 255, 0]);
/// assert_eq!(rgb565_to_rgb888(0x00, 0x1F), [0, 0, 255]);
/// ```
#[inline]
pub fn rgb565_to_rgb888(b0: u8, b1: u8) -> [u8; 3] {
    let r5 = (b0 & 0xF8) >> 3;
    let g6 = ((b0 & 0x07) << 3) | ((b1 & 0xE0) >> 5);
    let b5 = b1 & 0x1F;
    [
        (r5 << 3) | (r5 >> 2),
        (g6 << 2) | (g6 >> 4),
        (b5 << 3) | (b5 >> 2),
    ]
}

/// Output of one conversion unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedSegment {
    /// Offset of the source bytes in the raw frame.
    pub source_offset: usize,
    /// Offset of `data` in the converted frame (`source_offset × 3 / 2`).
    pub offset: usize,
    pub data: Vec<u8>,
}

/// Convert a pixel-aligned raw segment that starts at `source_offset`.
pub fn convert_segment(
    segment: &[u8],
    source_offset: usize,
) -> Result<ConvertedSegment, ConversionFault> {
    if segment.len() % SOURCE_BYTES_PER_PIXEL != 0 || source_offset % SOURCE_BYTES_PER_PIXEL != 0
    {
        return Err(ConversionFault::OddLength {
            offset: source_offset,
            len: segment.len(),
        });
    }
    let pixels = segment.len() / SOURCE_BYTES_PER_PIXEL;
    let mut data = Vec::with_capacity(pixels * DISPLAY_BYTES_PER_PIXEL);
    for px in segment.chunks_exact(SOURCE_BYTES_PER_PIXEL) {
        data.extend_from_slice(&rgb565_to_rgb888(px[0], px[1]));
    }
    Ok(ConvertedSegment {
        source_offset,
        offset: converted_offset(source_offset),
        data,
    })
}

/// Copy converted segments into their slots of the output frame.
pub fn write_segments(
    out: &mut [u8],
    segments: &[ConvertedSegment],
) -> Result<(), ConversionFault> {
    for seg in segments {
        let end = seg.offset + seg.data.len();
        if end > out.len() {
            return Err(ConversionFault::OutOfBounds {
                offset: seg.offset,
                len: seg.data.len(),
            });
        }
        out[seg.offset..end].copy_from_slice(&seg.data);
    }
    Ok(())
}

/// Convert a whole raw frame on the calling thread.
pub fn convert_frame(raw: &[u8]) -> Result<Vec<u8>, ConversionFault> {
    Ok(convert_segment(raw, 0)?.data)
}

// ── Conversion barrier ───────────────────────────────────────────────────────

/// Signature of a conversion unit body.  Swappable so tests can inject faults.
pub type ConvertFn =
    Arc<dyn Fn(&[u8], usize) -> Result<ConvertedSegment, ConversionFault> + Send + Sync>;

/// Counting barrier over the conversion units of the current frame.
///
/// `dispatch` spawns a unit and records its source offset as pending;
/// [`ConversionBarrier::wait_all`] awaits every unit and returns their
/// outputs, or the first fault.  Dropping the barrier or calling
/// [`ConversionBarrier::cancel`] aborts whatever is still running.
pub struct ConversionBarrier {
    units: JoinSet<Result<ConvertedSegment, ConversionFault>>,
    pending: BTreeSet<usize>,
    limit: usize,
    convert: ConvertFn,
}

impl fmt::Debug for ConversionBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionBarrier")
            .field("pending", &self.pending)
            .field("limit", &self.limit)
            .finish()
    }
}

impl ConversionBarrier {
    /// A barrier for frames of `raw_capacity` bytes.  No frame can need more
    /// units than it has pixels.
    pub fn new(raw_capacity: usize) -> Self {
        Self::with_converter(
            raw_capacity,
            Arc::new(|seg: &[u8], off: usize| convert_segment(seg, off)),
        )
    }

    pub fn with_converter(raw_capacity: usize, convert: ConvertFn) -> Self {
        Self {
            units: JoinSet::new(),
            pending: BTreeSet::new(),
            limit: (raw_capacity / SOURCE_BYTES_PER_PIXEL).max(1),
            convert,
        }
    }

    /// Spawn a conversion unit for `segment`.  Must be called from inside a
    /// tokio runtime.
    pub fn dispatch(&mut self, segment: RawSegment) -> Result<(), ConversionFault> {
        if self.pending.len() >= self.limit {
            return Err(ConversionFault::TooManyUnits { limit: self.limit });
        }
        let convert = Arc::clone(&self.convert);
        self.pending.insert(segment.offset);
        self.units.spawn(async move { convert(&segment.data, segment.offset) });
        Ok(())
    }

    /// Units dispatched for this frame that have not been joined yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Await every dispatched unit.
    ///
    /// On the first fault the remaining units are aborted and the fault is
    /// returned; the barrier is empty afterwards either way.
    pub async fn wait_all(&mut self) -> Result<Vec<ConvertedSegment>, ConversionFault> {
        let mut done = Vec::with_capacity(self.pending.len());
        while let Some(joined) = self.units.join_next().await {
            match joined {
                Ok(Ok(seg)) => {
                    self.pending.remove(&seg.source_offset);
                    done.push(seg);
                }
                Ok(Err(fault)) => {
                    warn!("conversion unit failed: {fault}");
                    self.cancel();
                    return Err(fault);
                }
                Err(e) => {
                    let fault = if e.is_panic() {
                        ConversionFault::Panicked(panic_message(e.into_panic()))
                    } else {
                        ConversionFault::Panicked(e.to_string())
                    };
                    warn!("conversion unit aborted: {fault}");
                    self.cancel();
                    return Err(fault);
                }
            }
        }
        debug!("conversion barrier cleared: {} unit(s)", done.len());
        self.pending.clear();
        Ok(done)
    }

    /// Abort every in-flight unit and forget the frame.
    pub fn cancel(&mut self) {
        if !self.pending.is_empty() {
            debug!("cancelling {} conversion unit(s)", self.pending.len());
        }
        // Dropping a JoinSet aborts all of its tasks.
        self.units = JoinSet::new();
        self.pending.clear();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_colours() {
        let cases: [(u16, [u8; 3]); 5] = [
            (0xFFFF, [255, 255, 255]),
            (0x0000, [0, 0, 0]),
            (0xF800, [255, 0, 0]),
            (0x07E0, [0, 255, 0]),
            (0x001F, [0, 0, 255]),
        ];
        for (px, rgb) in cases {
            let [b0, b1] = px.to_be_bytes();
            assert_eq!(rgb565_to_rgb888(b0, b1), rgb, "pixel {px:#06x}");
        }
    }

    #[test]
    fn bit_replication_not_linear_scaling() {
        // r5 = 0b10000 → 0b10000100 (132); linear scaling would give 131.
        assert_eq!(rgb565_to_rgb888(0x80, 0x00)[0], 132);
        // g6 = 0b000001 → 0b00000100 (4).
        assert_eq!(rgb565_to_rgb888(0x00, 0x20)[1], 4);
        // b5 = 0b00001 → 0b00001000 (8).
        assert_eq!(rgb565_to_rgb888(0x00, 0x01)[2], 8);
    }

    #[test]
    fn segment_offsets_scale() {
        let seg = convert_segment(&[0xF8, 0x00, 0x00, 0x1F], 128).unwrap();
        assert_eq!(seg.source_offset, 128);
        assert_eq!(seg.offset, 192);
        assert_eq!(seg.data, vec![255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn odd_segments_fault() {
        assert_eq!(
            convert_segment(&[1, 2, 3], 0),
            Err(ConversionFault::OddLength { offset: 0, len: 3 })
        );
        assert!(convert_segment(&[1, 2], 1).is_err());
    }

    #[test]
    fn out_of_bounds_segments_fault() {
        let mut out = vec![0; 3];
        let seg = ConvertedSegment {
            source_offset: 2,
            offset: 3,
            data: vec![1, 2, 3],
        };
        assert!(matches!(
            write_segments(&mut out, &[seg]),
            Err(ConversionFault::OutOfBounds { offset: 3, len: 3 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_units_match_sequential_conversion() {
        let raw: Vec<u8> = (0..4096u32).map(|i| (i * 37 % 251) as u8).collect();
        let expected = convert_frame(&raw).unwrap();

        let mut barrier = ConversionBarrier::new(raw.len());
        for (i, chunk) in raw.chunks(128).enumerate().rev() {
            barrier
                .dispatch(RawSegment {
                    offset: i * 128,
                    data: chunk.to_vec(),
                })
                .unwrap();
        }
        assert_eq!(barrier.pending(), 32);
        let segments = barrier.wait_all().await.unwrap();
        assert_eq!(barrier.pending(), 0);

        let mut out = vec![0; raw.len() / 2 * 3];
        write_segments(&mut out, &segments).unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn first_fault_is_reported_and_the_rest_cancelled() {
        let convert: ConvertFn = Arc::new(|seg: &[u8], off: usize| {
            if off == 256 {
                Err(ConversionFault::Unit {
                    offset: off,
                    reason: "injected".into(),
                })
            } else {
                convert_segment(seg, off)
            }
        });
        let mut barrier = ConversionBarrier::with_converter(1024, convert);
        for i in 0..8 {
            barrier
                .dispatch(RawSegment {
                    offset: i * 128,
                    data: vec![0; 128],
                })
                .unwrap();
        }
        let err = barrier.wait_all().await.unwrap_err();
        assert_eq!(
            err,
            ConversionFault::Unit {
                offset: 256,
                reason: "injected".into()
            }
        );
        assert_eq!(barrier.pending(), 0);
    }

    #[tokio::test]
    async fn panicking_unit_becomes_a_fault() {
        let convert: ConvertFn =
            Arc::new(|_: &[u8], _: usize| -> Result<ConvertedSegment, ConversionFault> {
                panic!("boom")
            });
        let mut barrier = ConversionBarrier::with_converter(8, convert);
        barrier
            .dispatch(RawSegment {
                offset: 0,
                data: vec![0; 8],
            })
            .unwrap();
        let err = barrier.wait_all().await.unwrap_err();
        assert_eq!(err, ConversionFault::Panicked("boom".into()));
    }

    #[tokio::test]
    async fn dispatch_is_bounded_by_pixel_count() {
        let mut barrier = ConversionBarrier::new(4);
        for offset in [0, 2] {
            barrier
                .dispatch(RawSegment {
                    offset,
                    data: vec![0; 2],
                })
                .unwrap();
        }
        assert_eq!(
            barrier.dispatch(RawSegment {
                offset: 4,
                data: vec![0; 2]
            }),
            Err(ConversionFault::TooManyUnits { limit: 2 })
        );
        barrier.cancel();
        assert_eq!(barrier.pending(), 0);
        assert!(barrier.wait_all().await.unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn conversion_is_deterministic(raw in prop::collection::vec(any::<u8>(), 0..512)) {
            let even = &raw[..raw.len() & !1];
            let a = convert_segment(even, 0).unwrap();
            let b = convert_segment(even, 0).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.data.len(), even.len() / 2 * 3);
        }

        #[test]
        fn split_conversion_matches_whole(
            raw in prop::collection::vec(any::<u8>(), 2..512),
            split in 0usize..256,
        ) {
            let raw = &raw[..raw.len() & !1];
            let split = (split * 2).min(raw.len());
            let whole = convert_frame(raw).unwrap();
            let mut out = vec![0; whole.len()];
            let tail = convert_segment(&raw[split..], split).unwrap();
            let head = convert_segment(&raw[..split], 0).unwrap();
            write_segments(&mut out, &[tail, head]).unwrap();
            prop_assert_eq!(out, whole);
        }
    }
}
