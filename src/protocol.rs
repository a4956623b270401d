//! Frame geometry, pixel-format constants, and wire-format helpers.
//!
//! The peripheral streams one still image per frame as a gapless run of GATT
//! notifications.  Each pixel is two bytes of big-endian RGB565:
//!
//! ```text
//! byte 0: R4 R3 R2 R1 R0 G5 G4 G3
//! byte 1: G2 G1 G0 B4 B3 B2 B1 B0
//! ```
//!
//! Frames carry no header, index, or checksum.  A frame ends exactly when
//! `width × height × 2` bytes have arrived.

// ── Pixel formats ────────────────────────────────────────────────────────────

/// Bytes per pixel on the wire (RGB565).
pub const SOURCE_BYTES_PER_PIXEL: usize = 2;

/// Bytes per pixel after conversion (RGB888, `R G B` byte order).
pub const DISPLAY_BYTES_PER_PIXEL: usize = 3;

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Advertised name of the camera peripheral the receiver looks for.
pub const DEFAULT_DEVICE_NAME: &str = "haolanzhan (2)";

/// Frame width in pixels (QVGA).
pub const DEFAULT_WIDTH: u32 = 320;

/// Frame height in pixels (QVGA).
pub const DEFAULT_HEIGHT: u32 = 240;

/// Largest notification payload the peripheral sends.
///
/// 128 bytes fits in a single notification once the ATT MTU has been
/// negotiated above 131; a 320×240 frame is then exactly 1200 packets.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 128;

// ── Geometry helpers ─────────────────────────────────────────────────────────

/// Size in bytes of one raw (RGB565) frame.
pub fn raw_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * SOURCE_BYTES_PER_PIXEL
}

/// Size in bytes of one converted (RGB888) frame.
pub fn converted_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * DISPLAY_BYTES_PER_PIXEL
}

/// Number of full-size packets needed to carry one raw frame.
///
/// ```
/// # use ble_image_rx::protocol::packets_per_frame;
/// assert_eq!(packets_per_frame(320, 240, 128), 1200);
/// ```
pub fn packets_per_frame(width: u32, height: u32, max_packet_bytes: usize) -> usize {
    raw_frame_len(width, height).div_ceil(max_packet_bytes.max(1))
}

/// Map a raw-buffer offset to the matching offset in the converted buffer.
///
/// Only meaningful for pixel-aligned (even) offsets.
pub fn converted_offset(raw_offset: usize) -> usize {
    raw_offset / SOURCE_BYTES_PER_PIXEL * DISPLAY_BYTES_PER_PIXEL
}

/// Pack 8-bit channels into the big-endian RGB565 wire format by truncation.
///
/// Used by the built-in simulator; the inverse of
/// [`crate::converter::rgb565_to_rgb888`] for values that survive truncation.
///
/// ```
/// # use ble_image_rx::protocol::encode_rgb565;
/// assert_eq!(encode_rgb565(255, 0, 0), [0xF8, 0x00]);
/// assert_eq!(encode_rgb565(0, 255, 0), [0x07, 0xE0]);
/// assert_eq!(encode_rgb565(0, 0, 255), [0x00, 0x1F]);
/// ```
pub fn encode_rgb565(r: u8, g: u8, b: u8) -> [u8; 2] {
    let v = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
    v.to_be_bytes()
}
