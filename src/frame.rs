//! Captured frames and the single-slot cell that holds the newest one.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use tracing::error;

use crate::{OurError, OurResult};

/// One captured image: a packed, row-major pixel buffer plus its shape.
///
/// Frames are immutable once built. `Clone` copies the pixel buffer, so every reader gets
/// storage of its own. Equality looks at shape and pixels only.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    height: u32,
    width: u32,
    channels: u8,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Build a frame, checking that `data` holds exactly `height * width * channels` bytes
    pub fn new(height: u32, width: u32, channels: u8, data: Vec<u8>) -> OurResult<Self> {
        let expected = height as usize * width as usize * channels as usize;
        if channels == 0 || data.len() != expected {
            return Err(OurError::App(format!(
                "Frame buffer is {} bytes, expected {expected} for {height}x{width}x{channels}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            height,
            width,
            channels,
            sequence: 0,
            captured_at: Instant::now(),
        })
    }

    /// Build a frame from rows that are `stride` bytes apart, dropping the row padding
    pub fn from_strided(
        height: u32,
        width: u32,
        channels: u8,
        stride: usize,
        data: &[u8],
    ) -> OurResult<Self> {
        let row_len = width as usize * channels as usize;
        if stride < row_len || data.len() < stride * (height as usize).saturating_sub(1) + row_len
        {
            return Err(OurError::App(format!(
                "Frame buffer of {} bytes with stride {stride} can't hold {height}x{width}x{channels}",
                data.len()
            )));
        }
        if stride == row_len {
            return Self::new(height, width, channels, data[..row_len * height as usize].to_vec());
        }
        let packed = data
            .chunks(stride)
            .take(height as usize)
            .flat_map(|row| &row[..row_len])
            .copied()
            .collect();
        Self::new(height, width, channels, packed)
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (u32, u32, u8) {
        (self.height, self.width, self.channels)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Position of this frame in its session's run, starting at 1
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// View the frame as an `image` buffer so callers can encode it
    pub fn to_image(&self) -> OurResult<DynamicImage> {
        let (width, height, data) = (self.width, self.height, self.data.clone());
        let image = match self.channels {
            1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
            _ => None,
        };
        image.ok_or_else(|| {
            OurError::App(format!(
                "Can't convert a {}-channel frame to an image",
                self.channels
            ))
        })
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.data == other.data
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("height", &self.height)
            .field("width", &self.width)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Latest-frame cell: one slot, overwritten on every publish. Never a queue.
#[derive(Default)]
pub(crate) struct FrameCell {
    slot: Mutex<Option<Frame>>,
}

impl FrameCell {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Frame>> {
        self.slot.lock().unwrap_or_else(|e| {
            error!("Frame cell mutex poisoned: {e}");
            e.into_inner()
        })
    }

    /// Replace the slot's content while `running` is still set.
    ///
    /// The flag is checked under the slot lock, so once `stop()` has cleared it and emptied
    /// the slot, a late writer can't put a frame back. Returns `false` when the frame was
    /// dropped for that reason.
    pub(crate) fn publish(&self, frame: Frame, running: &AtomicBool) -> bool {
        let mut slot = self.lock();
        if !running.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(frame);
        true
    }

    /// Copy of the newest frame
    pub(crate) fn latest(&self) -> Option<Frame> {
        self.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: u8) -> Frame {
        Frame::new(2, 3, 3, vec![fill; 18]).expect("valid frame")
    }

    #[test]
    fn test_frame_shape_is_checked() {
        assert!(Frame::new(2, 3, 3, vec![0; 17]).is_err());
        assert!(Frame::new(2, 3, 0, vec![]).is_err());
        let frame = frame(7);
        assert_eq!(frame.shape(), (2, 3, 3));
        assert_eq!(frame.data().len(), 18);
    }

    #[test]
    fn test_cell_overwrites_latest() {
        let cell = FrameCell::default();
        let running = AtomicBool::new(true);
        assert!(cell.latest().is_none());

        assert!(cell.publish(frame(1).with_sequence(1), &running));
        assert!(cell.publish(frame(2).with_sequence(2), &running));

        let latest = cell.latest().expect("frame published");
        assert_eq!(latest.sequence(), 2);
        assert_eq!(latest.data()[0], 2);
    }

    #[test]
    fn test_cell_copies_are_independent() {
        let cell = FrameCell::default();
        let running = AtomicBool::new(true);
        cell.publish(frame(9), &running);

        let first = cell.latest().expect("frame published");
        let second = cell.latest().expect("frame published");
        assert_eq!(first, second);
        assert_ne!(first.data().as_ptr(), second.data().as_ptr());
    }

    #[test]
    fn test_cell_refuses_writes_after_stop() {
        let cell = FrameCell::default();
        let running = AtomicBool::new(true);
        cell.publish(frame(1), &running);

        running.store(false, Ordering::Release);
        cell.clear();
        assert!(!cell.publish(frame(2), &running));
        assert!(cell.latest().is_none());
    }

    #[test]
    fn test_equality_ignores_capture_metadata() {
        let first = frame(4).with_sequence(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = frame(4).with_sequence(2);
        assert_ne!(first.captured_at(), second.captured_at());
        assert_eq!(first, second);
        assert_ne!(first, frame(5));
        assert_ne!(
            Frame::new(3, 2, 3, vec![4; 18]).expect("valid frame"),
            first
        );
    }

    #[test]
    fn test_from_strided_drops_row_padding() {
        // 2x2 RGB rows padded to 8 bytes
        let data = [1, 1, 1, 2, 2, 2, 0, 0, 3, 3, 3, 4, 4, 4, 0, 0];
        let frame = Frame::from_strided(2, 2, 3, 8, &data).expect("padded rows");
        assert_eq!(frame.data(), &[1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);

        // last row may end without its padding
        let frame = Frame::from_strided(2, 2, 3, 8, &data[..14]).expect("short tail");
        assert_eq!(frame.shape(), (2, 2, 3));

        let packed = Frame::from_strided(1, 2, 3, 6, &data[..6]).expect("packed rows");
        assert_eq!(packed.data(), &data[..6]);

        assert!(Frame::from_strided(2, 2, 3, 4, &data).is_err());
        assert!(Frame::from_strided(3, 2, 3, 8, &data).is_err());
    }

    #[test]
    fn test_frame_to_image() {
        let image = frame(5).to_image().expect("rgb frame converts");
        assert_eq!(image.width(), 3);
        assert_eq!(image.height(), 2);

        let odd = Frame::new(1, 1, 2, vec![0, 0]).expect("valid frame");
        assert!(odd.to_image().is_err());
    }
}
