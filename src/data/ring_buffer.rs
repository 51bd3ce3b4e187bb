//! Fixed-capacity frame block between the camera and the pyramid store.
//!
//! The block is allocated once per acquisition with room for `block_size` frames.
//! Frames are cropped from the camera raster straight into their slot; when the block
//! is full (or the tile's last frame arrived) the sequencer flushes it to the store and
//! the block is reused for the next run of frames.
//!
//! ## Data Tapping
//!
//! The ring supports "tap consumers" that receive every Nth frame for live preview
//! without blocking the writer. Taps use bounded async channels; if a consumer is
//! slow, frames are dropped rather than stalling acquisition. Closed taps are removed
//! on the next delivery attempt.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::error::{AppResult, DaqError};

/// Default channel capacity for tap consumers (number of frames buffered)
const DEFAULT_TAP_CHANNEL_SIZE: usize = 16;

/// Offsets of the stored frame inside the camera raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCrop {
    /// First raster row copied.
    pub row_offset: usize,
    /// First raster column copied.
    pub col_offset: usize,
}

impl FrameCrop {
    /// Crop taking `frame_width` columns centred in a raster `raster_width` wide,
    /// skipping `row_margin` rows at the top.
    pub fn centred(raster_width: usize, frame_width: usize, row_margin: usize) -> Self {
        Self {
            row_offset: row_margin,
            col_offset: raster_width.saturating_sub(frame_width) / 2,
        }
    }
}

/// A frame delivered to a preview tap.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// Dataset index of the tile being acquired.
    pub tile_index: usize,
    /// Frame number within the tile.
    pub frame: usize,
    /// Cropped pixels.
    pub pixels: Array2<u16>,
}

/// A tap consumer that receives every Nth frame.
struct TapConsumer {
    id: String,
    nth_frame: usize,
    frame_count: usize,
    sender: mpsc::Sender<PreviewFrame>,
}

impl TapConsumer {
    fn should_deliver(&mut self) -> bool {
        let count = self.frame_count;
        self.frame_count += 1;
        count % self.nth_frame == 0
    }
}

/// Frame block reused for every flush of an acquisition.
pub struct FrameRing {
    block: Array3<u16>,
    filled: usize,
    first_frame: usize,
    tile_index: usize,
    crop: FrameCrop,
    taps: Vec<TapConsumer>,
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("shape", &self.block.shape())
            .field("filled", &self.filled)
            .field("first_frame", &self.first_frame)
            .field("tap_count", &self.taps.len())
            .finish()
    }
}

impl FrameRing {
    /// Allocate a block of `capacity` frames of `height` x `width`.
    pub fn new(capacity: usize, height: usize, width: usize, crop: FrameCrop) -> Self {
        Self {
            block: Array3::zeros((capacity.max(1), height, width)),
            filled: 0,
            first_frame: 0,
            tile_index: 0,
            crop,
            taps: Vec::new(),
        }
    }

    /// Frames the block holds.
    pub fn capacity(&self) -> usize {
        self.block.shape()[0]
    }

    /// Register a preview tap receiving every `nth_frame` frame.
    pub fn add_tap(&mut self, id: impl Into<String>, nth_frame: usize) -> mpsc::Receiver<PreviewFrame> {
        let (sender, receiver) = mpsc::channel(DEFAULT_TAP_CHANNEL_SIZE);
        self.taps.push(TapConsumer {
            id: id.into(),
            nth_frame: nth_frame.max(1),
            frame_count: 0,
            sender,
        });
        receiver
    }

    /// Start a new tile; any unflushed frames are discarded.
    pub fn begin_tile(&mut self, tile_index: usize) {
        self.tile_index = tile_index;
        self.filled = 0;
        self.first_frame = 0;
    }

    /// Crop `raster` into the next slot. Returns `true` once the block is full.
    pub fn push(&mut self, raster: ArrayView2<'_, u16>) -> AppResult<bool> {
        if self.filled >= self.capacity() {
            return Err(DaqError::Storage(
                "frame block is full; flush before pushing more frames".into(),
            ));
        }
        let (_, height, width) = self.block.dim();
        let rows = self.crop.row_offset..self.crop.row_offset + height;
        let cols = self.crop.col_offset..self.crop.col_offset + width;
        if rows.end > raster.nrows() || cols.end > raster.ncols() {
            return Err(DaqError::Storage(format!(
                "camera raster {}x{} is too small for a {}x{} frame at offset ({}, {})",
                raster.nrows(),
                raster.ncols(),
                height,
                width,
                self.crop.row_offset,
                self.crop.col_offset
            )));
        }
        let cropped = raster.slice(s![rows, cols]);
        self.block.slice_mut(s![self.filled, .., ..]).assign(&cropped);

        let frame = self.first_frame + self.filled;
        self.filled += 1;
        self.notify_taps(frame);
        Ok(self.filled == self.capacity())
    }

    /// Frame number of the first pending frame and the pending frames.
    pub fn pending(&self) -> (usize, ArrayView3<'_, u16>) {
        (self.first_frame, self.block.slice(s![..self.filled, .., ..]))
    }

    /// Mark the pending frames as written.
    pub fn mark_flushed(&mut self) {
        self.first_frame += self.filled;
        self.filled = 0;
    }

    fn notify_taps(&mut self, frame: usize) {
        if self.taps.is_empty() {
            return;
        }
        let slot = self.filled - 1;
        let tile_index = self.tile_index;
        let block = &self.block;
        self.taps.retain_mut(|tap| {
            if !tap.should_deliver() {
                return true;
            }
            let preview = PreviewFrame {
                tile_index,
                frame,
                pixels: block.slice(s![slot, .., ..]).to_owned(),
            };
            match tap.sender.try_send(preview) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Preview tap '{}' is behind, dropping frame {}", tap.id, frame);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Preview tap '{}' closed", tap.id);
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(value: u16) -> Array2<u16> {
        let mut raster = Array2::zeros((8, 10));
        raster.slice_mut(s![2..6, 3..7]).fill(value);
        raster
    }

    #[test]
    fn crop_is_centred() {
        let crop = FrameCrop::centred(10, 4, 2);
        assert_eq!(crop, FrameCrop { row_offset: 2, col_offset: 3 });
    }

    #[test]
    fn fills_flushes_and_continues() {
        let mut ring = FrameRing::new(2, 4, 4, FrameCrop::centred(10, 4, 2));
        ring.begin_tile(5);
        assert!(!ring.push(raster(1).view()).unwrap());
        assert!(ring.push(raster(2).view()).unwrap());
        {
            let (start, block) = ring.pending();
            assert_eq!(start, 0);
            assert_eq!(block.shape(), &[2, 4, 4]);
            assert!(block.slice(s![1, .., ..]).iter().all(|&v| v == 2));
        }
        assert!(ring.push(raster(3).view()).is_err());
        ring.mark_flushed();
        assert!(!ring.push(raster(3).view()).unwrap());
        let (start, block) = ring.pending();
        assert_eq!(start, 2);
        assert_eq!(block.shape()[0], 1);
    }

    #[test]
    fn small_raster_is_rejected() {
        let mut ring = FrameRing::new(2, 4, 4, FrameCrop { row_offset: 6, col_offset: 0 });
        assert!(ring.push(raster(1).view()).is_err());
    }

    #[tokio::test]
    async fn taps_get_every_nth_frame() {
        let mut ring = FrameRing::new(8, 4, 4, FrameCrop::centred(10, 4, 2));
        let mut tap = ring.add_tap("preview", 3);
        ring.begin_tile(1);
        for value in 0..7 {
            ring.push(raster(value).view()).unwrap();
        }
        let mut frames = Vec::new();
        while let Ok(preview) = tap.try_recv() {
            frames.push(preview.frame);
            assert_eq!(preview.tile_index, 1);
            assert_eq!(preview.pixels[[0, 0]], preview.frame as u16);
        }
        assert_eq!(frames, vec![0, 3, 6]);
    }

    #[tokio::test]
    async fn slow_tap_drops_instead_of_blocking() {
        let mut ring = FrameRing::new(64, 4, 4, FrameCrop::centred(10, 4, 2));
        let mut tap = ring.add_tap("slow", 1);
        for value in 0..40 {
            ring.push(raster(value).view()).unwrap();
        }
        let mut received = 0;
        while tap.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, DEFAULT_TAP_CHANNEL_SIZE);
    }

    #[test]
    fn closed_tap_is_removed() {
        let mut ring = FrameRing::new(4, 4, 4, FrameCrop::centred(10, 4, 2));
        drop(ring.add_tap("gone", 1));
        ring.push(raster(1).view()).unwrap();
        assert_eq!(ring.taps.len(), 0);
    }
}
