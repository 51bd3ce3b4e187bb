//! Volume geometry: tile counts, stage offsets, scan speed and chunk sizing.
//!
//! The scan axis (X) is swept continuously by the stage while the camera streams
//! frames; Y and Z are covered by a grid of tiles whose footprint is derived from the
//! camera frame and the requested overlap. Everything here is computed once per
//! acquisition and never changes while a scan runs.

use serde::{Deserialize, Serialize};

use crate::config::ScanConfig;
use crate::error::{AppResult, DaqError};

/// Fixed per-frame dead time of the camera in milliseconds.
pub const FRAME_DEAD_TIME_MS: f64 = 0.01;

/// Default chunk target along (frames, rows, columns).
pub const DEFAULT_CHUNK: [usize; 3] = [256, 16, 256];

/// Inclusive physical extent of one axis, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// Lower bound (mm).
    pub min: f64,
    /// Upper bound (mm).
    pub max: f64,
}

impl AxisRange {
    /// Create a range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Requested span (mm).
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// The same range moved by `delta` mm.
    pub fn shifted(&self, delta: f64) -> Self {
        Self::new(self.min + delta, self.max + delta)
    }
}

/// Region of interest in stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// Scan axis.
    pub x: AxisRange,
    /// Lateral tiling axis.
    pub y: AxisRange,
    /// Depth tiling axis.
    pub z: AxisRange,
}

impl RegionOfInterest {
    fn validate(&self) -> AppResult<()> {
        for (axis, range) in [('x', self.x), ('y', self.y), ('z', self.z)] {
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(DaqError::InvalidRoi {
                    axis,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        if self.x.min == self.x.max {
            return Err(DaqError::InvalidRoi {
                axis: 'x',
                min: self.x.min,
                max: self.x.max,
            });
        }
        Ok(())
    }
}

/// Everything the geometry depends on, gathered from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryInput {
    /// Requested region.
    pub roi: RegionOfInterest,
    /// Frame spacing along the scan axis (um).
    pub x_sampling_um: f64,
    /// Camera pixel sampling at the sample (um).
    pub pixel_um: f64,
    /// Stored frame width (px), along Y.
    pub frame_width: usize,
    /// Stored frame height (px), along the tilted depth direction.
    pub frame_height: usize,
    /// Lateral tile overlap (px).
    pub overlap_y_px: f64,
    /// Depth tile overlap (px).
    pub overlap_z_px: f64,
    /// Light-sheet angle (degrees).
    pub theta_deg: f64,
    /// Camera exposure (ms).
    pub exposure_ms: f64,
    /// Chunk target along (frames, rows, columns).
    pub chunk_target: [usize; 3],
}

impl GeometryInput {
    /// Gather geometry inputs from a validated configuration.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            roi: config.experiment.roi,
            x_sampling_um: config.experiment.x_sampling_um,
            pixel_um: config.camera.pixel_size_um,
            frame_width: config.camera.frame_width,
            frame_height: config.camera.frame_height,
            overlap_y_px: config.experiment.overlap_y_px,
            overlap_z_px: config.experiment.overlap_z_px,
            theta_deg: config.experiment.theta_deg,
            exposure_ms: config.camera.exposure_ms,
            chunk_target: config.storage.chunk,
        }
    }

    /// Lateral tile footprint (mm).
    pub fn y_tile_width(&self) -> f64 {
        (self.frame_width as f64 - self.overlap_y_px) * self.pixel_um / 1000.0
    }

    /// Depth tile footprint (mm), projected through the sheet angle.
    pub fn z_tile_width(&self) -> f64 {
        let projected = self.frame_height as f64 * self.theta_deg.to_radians().cos();
        (projected - self.overlap_z_px) * self.pixel_um / 1000.0
    }
}

/// Chunk sizes along (frames, rows, columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkShape(pub [usize; 3]);

impl ChunkShape {
    /// Cap each target to one eighth of its axis, never below one element.
    pub fn capped(target: [usize; 3], dims: [usize; 3]) -> Self {
        let mut chunk = [0; 3];
        for axis in 0..3 {
            chunk[axis] = if target[axis] * 8 >= dims[axis] {
                (dims[axis] / 8).max(1)
            } else {
                target[axis]
            };
        }
        ChunkShape(chunk)
    }

    /// Chunk along the frame axis.
    pub fn frames(&self) -> usize {
        self.0[0]
    }
}

/// Derived layout of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeGeometry {
    /// Scan length (mm).
    pub x_length: f64,
    /// Covered lateral length, a whole number of tiles (mm).
    pub y_length: f64,
    /// Covered depth length, a whole number of tiles (mm).
    pub z_length: f64,
    /// Scan-axis centre (mm).
    pub x_offset: f64,
    /// Lateral centre (mm).
    pub y_offset: f64,
    /// Depth origin (mm).
    pub z_offset: f64,
    /// Lateral tile width (mm).
    pub y_width: f64,
    /// Depth tile width (mm).
    pub z_width: f64,
    /// Lateral tiles per depth plane.
    pub y_tiles: usize,
    /// Depth planes.
    pub z_tiles: usize,
    /// Frames acquired per tile.
    pub frames_per_tile: usize,
    /// Stage speed during the sweep (mm/s).
    pub scan_speed_mm_s: f64,
    /// Storage chunking.
    pub chunk: ChunkShape,
    /// Frames buffered before each store flush.
    pub block_size: usize,
    /// Stored frame width (px).
    pub frame_width: usize,
    /// Stored frame height (px).
    pub frame_height: usize,
    /// Frame period including dead time (ms).
    pub frame_period_ms: f64,
}

/// Number of tiles covering `span`; a zero span still takes one tile.
fn tiles_for(span: f64, width: f64) -> usize {
    if span <= 0.0 {
        return 1;
    }
    // Tolerate float noise so an exact multiple does not spill into an extra tile.
    let tiles = (span / width - 1e-9).ceil();
    (tiles as usize).max(1)
}

impl VolumeGeometry {
    /// Derive the acquisition layout.
    pub fn compute(input: &GeometryInput) -> AppResult<Self> {
        input.roi.validate()?;
        if input.x_sampling_um <= 0.0 || !input.x_sampling_um.is_finite() {
            return Err(DaqError::NonPositiveTileWidth {
                axis: 'x',
                width: input.x_sampling_um / 1000.0,
            });
        }
        let y_width = input.y_tile_width();
        if y_width <= 0.0 || !y_width.is_finite() {
            return Err(DaqError::NonPositiveTileWidth {
                axis: 'y',
                width: y_width,
            });
        }
        let z_width = input.z_tile_width();
        if z_width <= 0.0 || !z_width.is_finite() {
            return Err(DaqError::NonPositiveTileWidth {
                axis: 'z',
                width: z_width,
            });
        }

        let roi = &input.roi;
        let x_length = roi.x.span();
        let y_tiles = tiles_for(roi.y.span(), y_width);
        let z_tiles = tiles_for(roi.z.span(), z_width);
        let y_length = y_tiles as f64 * y_width;
        let z_length = z_tiles as f64 * z_width;

        let frames_per_tile = (x_length / (input.x_sampling_um / 1000.0)).floor() as usize;
        if frames_per_tile == 0 {
            return Err(DaqError::EmptyScan {
                length: x_length,
                spacing_um: input.x_sampling_um,
            });
        }

        let frame_period_ms = input.exposure_ms + FRAME_DEAD_TIME_MS;
        let chunk = ChunkShape::capped(
            input.chunk_target,
            [frames_per_tile, input.frame_height, input.frame_width],
        );

        Ok(Self {
            x_length,
            y_length,
            z_length,
            x_offset: roi.x.max - x_length / 2.0,
            y_offset: roi.y.max - y_length / 2.0,
            z_offset: roi.z.min,
            y_width,
            z_width,
            y_tiles,
            z_tiles,
            frames_per_tile,
            scan_speed_mm_s: input.x_sampling_um / frame_period_ms,
            chunk,
            block_size: 2 * chunk.frames(),
            frame_width: input.frame_width,
            frame_height: input.frame_height,
            frame_period_ms,
        })
    }

    /// Tiles per wavelength.
    pub fn tiles_per_channel(&self) -> usize {
        self.y_tiles * self.z_tiles
    }

    /// Stage Z for depth plane `j` (mm).
    pub fn depth_position(&self, j: usize) -> f64 {
        self.z_offset + j as f64 * self.z_width
    }

    /// Stage Y for lateral tile `k` (mm), the centre of the tile.
    pub fn lateral_position(&self, k: usize) -> f64 {
        self.y_offset - self.y_length / 2.0 + k as f64 * self.y_width + self.y_width / 2.0
    }

    /// Start and end of the stage sweep along X (mm).
    pub fn scan_sweep(&self) -> (f64, f64) {
        let start = self.x_offset - self.x_length / 2.0;
        (start, start + self.x_length)
    }

    /// Nominal duration of one tile's sweep (s).
    pub fn sweep_duration_s(&self) -> f64 {
        self.frames_per_tile as f64 * self.frame_period_ms / 1000.0
    }
}
