//! Multi-resolution pyramid store.
//!
//! Every dataset index ("setup") owns one array per resolution level. Level `l`
//! halves every axis `l` times (`ceil(dim / 2^l)`), is chunked like level 0 (clamped
//! to its shape) and stores camera counts as `int16` bit patterns. Blocks arrive in
//! frame order; each write lands at level 0 as-is and at coarser levels after
//! cumulative 2x2x2 mean downsampling, at `floor(start / 2^l)`.
//!
//! The layout is backend-independent; [`PyramidBackend`] implementations decide
//! where the arrays live (memory for tests and dry runs, HDF5 on disk).

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{s, Array3, ArrayView3, Axis};
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::data::codec::{CodecEnvironmentGuard, Compression, QuantizingCodec};
use crate::error::{AppResult, DaqError};
use crate::scan::geometry::{ChunkShape, VolumeGeometry};

/// Shape and chunking of one resolution level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSpec {
    /// Downsampling factor along every axis.
    pub factor: usize,
    /// Array shape (frames, rows, columns).
    pub shape: [usize; 3],
    /// Chunk shape, never larger than `shape`.
    pub chunk: [usize; 3],
}

/// Everything a backend needs to create one setup.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupLayout {
    /// Dataset index.
    pub tile: usize,
    /// Levels, finest first.
    pub levels: Vec<LevelSpec>,
    /// Storage filter.
    pub compression: Compression,
}

impl SetupLayout {
    /// Rows of the `resolutions` descriptor.
    pub fn resolutions(&self) -> Vec<[f64; 3]> {
        self.levels
            .iter()
            .map(|l| [l.factor as f64; 3])
            .collect()
    }

    /// Rows of the `subdivisions` descriptor.
    pub fn subdivisions(&self) -> Vec<[u32; 3]> {
        self.levels
            .iter()
            .map(|l| l.chunk.map(|c| c as u32))
            .collect()
    }

    /// Level shapes, finest first.
    pub fn shapes(&self) -> Vec<[usize; 3]> {
        self.levels.iter().map(|l| l.shape).collect()
    }
}

/// Layout of a whole acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidSpec {
    /// Frames per tile.
    pub frames: usize,
    /// Stored frame height.
    pub height: usize,
    /// Stored frame width.
    pub width: usize,
    /// Resolution levels.
    pub levels: usize,
    /// Level-0 chunking.
    pub chunk: ChunkShape,
    /// Compression per dataset index.
    pub compression: Vec<Compression>,
}

impl PyramidSpec {
    /// Layout for `geometry`; tiles inherit their wavelength's codec.
    pub fn from_config(config: &ScanConfig, geometry: &VolumeGeometry) -> Self {
        let per_channel = geometry.tiles_per_channel();
        let compression = config
            .channels
            .iter()
            .flat_map(|channel| {
                let compression = match channel.quant_sigma {
                    Some(sigma) => {
                        Compression::Quantized(QuantizingCodec::new(sigma, &config.storage.codec))
                    }
                    None => Compression::None,
                };
                std::iter::repeat(compression).take(per_channel)
            })
            .collect();
        Self {
            frames: geometry.frames_per_tile,
            height: geometry.frame_height,
            width: geometry.frame_width,
            levels: config.storage.resolution_levels,
            chunk: geometry.chunk,
            compression,
        }
    }

    /// Number of setups.
    pub fn tile_count(&self) -> usize {
        self.compression.len()
    }

    /// Layout of setup `tile`.
    pub fn setup_layout(&self, tile: usize) -> SetupLayout {
        let dims = [self.frames, self.height, self.width];
        let levels = (0..self.levels.max(1))
            .map(|level| {
                let factor = 1usize << level;
                let shape = dims.map(|d| d.div_ceil(factor));
                let mut chunk = self.chunk.0;
                for axis in 0..3 {
                    chunk[axis] = chunk[axis].min(shape[axis]).max(1);
                }
                LevelSpec {
                    factor,
                    shape,
                    chunk,
                }
            })
            .collect();
        SetupLayout {
            tile,
            levels,
            compression: self
                .compression
                .get(tile)
                .copied()
                .unwrap_or(Compression::None),
        }
    }

    /// Frame multiple every write except a tile's last must start and end on, so
    /// each coarse level receives whole downsampled frames.
    pub fn frame_alignment(&self) -> usize {
        1 << (self.levels.max(1) - 1)
    }

    /// True when any tile is stored through the quantizing codec.
    pub fn uses_codec(&self) -> bool {
        self.compression
            .iter()
            .any(|c| matches!(c, Compression::Quantized(_)))
    }
}

/// Where pyramid arrays live.
pub trait PyramidBackend: Send {
    /// Level shapes of an existing setup, if there is one.
    fn existing_shapes(&self, tile: usize) -> AppResult<Option<Vec<[usize; 3]>>>;

    /// Create a setup with its descriptors and empty level arrays.
    fn create_setup(&mut self, layout: &SetupLayout) -> AppResult<()>;

    /// Write `block` into `level` of `tile` starting at frame `offset`.
    fn write_block(
        &mut self,
        tile: usize,
        level: usize,
        offset: usize,
        block: ArrayView3<'_, i16>,
    ) -> AppResult<()>;

    /// Read frames `frames` of `level` of `tile`.
    fn read_block(&self, tile: usize, level: usize, frames: Range<usize>) -> AppResult<Array3<i16>>;

    /// Make written data durable.
    fn flush(&mut self) -> AppResult<()>;
}

#[derive(Debug, Clone)]
struct TileState {
    shapes: Vec<[usize; 3]>,
    written: usize,
}

/// Pyramid layout bookkeeping on top of a backend.
pub struct PyramidStore<B> {
    backend: B,
    tiles: BTreeMap<usize, TileState>,
}

impl<B: PyramidBackend> PyramidStore<B> {
    /// Store over `backend`; nothing is created until [`initialize`](Self::initialize).
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tiles: BTreeMap::new(),
        }
    }

    /// The backend, for inspection.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Create every setup of `spec`. Existing setups with the same layout are kept
    /// untouched, so calling this twice is harmless.
    pub fn initialize(&mut self, spec: &PyramidSpec, guard: &CodecEnvironmentGuard) -> AppResult<()> {
        if spec.uses_codec() {
            guard.check()?;
        }
        let mut created = 0;
        for tile in 0..spec.tile_count() {
            let layout = spec.setup_layout(tile);
            let shapes = layout.shapes();
            match self.backend.existing_shapes(tile)? {
                Some(existing) if existing == shapes => {
                    debug!("Setup {} already present, leaving it untouched", tile);
                }
                Some(existing) => {
                    return Err(DaqError::LayoutMismatch {
                        tile,
                        detail: format!("expected level shapes {:?}, found {:?}", shapes, existing),
                    });
                }
                None => {
                    self.backend.create_setup(&layout)?;
                    created += 1;
                }
            }
            self.tiles
                .entry(tile)
                .or_insert(TileState { shapes, written: 0 });
        }
        info!(
            "Pyramid ready: {} setups ({} new), {} levels of {}x{}x{}",
            spec.tile_count(),
            created,
            spec.levels,
            spec.frames,
            spec.height,
            spec.width
        );
        Ok(())
    }

    /// Write frames `start..end` of `tile` to every level.
    pub fn write(
        &mut self,
        tile: usize,
        block: ArrayView3<'_, u16>,
        start: usize,
        end: usize,
    ) -> AppResult<()> {
        let state = self.tiles.get_mut(&tile).ok_or(DaqError::UnknownTile(tile))?;
        if end < start || end - start != block.len_of(Axis(0)) {
            return Err(DaqError::Storage(format!(
                "block of {} frames does not match range {}..{}",
                block.len_of(Axis(0)),
                start,
                end
            )));
        }
        let capacity = state.shapes[0][0];
        if end > capacity {
            return Err(DaqError::DatasetBounds {
                tile,
                start,
                end,
                capacity,
            });
        }
        if start < state.written {
            return Err(DaqError::OutOfOrderWrite {
                tile,
                start,
                written: state.written,
            });
        }
        if start == end {
            return Ok(());
        }
        let alignment = 1usize << (state.shapes.len() - 1);
        if start % alignment != 0 || (end % alignment != 0 && end != capacity) {
            return Err(DaqError::Storage(format!(
                "frames {}..{} of tile {} are not aligned to the {} frames one level-{} frame covers",
                start,
                end,
                tile,
                alignment,
                state.shapes.len() - 1
            )));
        }

        let mut current = block.to_owned();
        for (level, shape) in state.shapes.iter().enumerate() {
            if level > 0 {
                current = downsample_mean(current.view());
            }
            let offset = start >> level;
            let take = current.len_of(Axis(0)).min(shape[0].saturating_sub(offset));
            if take == 0 {
                continue;
            }
            let stored = current.slice(s![..take, .., ..]).mapv(|v| v as i16);
            self.backend.write_block(tile, level, offset, stored.view())?;
        }
        state.written = end;
        Ok(())
    }

    /// Read frames of one level as stored.
    pub fn read(&self, tile: usize, level: usize, frames: Range<usize>) -> AppResult<Array3<i16>> {
        let state = self.tiles.get(&tile).ok_or(DaqError::UnknownTile(tile))?;
        let shape = state.shapes.get(level).ok_or_else(|| {
            DaqError::Storage(format!("tile {} has no resolution level {}", tile, level))
        })?;
        if frames.end > shape[0] || frames.start > frames.end {
            return Err(DaqError::DatasetBounds {
                tile,
                start: frames.start,
                end: frames.end,
                capacity: shape[0],
            });
        }
        self.backend.read_block(tile, level, frames)
    }

    /// Read frames of one level as camera counts.
    pub fn read_counts(&self, tile: usize, level: usize, frames: Range<usize>) -> AppResult<Array3<u16>> {
        Ok(self.read(tile, level, frames)?.mapv(|v| v as u16))
    }

    /// Frames written so far for `tile`.
    pub fn frames_written(&self, tile: usize) -> usize {
        self.tiles.get(&tile).map_or(0, |s| s.written)
    }

    /// Flush the backend.
    pub fn flush(&mut self) -> AppResult<()> {
        self.backend.flush()
    }
}

/// Halve every axis, averaging each 2x2x2 neighbourhood over the samples it has.
pub fn downsample_mean(block: ArrayView3<'_, u16>) -> Array3<u16> {
    let (frames, rows, cols) = block.dim();
    let out_shape = (frames.div_ceil(2), rows.div_ceil(2), cols.div_ceil(2));
    Array3::from_shape_fn(out_shape, |(f, r, c)| {
        let window = block.slice(s![
            2 * f..(2 * f + 2).min(frames),
            2 * r..(2 * r + 2).min(rows),
            2 * c..(2 * c + 2).min(cols)
        ]);
        let sum: u32 = window.iter().map(|&v| u32::from(v)).sum();
        (sum / window.len() as u32) as u16
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::data::memory::MemoryPyramid;

    fn spec(frames: usize, levels: usize, compression: Vec<Compression>) -> PyramidSpec {
        PyramidSpec {
            frames,
            height: 6,
            width: 10,
            levels,
            chunk: ChunkShape([4, 2, 4]),
            compression,
        }
    }

    fn no_guard() -> CodecEnvironmentGuard {
        CodecEnvironmentGuard::new(&CodecConfig::default(), false)
    }

    fn ramp(frames: usize, base: usize) -> Array3<u16> {
        Array3::from_shape_fn((frames, 6, 10), |(f, r, c)| {
            ((base + f) * 1000 + r * 10 + c) as u16
        })
    }

    #[test]
    fn level_shapes_round_up() {
        let layout = spec(13, 4, vec![Compression::None]).setup_layout(0);
        assert_eq!(
            layout.shapes(),
            vec![[13, 6, 10], [7, 3, 5], [4, 2, 3], [2, 1, 2]]
        );
        assert_eq!(layout.resolutions()[3], [8.0, 8.0, 8.0]);
        assert_eq!(layout.subdivisions()[3], [2, 1, 2]);
    }

    #[test]
    fn downsample_averages_available_samples() {
        let block = Array3::from_shape_fn((3, 2, 2), |(f, _, _)| (f as u16 + 1) * 10);
        let half = downsample_mean(block.view());
        assert_eq!(half.dim(), (2, 1, 1));
        assert_eq!(half[[0, 0, 0]], 15);
        assert_eq!(half[[1, 0, 0]], 30);
    }

    #[test]
    fn lossless_round_trip_at_full_resolution() {
        let mut store = PyramidStore::new(MemoryPyramid::new());
        store
            .initialize(&spec(12, 3, vec![Compression::None; 2]), &no_guard())
            .unwrap();
        let first = ramp(8, 0);
        let second = ramp(4, 8);
        store.write(1, first.view(), 0, 8).unwrap();
        store.write(1, second.view(), 8, 12).unwrap();

        let read = store.read_counts(1, 0, 0..12).unwrap();
        assert_eq!(read.slice(s![..8, .., ..]), first);
        assert_eq!(read.slice(s![8.., .., ..]), second);
        assert_eq!(store.frames_written(1), 12);
        assert_eq!(store.frames_written(0), 0);
    }

    #[test]
    fn coarse_levels_land_at_scaled_offsets() {
        let mut store = PyramidStore::new(MemoryPyramid::new());
        store
            .initialize(&spec(16, 3, vec![Compression::None]), &no_guard())
            .unwrap();
        let whole = ramp(16, 0);
        store.write(0, whole.slice(s![..8, .., ..]), 0, 8).unwrap();
        store.write(0, whole.slice(s![8.., .., ..]), 8, 16).unwrap();

        let expected_1 = downsample_mean(whole.view());
        let expected_2 = downsample_mean(expected_1.view());
        assert_eq!(store.read_counts(0, 1, 0..8).unwrap(), expected_1);
        assert_eq!(store.read_counts(0, 2, 0..4).unwrap(), expected_2);
    }

    #[test]
    fn misaligned_blocks_are_rejected() {
        let mut store = PyramidStore::new(MemoryPyramid::new());
        let layout = spec(12, 3, vec![Compression::None]);
        assert_eq!(layout.frame_alignment(), 4);
        store.initialize(&layout, &no_guard()).unwrap();
        let whole = ramp(12, 0);
        // six-frame blocks would put the second block's level-2 frame at 6 >> 2 = 1,
        // on top of frames averaged from the first block
        let err = store.write(0, whole.slice(s![..6, .., ..]), 0, 6).unwrap_err();
        assert!(err.to_string().contains("not aligned"));
        assert_eq!(store.frames_written(0), 0);

        store.write(0, whole.slice(s![..8, .., ..]), 0, 8).unwrap();
        // the tile's last block may be short
        store.write(0, whole.slice(s![8.., .., ..]), 8, 12).unwrap();
        let expected_1 = downsample_mean(whole.view());
        let expected_2 = downsample_mean(expected_1.view());
        assert_eq!(store.read_counts(0, 2, 0..3).unwrap(), expected_2);
    }

    #[test]
    fn bit_patterns_above_i16_survive() {
        let mut store = PyramidStore::new(MemoryPyramid::new());
        store
            .initialize(&spec(2, 1, vec![Compression::None]), &no_guard())
            .unwrap();
        let block = Array3::from_elem((2, 6, 10), 65_000u16);
        store.write(0, block.view(), 0, 2).unwrap();
        assert_eq!(store.read(0, 0, 0..1).unwrap()[[0, 0, 0]], 65_000u16 as i16);
        assert_eq!(store.read_counts(0, 0, 0..2).unwrap(), block);
    }

    #[test]
    fn initialize_is_idempotent() {
        let backend = MemoryPyramid::new();
        let handle = backend.clone();
        let layout = spec(8, 2, vec![Compression::None; 3]);
        let mut store = PyramidStore::new(backend.clone());
        store.initialize(&layout, &no_guard()).unwrap();
        store.write(2, ramp(4, 0).view(), 0, 4).unwrap();

        let mut again = PyramidStore::new(backend);
        again.initialize(&layout, &no_guard()).unwrap();
        assert_eq!(handle.setup_count(), 3);
        assert_eq!(again.read_counts(2, 0, 0..4).unwrap(), ramp(4, 0));
    }

    #[test]
    fn different_layout_for_existing_setup_is_rejected() {
        let backend = MemoryPyramid::new();
        let mut store = PyramidStore::new(backend.clone());
        store
            .initialize(&spec(8, 2, vec![Compression::None]), &no_guard())
            .unwrap();
        let mut other = PyramidStore::new(backend);
        let err = other
            .initialize(&spec(9, 2, vec![Compression::None]), &no_guard())
            .unwrap_err();
        assert!(matches!(err, DaqError::LayoutMismatch { tile: 0, .. }));
    }

    #[test]
    fn overflow_and_reordering_are_rejected() {
        let mut store = PyramidStore::new(MemoryPyramid::new());
        store
            .initialize(&spec(8, 2, vec![Compression::None]), &no_guard())
            .unwrap();
        let err = store.write(0, ramp(4, 0).view(), 6, 10).unwrap_err();
        assert!(matches!(err, DaqError::DatasetBounds { capacity: 8, .. }));

        store.write(0, ramp(4, 0).view(), 0, 4).unwrap();
        let err = store.write(0, ramp(2, 0).view(), 2, 4).unwrap_err();
        assert!(matches!(err, DaqError::OutOfOrderWrite { written: 4, .. }));

        assert!(matches!(
            store.write(5, ramp(1, 0).view(), 0, 1),
            Err(DaqError::UnknownTile(5))
        ));
    }

    #[test]
    fn quantized_tiles_stay_within_noise_bound() {
        let codec = QuantizingCodec::new(1.0, &CodecConfig::default());
        let mut store = PyramidStore::new(MemoryPyramid::new());
        store
            .initialize(&spec(4, 1, vec![Compression::Quantized(codec)]), &no_guard())
            .unwrap();
        let block = ramp(4, 3);
        store.write(0, block.view(), 0, 4).unwrap();
        let read = store.read_counts(0, 0, 0..4).unwrap();
        for (&original, &restored) in block.iter().zip(read.iter()) {
            let error = (f64::from(original) - f64::from(restored)).abs();
            assert!(error <= codec.noise_dn(original) + 1.0);
        }
    }

    #[test]
    fn pyramid_layout_assigns_codec_by_wavelength() {
        let mut config = crate::config::tests::sample_config();
        config.channels[1].quant_sigma = Some(2.0);
        let geometry = VolumeGeometry::compute(
            &crate::scan::geometry::GeometryInput::from_config(&config),
        )
        .unwrap();
        let spec = PyramidSpec::from_config(&config, &geometry);
        let per_channel = geometry.tiles_per_channel();
        assert_eq!(spec.tile_count(), 2 * per_channel);
        assert_eq!(spec.compression[per_channel - 1], Compression::None);
        assert!(matches!(
            spec.compression[per_channel],
            Compression::Quantized(QuantizingCodec { sigma, .. }) if sigma == 2.0
        ));
    }
}
