//! HDF5 pyramid backend in the BigDataViewer layout.
//!
//! ```text
//! /sNN/resolutions           f64 [levels x 3]   downsampling factors
//! /sNN/subdivisions          u32 [levels x 3]   chunk shapes
//! /t00000/sNN/L/cells        i16 [frames x rows x columns]
//! ```
//!
//! Quantized setups attach filter 32016 to every `cells` dataset; the plugin must be
//! discoverable by the HDF5 library at runtime.

use std::ops::Range;
use std::path::{Path, PathBuf};

use hdf5::File;
use ndarray::{Array2, Array3, ArrayView3, Axis, Ix3};
use tracing::{debug, info};

use crate::data::codec::QUANTIZING_FILTER_ID;
use crate::data::pyramid::{PyramidBackend, SetupLayout};
use crate::error::{AppResult, DaqError};

trait StorageContext<T> {
    fn storage(self, what: impl FnOnce() -> String) -> AppResult<T>;
}

impl<T> StorageContext<T> for hdf5::Result<T> {
    fn storage(self, what: impl FnOnce() -> String) -> AppResult<T> {
        self.map_err(|e| DaqError::Storage(format!("{}: {}", what(), e)))
    }
}

fn setup_group(tile: usize) -> String {
    format!("s{:02}", tile)
}

fn cells_path(tile: usize, level: usize) -> String {
    format!("t00000/s{:02}/{}/cells", tile, level)
}

/// Pyramid arrays in one HDF5 file.
pub struct Hdf5Pyramid {
    path: PathBuf,
    file: File,
}

impl std::fmt::Debug for Hdf5Pyramid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hdf5Pyramid").field("path", &self.path).finish()
    }
}

impl Hdf5Pyramid {
    /// Open `path` for writing, creating it if needed. Existing setups are kept.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = File::append(path).storage(|| format!("opening {}", path.display()))?;
        info!("Opened pyramid file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl PyramidBackend for Hdf5Pyramid {
    fn existing_shapes(&self, tile: usize) -> AppResult<Option<Vec<[usize; 3]>>> {
        let group = match self.file.group(&setup_group(tile)) {
            Ok(group) => group,
            Err(_) => return Ok(None),
        };
        let levels = group
            .dataset("resolutions")
            .storage(|| format!("setup {} has no resolutions", tile))?
            .shape()
            .first()
            .copied()
            .unwrap_or(0);
        let mut shapes = Vec::with_capacity(levels);
        for level in 0..levels {
            let shape = self
                .file
                .dataset(&cells_path(tile, level))
                .storage(|| format!("setup {} level {}", tile, level))?
                .shape();
            if shape.len() != 3 {
                return Err(DaqError::LayoutMismatch {
                    tile,
                    detail: format!("level {} has rank {}", level, shape.len()),
                });
            }
            shapes.push([shape[0], shape[1], shape[2]]);
        }
        Ok(Some(shapes))
    }

    fn create_setup(&mut self, layout: &SetupLayout) -> AppResult<()> {
        let tile = layout.tile;
        let group = self
            .file
            .create_group(&setup_group(tile))
            .storage(|| format!("creating setup {}", tile))?;
        group
            .new_dataset_builder()
            .with_data(&Array2::from(layout.resolutions()))
            .create("resolutions")
            .storage(|| format!("writing resolutions of setup {}", tile))?;
        group
            .new_dataset_builder()
            .with_data(&Array2::from(layout.subdivisions()))
            .create("subdivisions")
            .storage(|| format!("writing subdivisions of setup {}", tile))?;

        let timepoint = match self.file.group("t00000") {
            Ok(group) => group,
            Err(_) => self
                .file
                .create_group("t00000")
                .storage(|| "creating timepoint group".to_string())?,
        };
        let setup = timepoint
            .create_group(&setup_group(tile))
            .storage(|| format!("creating timepoint setup {}", tile))?;

        for (index, level) in layout.levels.iter().enumerate() {
            let group = setup
                .create_group(&index.to_string())
                .storage(|| format!("creating level {} of setup {}", index, tile))?;
            let [c0, c1, c2] = level.chunk;
            let [s0, s1, s2] = level.shape;
            let mut builder = group.new_dataset::<i16>().chunk((c0, c1, c2));
            if let Some(codec) = layout.compression.codec() {
                builder = builder.add_filter(QUANTIZING_FILTER_ID as _, &codec.filter_params());
            }
            builder
                .shape((s0, s1, s2))
                .create("cells")
                .storage(|| format!("creating cells of setup {} level {}", tile, index))?;
        }
        debug!("Created setup {} with {} levels", tile, layout.levels.len());
        Ok(())
    }

    fn write_block(
        &mut self,
        tile: usize,
        level: usize,
        offset: usize,
        block: ArrayView3<'_, i16>,
    ) -> AppResult<()> {
        let end = offset + block.len_of(Axis(0));
        self.file
            .dataset(&cells_path(tile, level))
            .storage(|| format!("setup {} level {}", tile, level))?
            .write_slice(&block, hdf5::s![offset..end, .., ..])
            .storage(|| format!("writing frames {}..{} of setup {} level {}", offset, end, tile, level))
    }

    fn read_block(&self, tile: usize, level: usize, frames: Range<usize>) -> AppResult<Array3<i16>> {
        self.file
            .dataset(&cells_path(tile, level))
            .storage(|| format!("setup {} level {}", tile, level))?
            .read_slice::<i16, _, Ix3>(hdf5::s![frames.clone(), .., ..])
            .storage(|| format!("reading frames {:?} of setup {} level {}", frames, tile, level))
    }

    fn flush(&mut self) -> AppResult<()> {
        self.file
            .flush()
            .storage(|| format!("flushing {}", self.path.display()))
    }
}
