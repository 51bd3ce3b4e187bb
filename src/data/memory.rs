//! In-memory pyramid backend for simulated runs and tests.
//!
//! Clones share the same arrays, so a test can keep one handle while the sequencer
//! owns another. Quantized setups run every written block through the codec's
//! software model, so readers see the same loss they would get from the filter.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{s, Array3, ArrayView3, Axis};
use parking_lot::Mutex;

use crate::data::codec::Compression;
use crate::data::pyramid::{PyramidBackend, SetupLayout};
use crate::error::{AppResult, DaqError};

#[derive(Debug)]
struct MemorySetup {
    layout: SetupLayout,
    levels: Vec<Array3<i16>>,
}

/// Pyramid arrays held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPyramid {
    setups: Arc<Mutex<BTreeMap<usize, MemorySetup>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemoryPyramid {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of setups created.
    pub fn setup_count(&self) -> usize {
        self.setups.lock().len()
    }

    /// Number of flushes requested.
    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }

    /// Copy of one level of one setup.
    pub fn level(&self, tile: usize, level: usize) -> Option<Array3<i16>> {
        self.setups
            .lock()
            .get(&tile)
            .and_then(|setup| setup.levels.get(level).cloned())
    }

    /// Layout a setup was created with.
    pub fn layout(&self, tile: usize) -> Option<SetupLayout> {
        self.setups.lock().get(&tile).map(|setup| setup.layout.clone())
    }
}

impl PyramidBackend for MemoryPyramid {
    fn existing_shapes(&self, tile: usize) -> AppResult<Option<Vec<[usize; 3]>>> {
        Ok(self.setups.lock().get(&tile).map(|setup| setup.layout.shapes()))
    }

    fn create_setup(&mut self, layout: &SetupLayout) -> AppResult<()> {
        let levels = layout
            .levels
            .iter()
            .map(|level| Array3::zeros(level.shape))
            .collect();
        self.setups.lock().insert(
            layout.tile,
            MemorySetup {
                layout: layout.clone(),
                levels,
            },
        );
        Ok(())
    }

    fn write_block(
        &mut self,
        tile: usize,
        level: usize,
        offset: usize,
        block: ArrayView3<'_, i16>,
    ) -> AppResult<()> {
        let mut setups = self.setups.lock();
        let setup = setups.get_mut(&tile).ok_or(DaqError::UnknownTile(tile))?;
        let compression = setup.layout.compression;
        let target = setup.levels.get_mut(level).ok_or_else(|| {
            DaqError::Storage(format!("tile {} has no resolution level {}", tile, level))
        })?;
        let end = offset + block.len_of(Axis(0));
        if end > target.len_of(Axis(0)) {
            return Err(DaqError::DatasetBounds {
                tile,
                start: offset,
                end,
                capacity: target.len_of(Axis(0)),
            });
        }
        let mut region = target.slice_mut(s![offset..end, .., ..]);
        match compression {
            Compression::None => region.assign(&block),
            Compression::Quantized(codec) => {
                region.zip_mut_with(&block, |stored, &raw| {
                    *stored = codec.round_trip(raw as u16) as i16;
                });
            }
        }
        Ok(())
    }

    fn read_block(&self, tile: usize, level: usize, frames: Range<usize>) -> AppResult<Array3<i16>> {
        let setups = self.setups.lock();
        let setup = setups.get(&tile).ok_or(DaqError::UnknownTile(tile))?;
        let data = setup.levels.get(level).ok_or_else(|| {
            DaqError::Storage(format!("tile {} has no resolution level {}", tile, level))
        })?;
        Ok(data.slice(s![frames, .., ..]).to_owned())
    }

    fn flush(&mut self) -> AppResult<()> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}
