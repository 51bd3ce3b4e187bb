//! Iteration order of the nested scan loop and the dataset index of each tile.
//!
//! Depth planes are the outer loop, lateral tiles the middle loop and wavelengths the
//! inner loop, so the filter wheel and laser change most often and the slow Z axis
//! least often. Tile indices group every tile of one wavelength together.

use crate::scan::geometry::VolumeGeometry;

/// Dataset index of a tile.
pub fn tile_index(lateral_counter: usize, y_tiles: usize, z_tiles: usize, wavelength: usize) -> usize {
    lateral_counter + z_tiles * y_tiles * wavelength
}

/// One (depth, lateral, wavelength) step of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStep {
    /// Position in the overall sequence, from 0.
    pub ordinal: usize,
    /// Depth plane.
    pub depth_plane: usize,
    /// Lateral tile within the plane.
    pub lateral_tile: usize,
    /// Wavelength ordinal.
    pub wavelength: usize,
    /// Dataset index.
    pub tile_index: usize,
}

/// All steps of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    y_tiles: usize,
    z_tiles: usize,
    wavelengths: usize,
}

impl TilePlan {
    /// Plan for `geometry` with `wavelengths` channels.
    pub fn new(geometry: &VolumeGeometry, wavelengths: usize) -> Self {
        Self::from_counts(geometry.y_tiles, geometry.z_tiles, wavelengths)
    }

    /// Plan from raw tile counts.
    pub fn from_counts(y_tiles: usize, z_tiles: usize, wavelengths: usize) -> Self {
        Self {
            y_tiles,
            z_tiles,
            wavelengths,
        }
    }

    /// Total tiles, over every wavelength.
    pub fn len(&self) -> usize {
        self.y_tiles * self.z_tiles * self.wavelengths
    }

    /// True when there is nothing to acquire.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steps in acquisition order.
    pub fn steps(&self) -> impl Iterator<Item = TileStep> + '_ {
        let plan = *self;
        (0..plan.z_tiles)
            .flat_map(move |j| (0..plan.y_tiles).map(move |k| (j, k)))
            .flat_map(move |(j, k)| (0..plan.wavelengths).map(move |ch| (j, k, ch)))
            .enumerate()
            .map(move |(ordinal, (j, k, ch))| TileStep {
                ordinal,
                depth_plane: j,
                lateral_tile: k,
                wavelength: ch,
                tile_index: tile_index(j * plan.y_tiles + k, plan.y_tiles, plan.z_tiles, ch),
            })
    }

    /// Tiles still to acquire after `step`.
    pub fn remaining_after(&self, step: &TileStep) -> usize {
        self.len() - step.ordinal - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn wavelengths_get_disjoint_index_ranges() {
        let plan = TilePlan::from_counts(3, 2, 2);
        let first: BTreeSet<_> = plan
            .steps()
            .filter(|s| s.wavelength == 0)
            .map(|s| s.tile_index)
            .collect();
        let second: BTreeSet<_> = plan
            .steps()
            .filter(|s| s.wavelength == 1)
            .map(|s| s.tile_index)
            .collect();
        assert_eq!(first, (0..6).collect());
        assert_eq!(second, (6..12).collect());
    }

    #[test]
    fn depth_is_outer_and_wavelength_inner() {
        let plan = TilePlan::from_counts(2, 2, 2);
        let order: Vec<_> = plan
            .steps()
            .map(|s| (s.depth_plane, s.lateral_tile, s.wavelength))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (0, 1, 1),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (1, 1, 1),
            ]
        );
    }

    #[test]
    fn indices_are_a_permutation() {
        let plan = TilePlan::from_counts(4, 3, 3);
        let indices: BTreeSet<_> = plan.steps().map(|s| s.tile_index).collect();
        assert_eq!(indices.len(), plan.len());
        assert_eq!(indices, (0..plan.len()).collect());
    }

    #[test]
    fn remaining_counts_down_to_zero() {
        let plan = TilePlan::from_counts(2, 1, 2);
        let remaining: Vec<_> = plan.steps().map(|s| plan.remaining_after(&s)).collect();
        assert_eq!(remaining, vec![3, 2, 1, 0]);
    }
}
