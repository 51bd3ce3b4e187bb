//! Multi-well puck acquisitions.
//!
//! A puck holds wells on a square grid, numbered row by row starting at 1 in the
//! top-left corner. The configured ROI describes well 1; every other well is the same
//! region moved by whole grid steps (rows advance along +X, columns along -Y).

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::scan::geometry::RegionOfInterest;

fn default_pitch() -> f64 {
    8.0
}

fn default_columns() -> u32 {
    3
}

fn default_capacity() -> u32 {
    12
}

/// Which wells to scan and the puck grid they sit on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellSelection {
    /// Wells to scan, in order (1-based).
    pub numbers: Vec<u32>,
    /// Grid pitch (mm).
    #[serde(default = "default_pitch")]
    pub pitch_mm: f64,
    /// Wells per row.
    #[serde(default = "default_columns")]
    pub columns: u32,
    /// Wells on the puck.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

impl WellSelection {
    /// Reject unknown wells and degenerate grids.
    pub fn validate(&self) -> AppResult<()> {
        if self.columns == 0 || self.pitch_mm <= 0.0 {
            return Err(DaqError::Configuration(
                "well grid needs at least one column and a positive pitch".into(),
            ));
        }
        if self.numbers.is_empty() {
            return Err(DaqError::Configuration("no wells selected".into()));
        }
        if let Some(bad) = self
            .numbers
            .iter()
            .find(|&&n| n == 0 || n > self.capacity)
        {
            return Err(DaqError::Configuration(format!(
                "well {} does not exist on a {}-well puck",
                bad, self.capacity
            )));
        }
        Ok(())
    }

    /// ROI of well `number`, given the ROI of well 1.
    pub fn roi_for(&self, number: u32, first_well: &RegionOfInterest) -> RegionOfInterest {
        let row = (number - 1) / self.columns;
        let column = (number - 1) % self.columns;
        RegionOfInterest {
            x: first_well.x.shifted(self.pitch_mm * row as f64),
            y: first_well.y.shifted(-self.pitch_mm * column as f64),
            z: first_well.z,
        }
    }

    /// Output sub-directory name for well `number`.
    pub fn directory_name(number: u32) -> String {
        format!("well_{:02}", number)
    }
}
