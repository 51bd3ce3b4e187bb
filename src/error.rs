//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type returned by every library operation. It is
//! built with `thiserror` and grouped the way the scan treats failures:
//!
//! - **Precondition violations** (`InvalidRoi`, `NonPositiveTileWidth`, `EmptyScan`,
//!   `LaserDriveOutOfRange`, `PowerCurveOutOfRange`, `UnsafeWaveform`,
//!   `OpenWindowTooShort`, `Configuration`): detected before or while arming hardware.
//!   Never retried.
//! - **Device failures** (`Device`): a capability call failed. The scan aborts but
//!   every device opened so far is still released.
//! - **Frame stalls** (`FrameStall`): the camera did not deliver a frame in time even
//!   after the retry policy was exhausted.
//! - **Storage failures** (`Storage`, `DatasetBounds`, `OutOfOrderWrite`,
//!   `LayoutMismatch`, `CodecEnvironmentMismatch`): partial data is left in place.
//!
//! `ScanAborted` wraps any of the above with the last-known position of the nested
//! loop so an operator can tell how far a run got. Capability traits themselves return
//! `anyhow::Result`; the sequencer converts those into `Device` with
//! [`DaqError::device`].

use std::fmt;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Which piece of hardware an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Motorized three-axis stage.
    Stage,
    /// Analog-output board driving galvos, lens and laser modulation.
    AnalogOutput,
    /// Multi-line laser source.
    Laser,
    /// Emission filter wheel.
    FilterWheel,
    /// Electrically tunable lens.
    TunableLens,
    /// Scientific camera.
    Camera,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Stage => "stage",
            DeviceKind::AnalogOutput => "analog output",
            DeviceKind::Laser => "laser",
            DeviceKind::FilterWheel => "filter wheel",
            DeviceKind::TunableLens => "tunable lens",
            DeviceKind::Camera => "camera",
        };
        f.write_str(name)
    }
}

/// Last-known indices of the nested scan loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPosition {
    /// Depth plane ordinal (outer loop).
    pub depth_plane: usize,
    /// Lateral tile ordinal within the plane.
    pub lateral_tile: usize,
    /// Wavelength label of the active channel.
    pub wavelength: String,
    /// Dataset index of the tile being acquired.
    pub tile_index: usize,
    /// Frame being drained, when the failure happened during readout.
    pub frame: Option<usize>,
}

impl fmt::Display for ScanPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "depth plane {}, lateral tile {}, wavelength {} (tile index {})",
            self.depth_plane, self.lateral_tile, self.wavelength, self.tile_index
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame {}", frame)?;
        }
        Ok(())
    }
}

/// Every failure the acquisition engine can report.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure while preparing or writing output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Region of interest bounds are inverted or empty.
    #[error("Invalid ROI on {axis} axis: min {min} mm is not below max {max} mm")]
    InvalidRoi {
        /// Axis letter.
        axis: char,
        /// Lower bound (mm).
        min: f64,
        /// Upper bound (mm).
        max: f64,
    },

    /// Overlap and sampling leave no positive tile width.
    #[error("Tile width on {axis} axis is not positive ({width} mm); check overlap and sampling")]
    NonPositiveTileWidth {
        /// Axis letter.
        axis: char,
        /// Computed width (mm).
        width: f64,
    },

    /// The scan axis is shorter than one frame spacing.
    #[error("Scan length {length} mm yields no frames at {spacing_um} um spacing")]
    EmptyScan {
        /// Scan length (mm).
        length: f64,
        /// Frame spacing (um).
        spacing_um: f64,
    },

    /// A compensated laser setpoint exceeds its bound.
    #[error("Laser drive for {wavelength} nm would reach {requested:.3}, above the limit {limit:.3}")]
    LaserDriveOutOfRange {
        /// Wavelength label.
        wavelength: String,
        /// Setpoint that would have been sent.
        requested: f64,
        /// Bound it was checked against.
        limit: f64,
    },

    /// Requested power lies outside the measured power curve.
    #[error("Power {power:.3} mW is outside the calibrated range [{min:.3}, {max:.3}] mW")]
    PowerCurveOutOfRange {
        /// Requested power (mW).
        power: f64,
        /// Lowest calibrated power (mW).
        min: f64,
        /// Highest calibrated power (mW).
        max: f64,
    },

    /// A synthesized channel would leave its safe voltage range or jump at the wrap.
    #[error("Waveform on channel '{channel}' is unsafe: {detail}")]
    UnsafeWaveform {
        /// Channel role and analog-output index.
        channel: String,
        /// What was violated.
        detail: String,
    },

    /// Rolling shutter time leaves no window with every row exposing.
    #[error("Exposure of {exposure_ms} ms leaves no open window with a roll time of {roll_ms:.3} ms")]
    OpenWindowTooShort {
        /// Camera exposure (ms).
        exposure_ms: f64,
        /// Half-frame roll time (ms).
        roll_ms: f64,
    },

    /// A capability call on a device failed.
    #[error("{device} failed during {operation}: {source:#}")]
    Device {
        /// Device that failed.
        device: DeviceKind,
        /// Capability operation being performed.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: anyhow::Error,
    },

    /// The camera missed a frame beyond the retry policy.
    #[error("Camera stalled waiting for frame {frame} after {attempts} attempts")]
    FrameStall {
        /// Frame index within the tile.
        frame: usize,
        /// Attempts made.
        attempts: u32,
    },

    /// Pyramid backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A write runs past the frames reserved for a tile.
    #[error("Write of frames {start}..{end} exceeds the {capacity} frames reserved for tile {tile}")]
    DatasetBounds {
        /// Dataset index.
        tile: usize,
        /// First frame of the write.
        start: usize,
        /// One past the last frame of the write.
        end: usize,
        /// Reserved frames.
        capacity: usize,
    },

    /// A write starts before frames already stored.
    #[error("Write for tile {tile} starts at frame {start}, before the already written frame {written}")]
    OutOfOrderWrite {
        /// Dataset index.
        tile: usize,
        /// First frame of the write.
        start: usize,
        /// Frames already stored.
        written: usize,
    },

    /// An existing setup has different level shapes.
    #[error("Tile {tile} already exists with a different layout: {detail}")]
    LayoutMismatch {
        /// Dataset index.
        tile: usize,
        /// Expected and found shapes.
        detail: String,
    },

    /// A write or read names a tile the store never created.
    #[error("Tile {0} was never initialized in the pyramid store")]
    UnknownTile(usize),

    /// The filter plugin runtime is not the one the codec expects.
    #[error("Quantizing codec requires {variable}={expected}, found {found:?}; pass the override to continue anyway")]
    CodecEnvironmentMismatch {
        /// Environment variable checked.
        variable: String,
        /// Required value.
        expected: String,
        /// Value found, if set.
        found: Option<String>,
    },

    /// The operator cancelled the run.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Any failure inside the scan loop, with where it happened.
    #[error("Scan aborted at {position}: {source}")]
    ScanAborted {
        /// Last-known loop position.
        position: ScanPosition,
        /// Underlying failure.
        #[source]
        source: Box<DaqError>,
    },

    /// One or more devices failed to release.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Wrap a capability-trait failure with the device and operation that produced it.
    pub fn device(device: DeviceKind, operation: &'static str, source: anyhow::Error) -> Self {
        DaqError::Device {
            device,
            operation,
            source,
        }
    }

    /// The failure underneath any `ScanAborted` wrapping.
    pub fn root(&self) -> &DaqError {
        match self {
            DaqError::ScanAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attach device context to `anyhow` results coming out of capability traits.
pub trait DeviceResultExt<T> {
    /// Convert into a [`DaqError::Device`] for `device` and `operation`.
    fn device_err(self, device: DeviceKind, operation: &'static str) -> AppResult<T>;
}

impl<T> DeviceResultExt<T> for anyhow::Result<T> {
    fn device_err(self, device: DeviceKind, operation: &'static str) -> AppResult<T> {
        self.map_err(|source| DaqError::device(device, operation, source))
    }
}
