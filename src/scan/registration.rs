//! Registration document placing every tile in a shared world frame.
//!
//! The document follows the BigDataViewer `SpimData` layout that sits next to the
//! pyramid file: one view setup per dataset index and, per setup, three chained
//! affine transforms applied in order: Overlap (tile translation), Scale (voxel
//! anisotropy) and Deskew (shear from the oblique light sheet).

use std::fmt::Write as _;
use std::path::Path;

use tracing::info;

use crate::config::ScanConfig;
use crate::error::{AppResult, DaqError};
use crate::scan::geometry::VolumeGeometry;

/// Row-major 3x4 affine matrix.
pub type Affine = [f64; 12];

/// Values the document is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationLayout {
    /// Wavelength channels.
    pub channels: usize,
    /// Lateral tiles (the document's x tiles).
    pub tiles_x: usize,
    /// Depth tiles (the document's y tiles).
    pub tiles_y: usize,
    /// Lateral tile spacing (um).
    pub offset_x_um: f64,
    /// Depth tile spacing (um).
    pub offset_y_um: f64,
    /// Voxel size along the frame width (um).
    pub voxel_x: f64,
    /// Voxel size along the frame height, projected (um).
    pub voxel_y: f64,
    /// Voxel size along the scan (um).
    pub voxel_z: f64,
    /// Sheet angle (degrees).
    pub theta_deg: f64,
    /// Stored frame width (px).
    pub frame_width: usize,
    /// Stored frame height (px).
    pub frame_height: usize,
    /// Frames per tile.
    pub frames: usize,
    /// Pyramid file name referenced by the document.
    pub data_file: String,
}

impl RegistrationLayout {
    /// Derive from configuration and geometry.
    pub fn new(config: &ScanConfig, geometry: &VolumeGeometry) -> Self {
        let theta = config.experiment.theta_deg;
        Self {
            channels: config.channels.len(),
            tiles_x: geometry.y_tiles,
            tiles_y: geometry.z_tiles,
            offset_x_um: geometry.y_width * 1000.0,
            offset_y_um: geometry.z_width * 1000.0,
            voxel_x: config.camera.pixel_size_um,
            voxel_y: config.camera.pixel_size_um * theta.to_radians().cos(),
            voxel_z: config.experiment.x_sampling_um,
            theta_deg: theta,
            frame_width: geometry.frame_width,
            frame_height: geometry.frame_height,
            frames: geometry.frames_per_tile,
            data_file: config.storage.data_file.clone(),
        }
    }

    fn tiles(&self) -> usize {
        self.tiles_x * self.tiles_y
    }

    /// Scale factors normalised to the projected y voxel.
    pub fn scale(&self) -> [f64; 3] {
        [
            self.voxel_x / self.voxel_y,
            1.0,
            self.voxel_z / self.voxel_y,
        ]
    }

    /// Shear coefficient of the deskew transform.
    pub fn shear(&self) -> f64 {
        -self.theta_deg.to_radians().tan() * self.voxel_y / self.voxel_z
    }

    /// Overlap, Scale and Deskew transforms of the tile at depth `j`, lateral `k`.
    pub fn transforms(&self, j: usize, k: usize) -> [(&'static str, Affine); 3] {
        let [sx, sy, sz] = self.scale();
        let shift_x = sx * (self.offset_x_um / self.voxel_x) * k as f64;
        let shift_y = -sy * (self.offset_y_um / self.voxel_y) * j as f64;
        [
            (
                "Overlap",
                [1.0, 0.0, 0.0, shift_x, 0.0, 1.0, 0.0, shift_y, 0.0, 0.0, 1.0, 0.0],
            ),
            (
                "Scale",
                [sx, 0.0, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 0.0, sz, 0.0],
            ),
            (
                "Deskew",
                [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, self.shear(), 1.0, 0.0],
            ),
        ]
    }

    /// Render the document.
    pub fn render(&self) -> AppResult<String> {
        let mut xml = String::new();
        self.render_into(&mut xml)
            .map_err(|e| DaqError::Storage(format!("rendering registration document: {}", e)))?;
        Ok(xml)
    }

    fn render_into(&self, xml: &mut String) -> std::fmt::Result {
        let tiles = self.tiles();
        writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(xml, r#"<SpimData version="0.2">"#)?;
        writeln!(xml, "\t<BasePath type=\"relative\">.</BasePath>")?;
        writeln!(xml, "\t<SequenceDescription>")?;
        writeln!(xml, "\t\t<ImageLoader format=\"bdv.hdf5\">")?;
        writeln!(xml, "\t\t\t<hdf5 type=\"relative\">{}</hdf5>", self.data_file)?;
        writeln!(xml, "\t\t</ImageLoader>")?;
        writeln!(xml, "\t\t<ViewSetups>")?;
        for channel in 0..self.channels {
            for tile in 0..tiles {
                let id = tiles * channel + tile;
                writeln!(xml, "\t\t\t<ViewSetup>")?;
                writeln!(xml, "\t\t\t\t<id>{id}</id>")?;
                writeln!(xml, "\t\t\t\t<name>{id}</name>")?;
                writeln!(
                    xml,
                    "\t\t\t\t<size>{} {} {}</size>",
                    self.frame_width, self.frame_height, self.frames
                )?;
                writeln!(xml, "\t\t\t\t<voxelSize>")?;
                writeln!(xml, "\t\t\t\t\t<unit>um</unit>")?;
                writeln!(
                    xml,
                    "\t\t\t\t\t<size>{} {} {}</size>",
                    self.voxel_x, self.voxel_y, self.voxel_z
                )?;
                writeln!(xml, "\t\t\t\t</voxelSize>")?;
                writeln!(xml, "\t\t\t\t<attributes>")?;
                writeln!(xml, "\t\t\t\t\t<illumination>0</illumination>")?;
                writeln!(xml, "\t\t\t\t\t<channel>{channel}</channel>")?;
                writeln!(xml, "\t\t\t\t\t<tile>{tile}</tile>")?;
                writeln!(xml, "\t\t\t\t\t<angle>0</angle>")?;
                writeln!(xml, "\t\t\t\t</attributes>")?;
                writeln!(xml, "\t\t\t</ViewSetup>")?;
            }
        }
        write_attribute_list(xml, "illumination", "Illumination", 1)?;
        write_attribute_list(xml, "channel", "Channel", self.channels)?;
        write_attribute_list(xml, "tile", "Tile", tiles)?;
        write_attribute_list(xml, "angle", "Angle", 1)?;
        writeln!(xml, "\t\t</ViewSetups>")?;
        writeln!(xml, "\t\t<Timepoints type=\"pattern\">")?;
        writeln!(xml, "\t\t\t<integerpattern>0</integerpattern>")?;
        writeln!(xml, "\t\t</Timepoints>")?;
        writeln!(xml, "\t\t<MissingViews />")?;
        writeln!(xml, "\t</SequenceDescription>")?;

        writeln!(xml, "\t<ViewRegistrations>")?;
        for channel in 0..self.channels {
            for j in 0..self.tiles_y {
                for k in 0..self.tiles_x {
                    let setup = channel * tiles + j * self.tiles_x + k;
                    writeln!(
                        xml,
                        "\t\t<ViewRegistration timepoint=\"0\" setup=\"{setup}\">"
                    )?;
                    for (name, affine) in self.transforms(j, k) {
                        let values: Vec<String> = affine.iter().map(|v| format!("{v:?}")).collect();
                        writeln!(xml, "\t\t\t<ViewTransform type=\"affine\">")?;
                        writeln!(xml, "\t\t\t\t<Name>{name}</Name>")?;
                        writeln!(xml, "\t\t\t\t<affine>{}</affine>", values.join(" "))?;
                        writeln!(xml, "\t\t\t</ViewTransform>")?;
                    }
                    writeln!(xml, "\t\t</ViewRegistration>")?;
                }
            }
        }
        writeln!(xml, "\t</ViewRegistrations>")?;
        for empty in [
            "ViewInterestPoints",
            "BoundingBoxes",
            "PointSpreadFunctions",
            "StitchingResults",
            "IntensityAdjustments",
        ] {
            writeln!(xml, "\t<{empty} />")?;
        }
        writeln!(xml, "</SpimData>")
    }

    /// Write the document to `path`.
    pub fn write_to(&self, path: &Path) -> AppResult<()> {
        std::fs::write(path, self.render()?)?;
        info!(
            "Wrote registration for {} view setups to {}",
            self.channels * self.tiles(),
            path.display()
        );
        Ok(())
    }
}

fn write_attribute_list(
    xml: &mut String,
    name: &str,
    element: &str,
    count: usize,
) -> std::fmt::Result {
    writeln!(xml, "\t\t\t<Attributes name=\"{name}\">")?;
    for id in 0..count {
        writeln!(xml, "\t\t\t\t<{element}>")?;
        writeln!(xml, "\t\t\t\t\t<id>{id}</id>")?;
        writeln!(xml, "\t\t\t\t\t<name>{id}</name>")?;
        writeln!(xml, "\t\t\t\t</{element}>")?;
    }
    writeln!(xml, "\t\t\t</Attributes>")
}
