//! Depth-dependent laser drive compensation.
//!
//! Light reaching deeper planes is attenuated roughly exponentially, so the drive is
//! scaled by `1 / exp(-depth / attenuation)`. Each channel carries one authoritative
//! upper bound in the laser's drive quantity; when a measured power curve is present
//! the bound can only shrink to the curve's calibrated range.
//!
//! A laser driven in power still takes a diode current as its setpoint, so power
//! mode always goes through the channel's curve and the resulting current is held
//! to the channel's `max_current_ma`.

use serde::{Deserialize, Serialize};

use crate::config::{DriveQuantity, WavelengthChannel};
use crate::error::{AppResult, DaqError};

/// Depth-compensated drive value.
pub fn compensate(nominal: f64, depth_mm: f64, attenuation_mm: f64) -> f64 {
    nominal / (-depth_mm / attenuation_mm).exp()
}

/// Raw table form of a power curve as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PowerCurveTable {
    power_mw: Vec<f64>,
    current_ma: Vec<f64>,
    #[serde(default = "unit_factor")]
    measurement_factor: f64,
    #[serde(default)]
    zero_current_ma: f64,
}

fn unit_factor() -> f64 {
    1.0
}

/// Measured optical power versus diode current, strictly increasing in both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PowerCurveTable", into = "PowerCurveTable")]
pub struct PowerCurve {
    power_mw: Vec<f64>,
    current_ma: Vec<f64>,
    measurement_factor: f64,
    zero_current_ma: f64,
}

impl TryFrom<PowerCurveTable> for PowerCurve {
    type Error = String;

    fn try_from(table: PowerCurveTable) -> Result<Self, Self::Error> {
        PowerCurve::new(
            table.power_mw,
            table.current_ma,
            table.measurement_factor,
            table.zero_current_ma,
        )
        .map_err(|e| e.to_string())
    }
}

impl From<PowerCurve> for PowerCurveTable {
    fn from(curve: PowerCurve) -> Self {
        Self {
            power_mw: curve.power_mw,
            current_ma: curve.current_ma,
            measurement_factor: curve.measurement_factor,
            zero_current_ma: curve.zero_current_ma,
        }
    }
}

impl PowerCurve {
    /// Build a curve, rejecting tables that are not strictly increasing.
    pub fn new(
        power_mw: Vec<f64>,
        current_ma: Vec<f64>,
        measurement_factor: f64,
        zero_current_ma: f64,
    ) -> AppResult<Self> {
        if power_mw.len() != current_ma.len() || power_mw.len() < 2 {
            return Err(DaqError::Configuration(format!(
                "power curve needs matching power and current columns with at least two points (got {} and {})",
                power_mw.len(),
                current_ma.len()
            )));
        }
        let increasing = |values: &[f64]| values.windows(2).all(|w| w[1] > w[0]);
        if !increasing(&power_mw) || !increasing(&current_ma) {
            return Err(DaqError::Configuration(
                "power curve must be strictly increasing in power and current".into(),
            ));
        }
        if measurement_factor <= 0.0 {
            return Err(DaqError::Configuration(
                "power curve measurement factor must be positive".into(),
            ));
        }
        Ok(Self {
            power_mw,
            current_ma,
            measurement_factor,
            zero_current_ma,
        })
    }

    /// Highest calibrated power (mW), as seen after the measurement factor.
    pub fn max_power(&self) -> f64 {
        self.power_mw[self.power_mw.len() - 1] * self.measurement_factor
    }

    /// Lowest calibrated power (mW), as seen after the measurement factor.
    pub fn min_power(&self) -> f64 {
        self.power_mw[0] * self.measurement_factor
    }

    /// Diode current producing `power_mw`, by piecewise-linear interpolation.
    pub fn current_for(&self, power_mw: f64) -> AppResult<f64> {
        if power_mw == 0.0 {
            return Ok(self.zero_current_ma);
        }
        let target = power_mw / self.measurement_factor;
        let first = self.power_mw[0];
        let last = self.power_mw[self.power_mw.len() - 1];
        if !(first..=last).contains(&target) {
            return Err(DaqError::PowerCurveOutOfRange {
                power: power_mw,
                min: self.min_power(),
                max: self.max_power(),
            });
        }
        let upper = self
            .power_mw
            .iter()
            .position(|&p| p >= target)
            .unwrap_or(self.power_mw.len() - 1)
            .max(1);
        let (p0, p1) = (self.power_mw[upper - 1], self.power_mw[upper]);
        let (c0, c1) = (self.current_ma[upper - 1], self.current_ma[upper]);
        Ok(c0 + (target - p0) * (c1 - c0) / (p1 - p0))
    }
}

/// Drive prepared for one depth plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserDrive {
    /// Compensated value in the configured drive quantity.
    pub requested: f64,
    /// Value sent to the laser (current when a power curve converts it).
    pub device_value: f64,
}

/// Computes and validates compensated drives for the configured laser.
#[derive(Debug, Clone, Copy)]
pub struct PowerCompensator {
    quantity: DriveQuantity,
}

impl PowerCompensator {
    /// Compensator for a laser driven in `quantity`.
    pub fn new(quantity: DriveQuantity) -> Self {
        Self { quantity }
    }

    /// Effective upper bound for `channel` in the drive quantity.
    pub fn limit(&self, channel: &WavelengthChannel) -> f64 {
        match (&self.quantity, &channel.power_curve) {
            (DriveQuantity::Power, Some(curve)) => channel.max_drive.min(curve.max_power()),
            _ => channel.max_drive,
        }
    }

    /// Refuse the scan when the deepest plane would need more than the limit.
    ///
    /// Evaluated at `planes * plane_spacing`, one plane past the last acquired one.
    pub fn preflight(
        &self,
        channel: &WavelengthChannel,
        planes: usize,
        plane_spacing_mm: f64,
    ) -> AppResult<f64> {
        let deepest = compensate(
            channel.nominal_drive,
            planes as f64 * plane_spacing_mm,
            channel.attenuation_mm,
        );
        let limit = self.limit(channel);
        if deepest > limit {
            return Err(DaqError::LaserDriveOutOfRange {
                wavelength: channel.name.clone(),
                requested: deepest,
                limit,
            });
        }
        self.device_value(channel, deepest)?;
        Ok(deepest)
    }

    /// Drive for depth plane `plane`.
    pub fn drive_for_plane(
        &self,
        channel: &WavelengthChannel,
        plane: usize,
        plane_spacing_mm: f64,
    ) -> AppResult<LaserDrive> {
        let requested = compensate(
            channel.nominal_drive,
            plane as f64 * plane_spacing_mm,
            channel.attenuation_mm,
        );
        let limit = self.limit(channel);
        if requested > limit || requested < channel.min_drive {
            return Err(DaqError::LaserDriveOutOfRange {
                wavelength: channel.name.clone(),
                requested,
                limit,
            });
        }
        Ok(LaserDrive {
            requested,
            device_value: self.device_value(channel, requested)?,
        })
    }

    /// Setpoint the laser controller receives for `requested`.
    fn device_value(&self, channel: &WavelengthChannel, requested: f64) -> AppResult<f64> {
        match self.quantity {
            DriveQuantity::Current => Ok(requested),
            DriveQuantity::Power => {
                let missing = |what: &str| {
                    DaqError::Configuration(format!(
                        "wavelength '{}' is driven in power but has no {}",
                        channel.name, what
                    ))
                };
                let curve = channel
                    .power_curve
                    .as_ref()
                    .ok_or_else(|| missing("power curve"))?;
                let ceiling = channel
                    .max_current_ma
                    .ok_or_else(|| missing("current ceiling"))?;
                let current = curve.current_for(requested)?;
                if current > ceiling {
                    return Err(DaqError::LaserDriveOutOfRange {
                        wavelength: channel.name.clone(),
                        requested: current,
                        limit: ceiling,
                    });
                }
                Ok(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_channel;

    #[test]
    fn zero_depth_is_identity() {
        for nominal in [0.5, 10.0, 123.4] {
            assert_eq!(compensate(nominal, 0.0, 1000.0), nominal);
        }
    }

    #[test]
    fn strictly_increasing_with_depth() {
        let mut previous = compensate(40.0, 0.0, 2.0);
        for step in 1..50 {
            let next = compensate(40.0, step as f64 * 0.05, 2.0);
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn preflight_rejects_deepest_plane_above_limit() {
        let mut channel = sample_channel("488", 9);
        channel.nominal_drive = 50.0;
        channel.attenuation_mm = 1000.0;
        channel.max_drive = 50.0;
        let compensator = PowerCompensator::new(DriveQuantity::Current);
        let err = compensator.preflight(&channel, 10, 0.05).unwrap_err();
        match err {
            DaqError::LaserDriveOutOfRange { requested, limit, .. } => {
                assert!((requested - 50.025).abs() < 1e-3);
                assert_eq!(limit, 50.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        channel.max_drive = 50.1;
        assert!(compensator.preflight(&channel, 10, 0.05).is_ok());
    }

    #[test]
    fn curve_interpolates_between_points() {
        let curve = PowerCurve::new(vec![0.0, 10.0, 30.0], vec![100.0, 200.0, 300.0], 1.0, 0.0)
            .unwrap();
        assert_eq!(curve.current_for(5.0).unwrap(), 150.0);
        assert_eq!(curve.current_for(20.0).unwrap(), 250.0);
        assert_eq!(curve.current_for(30.0).unwrap(), 300.0);
        assert_eq!(curve.current_for(0.0).unwrap(), 0.0);
        assert!(matches!(
            curve.current_for(31.0),
            Err(DaqError::PowerCurveOutOfRange { .. })
        ));
    }

    #[test]
    fn measurement_factor_scales_power_axis() {
        let curve =
            PowerCurve::new(vec![1.0, 11.0], vec![100.0, 200.0], 2.0, 50.0).unwrap();
        assert_eq!(curve.max_power(), 22.0);
        assert_eq!(curve.current_for(12.0).unwrap(), 150.0);
        assert_eq!(curve.current_for(0.0).unwrap(), 50.0);
    }

    #[test]
    fn non_monotone_curve_is_rejected() {
        assert!(PowerCurve::new(vec![0.0, 5.0, 4.0], vec![1.0, 2.0, 3.0], 1.0, 0.0).is_err());
        assert!(PowerCurve::new(vec![0.0], vec![1.0], 1.0, 0.0).is_err());
    }

    #[test]
    fn power_mode_uses_curve_for_device_value() {
        let mut channel = sample_channel("561", 11);
        channel.nominal_drive = 10.0;
        channel.max_drive = 100.0;
        channel.power_curve =
            Some(PowerCurve::new(vec![0.0, 20.0], vec![0.0, 400.0], 1.0, 0.0).unwrap());
        channel.max_current_ma = Some(400.0);
        let compensator = PowerCompensator::new(DriveQuantity::Power);
        assert_eq!(compensator.limit(&channel), 20.0);
        let drive = compensator.drive_for_plane(&channel, 0, 0.05).unwrap();
        assert_eq!(drive.requested, 10.0);
        assert_eq!(drive.device_value, 200.0);
    }

    #[test]
    fn power_mode_without_curve_never_passes_power_through() {
        let mut channel = sample_channel("488", 9);
        channel.max_current_ma = Some(400.0);
        let compensator = PowerCompensator::new(DriveQuantity::Power);
        assert!(matches!(
            compensator.drive_for_plane(&channel, 0, 0.05),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            compensator.preflight(&channel, 2, 0.05),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn preflight_holds_curve_current_to_ceiling() {
        let mut channel = sample_channel("561", 11);
        channel.nominal_drive = 10.0;
        channel.max_drive = 100.0;
        channel.attenuation_mm = 1.0;
        channel.power_curve =
            Some(PowerCurve::new(vec![0.0, 20.0], vec![0.0, 400.0], 1.0, 0.0).unwrap());
        // Deepest plane at 0.5 mm needs ~16.5 mW, i.e. ~330 mA.
        channel.max_current_ma = Some(300.0);
        let compensator = PowerCompensator::new(DriveQuantity::Power);
        match compensator.preflight(&channel, 10, 0.05).unwrap_err() {
            DaqError::LaserDriveOutOfRange { requested, limit, .. } => {
                assert!((requested - 329.744).abs() < 1e-2);
                assert_eq!(limit, 300.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        channel.max_current_ma = Some(350.0);
        assert!(compensator.preflight(&channel, 10, 0.05).is_ok());
        // Shallow planes stay under the ceiling.
        channel.max_current_ma = Some(300.0);
        assert_eq!(
            compensator.drive_for_plane(&channel, 0, 0.05).unwrap().device_value,
            200.0
        );
    }
}
