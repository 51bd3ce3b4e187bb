//! Noise-bounded quantizing codec.
//!
//! Camera counts are mapped to a variance-stabilised domain in which photon shot
//! noise plus read noise has unit standard deviation, quantized with a step of
//! `sigma`, and mapped back. The reconstruction error is therefore bounded by a
//! fraction of the local noise level instead of a fixed number of counts.
//!
//! On disk the codec is the HDF5 dynamically loaded filter `32016`; this module
//! provides its parameter block, the environment check guarding its use and a
//! software model of the transform used by the in-memory store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::CodecConfig;
use crate::error::{AppResult, DaqError};

/// Registered HDF5 filter id of the codec.
pub const QUANTIZING_FILTER_ID: u32 = 32016;

/// Parameters of one channel's codec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizingCodec {
    /// Quantization step in units of noise standard deviation.
    pub sigma: f64,
    /// Mode flag passed through to the filter.
    pub mode: u32,
    /// Conversion gain (DN per photoelectron).
    pub gain: f64,
    /// Dark offset (DN).
    pub background: u32,
    /// Read noise (photoelectrons).
    pub read_noise: f64,
}

impl QuantizingCodec {
    /// Codec for one channel's `sigma` with the shared camera parameters.
    pub fn new(sigma: f64, shared: &CodecConfig) -> Self {
        Self {
            sigma,
            mode: shared.mode,
            gain: shared.gain,
            background: shared.background,
            read_noise: shared.read_noise,
        }
    }

    /// Filter parameter block: fixed-point values scaled by 1000.
    pub fn filter_params(&self) -> [u32; 5] {
        [
            (self.sigma * 1000.0).round() as u32,
            self.mode,
            (self.gain * 1000.0).round() as u32,
            self.background,
            (self.read_noise * 1000.0).round() as u32,
        ]
    }

    fn electrons(&self, value: u16) -> f64 {
        (f64::from(value) - f64::from(self.background)).max(0.0) / self.gain
    }

    /// Noise standard deviation at `value` (DN).
    pub fn noise_dn(&self, value: u16) -> f64 {
        (self.electrons(value) + self.read_noise * self.read_noise).sqrt() * self.gain
    }

    /// Encode and decode one sample.
    pub fn round_trip(&self, value: u16) -> u16 {
        if f64::from(value) <= f64::from(self.background) {
            return value;
        }
        let floor = self.read_noise * self.read_noise;
        let stabilised = 2.0 * (self.electrons(value) + floor).sqrt();
        let quantized = (stabilised / self.sigma).round() * self.sigma;
        let electrons = ((quantized / 2.0).powi(2) - floor).max(0.0);
        let restored = electrons * self.gain + f64::from(self.background);
        restored.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

/// Per-tile compression choice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Compression {
    /// Stored losslessly.
    None,
    /// Stored through the quantizing codec.
    Quantized(QuantizingCodec),
}

impl Compression {
    /// The codec, if any.
    pub fn codec(&self) -> Option<&QuantizingCodec> {
        match self {
            Compression::None => None,
            Compression::Quantized(codec) => Some(codec),
        }
    }
}

/// Checks the runtime that provides the filter plugin before any data is written.
///
/// A mismatch is an error unless `allow_mismatch` is set by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecEnvironmentGuard {
    variable: Option<String>,
    expected: Option<String>,
    allow_mismatch: bool,
}

impl CodecEnvironmentGuard {
    /// Guard built from the shared codec configuration.
    pub fn new(config: &CodecConfig, allow_mismatch: bool) -> Self {
        Self {
            variable: config.environment_variable.clone(),
            expected: config.required_environment.clone(),
            allow_mismatch,
        }
    }

    /// Check against the process environment.
    pub fn check(&self) -> AppResult<()> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        self.check_with(&vars)
    }

    /// Check against an explicit environment.
    pub fn check_with(&self, env: &HashMap<String, String>) -> AppResult<()> {
        let (Some(variable), Some(expected)) = (&self.variable, &self.expected) else {
            return Ok(());
        };
        let found = env.get(variable).cloned();
        if found.as_deref() == Some(expected.as_str()) {
            return Ok(());
        }
        if self.allow_mismatch {
            tracing::warn!(
                "Codec environment {}={:?} does not match the expected {}; continuing on operator override",
                variable,
                found,
                expected
            );
            return Ok(());
        }
        Err(DaqError::CodecEnvironmentMismatch {
            variable: variable.clone(),
            expected: expected.clone(),
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(sigma: f64) -> QuantizingCodec {
        QuantizingCodec::new(sigma, &CodecConfig::default())
    }

    #[test]
    fn filter_params_are_fixed_point() {
        let shared = CodecConfig {
            gain: 2.5,
            background: 100,
            ..CodecConfig::default()
        };
        let codec = QuantizingCodec::new(1.2, &shared);
        assert_eq!(codec.filter_params(), [1200, 1, 2500, 100, 1500]);
    }

    #[test]
    fn error_stays_within_noise_bound() {
        for sigma in [0.5, 1.0, 2.0] {
            let codec = codec(sigma);
            for value in (0..=u16::MAX).step_by(37) {
                let restored = codec.round_trip(value);
                let error = (f64::from(restored) - f64::from(value)).abs();
                assert!(
                    error <= sigma * codec.noise_dn(value) + 1.0,
                    "sigma {sigma}: {value} -> {restored}"
                );
            }
        }
    }

    #[test]
    fn quantization_reduces_distinct_levels() {
        let codec = codec(2.0);
        let mut levels: Vec<u16> = (1000..2000).map(|v| codec.round_trip(v)).collect();
        levels.dedup();
        assert!(levels.len() < 200);
    }

    #[test]
    fn guard_passes_matching_environment() {
        let config = CodecConfig {
            environment_variable: Some("CODEC_ENV".into()),
            required_environment: Some("imaging".into()),
            ..CodecConfig::default()
        };
        let env = HashMap::from([("CODEC_ENV".to_string(), "imaging".to_string())]);
        assert!(CodecEnvironmentGuard::new(&config, false).check_with(&env).is_ok());
    }

    #[test]
    fn guard_rejects_mismatch_unless_overridden() {
        let config = CodecConfig {
            environment_variable: Some("CODEC_ENV".into()),
            required_environment: Some("imaging".into()),
            ..CodecConfig::default()
        };
        let env = HashMap::from([("CODEC_ENV".to_string(), "base".to_string())]);
        let err = CodecEnvironmentGuard::new(&config, false)
            .check_with(&env)
            .unwrap_err();
        assert!(matches!(err, DaqError::CodecEnvironmentMismatch { .. }));
        assert!(CodecEnvironmentGuard::new(&config, true).check_with(&env).is_ok());
        assert!(CodecEnvironmentGuard::new(&config, false)
            .check_with(&HashMap::new())
            .is_err());
    }

    #[test]
    fn unconfigured_guard_always_passes() {
        let guard = CodecEnvironmentGuard::new(&CodecConfig::default(), false);
        assert!(guard.check_with(&HashMap::new()).is_ok());
    }
}
