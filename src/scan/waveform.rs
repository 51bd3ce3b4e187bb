//! Analog waveform synthesis for one camera exposure period.
//!
//! The camera reads out from the sensor centre towards both edges, so the first
//! `roll` samples of every period belong to the rolling shutter. The mirror ramp is
//! positioned against that roll time (shifted by the galvo response delay) and the
//! laser is only switched on while rows are actually exposing. The buffer is written
//! once per tile and replayed by the analog-output board on every camera trigger, so
//! it must be periodic: the mirror snaps back through the wrap boundary.

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView1};

use crate::config::{
    ChannelMap, EnableChannel, IlluminationMode, ScanConfig, VoltageLimits, WavelengthChannel,
};
use crate::error::{AppResult, DaqError};

/// Rounding allowance when comparing the wrap step to interior steps.
const WRAP_TOLERANCE_V: f64 = 1e-9;

/// Timing inputs shared by every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformTiming {
    /// Analog-output sample rate (Hz).
    pub sample_rate_hz: f64,
    /// Camera exposure (ms).
    pub exposure_ms: f64,
    /// Camera line time (us).
    pub line_time_us: f64,
    /// Rows read out per frame.
    pub frame_height: usize,
    /// Galvo response delay (us).
    pub galvo_delay_us: f64,
    /// Settling margin on both ends of the ramp (us).
    pub settle_buffer_us: f64,
    /// Margin trimmed from both ends of the laser window (us).
    pub strobe_guard_us: f64,
}

/// Sample counts derived from [`WaveformTiming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    /// Samples in one exposure period.
    pub samples: usize,
    /// Samples spent rolling the shutter in.
    pub roll: usize,
    /// Samples with every row exposing.
    pub on: usize,
    /// Galvo delay in samples.
    pub galvo: usize,
    /// Settling margin in samples.
    pub buffer: usize,
    /// Laser guard in samples.
    pub guard: usize,
}

impl WaveformTiming {
    fn to_samples(&self, micros: f64) -> usize {
        (micros * self.sample_rate_hz / 1e6).floor().max(0.0) as usize
    }

    /// Time for the shutter to roll across half the frame (us).
    pub fn roll_time_us(&self) -> f64 {
        self.line_time_us * self.frame_height as f64 / 2.0
    }

    /// Compute sample counts, failing when no open window is left.
    pub fn layout(&self) -> AppResult<SampleLayout> {
        let exposure_us = self.exposure_ms * 1000.0;
        let roll_us = self.roll_time_us();
        if exposure_us - 2.0 * roll_us <= 0.0 {
            return Err(DaqError::OpenWindowTooShort {
                exposure_ms: self.exposure_ms,
                roll_ms: roll_us / 1000.0,
            });
        }
        Ok(SampleLayout {
            samples: self.to_samples(exposure_us),
            roll: self.to_samples(roll_us),
            on: self.to_samples(exposure_us - roll_us),
            galvo: self.to_samples(self.galvo_delay_us),
            buffer: self.to_samples(self.settle_buffer_us),
            guard: self.to_samples(self.strobe_guard_us),
        })
    }
}

/// One exposure period of samples for every output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    data: Array2<f64>,
    sample_rate_hz: f64,
}

impl WaveformBuffer {
    /// Samples as `[channel][sample]`.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Samples of one output channel.
    pub fn channel(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.row(index)
    }

    /// Number of output channels.
    pub fn channel_count(&self) -> usize {
        self.data.nrows()
    }

    /// Samples per period.
    pub fn samples(&self) -> usize {
        self.data.ncols()
    }

    /// Sample rate the buffer was synthesized for (Hz).
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Jump from the last sample back to the first when the period repeats.
    pub fn wrap_step(&self, index: usize) -> f64 {
        let row = self.data.row(index);
        match (row.first(), row.last()) {
            (Some(first), Some(last)) => (last - first).abs(),
            _ => 0.0,
        }
    }

    /// Largest step between consecutive samples inside the period.
    pub fn max_interior_step(&self, index: usize) -> f64 {
        let row = self.data.row(index);
        row.iter()
            .zip(row.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .fold(0.0, f64::max)
    }
}

/// Builds per-tile analog buffers from the configured channel map.
#[derive(Debug, Clone)]
pub struct WaveformSynthesizer {
    timing: WaveformTiming,
    channels: ChannelMap,
    channel_count: usize,
    limits: VoltageLimits,
    illumination: IlluminationMode,
    device_active_level: f64,
    laser_on_level: f64,
    extra_enables: Vec<EnableChannel>,
}

impl WaveformSynthesizer {
    /// Synthesizer for a validated configuration.
    pub fn from_config(config: &ScanConfig) -> Self {
        let daq = &config.daq;
        Self {
            timing: WaveformTiming {
                sample_rate_hz: daq.sample_rate_hz,
                exposure_ms: config.camera.exposure_ms,
                line_time_us: config.camera.line_time_us,
                frame_height: config.camera.frame_height,
                galvo_delay_us: daq.galvo_delay_us,
                settle_buffer_us: daq.settle_buffer_us,
                strobe_guard_us: daq.strobe_guard_us,
            },
            channels: daq.channels.clone(),
            channel_count: daq.channel_count,
            limits: daq.limits.clone(),
            illumination: daq.illumination,
            device_active_level: daq.device_active_level,
            laser_on_level: daq.laser_on_level,
            extra_enables: daq.extra_enables.clone(),
        }
    }

    /// Timing this synthesizer works with.
    pub fn timing(&self) -> &WaveformTiming {
        &self.timing
    }

    /// Samples per period, for configuring the analog-output task.
    pub fn samples_per_period(&self) -> AppResult<usize> {
        Ok(self.timing.layout()?.samples)
    }

    /// Synthesize the buffer for one wavelength and verify every channel is safe.
    pub fn synthesize(&self, channel: &WavelengthChannel) -> AppResult<WaveformBuffer> {
        let layout = self.timing.layout()?;
        let ramp_len = layout.on + 2 * layout.buffer;
        if ramp_len + 2 > layout.samples {
            return Err(DaqError::Configuration(format!(
                "settling buffer of {} samples leaves no time for the mirror to return within {} samples",
                layout.buffer, layout.samples
            )));
        }

        let mut data = Array2::<f64>::zeros((self.channel_count, layout.samples));
        let ramp_start = layout.roll as isize - layout.galvo as isize - layout.buffer as isize;

        for (index, drive) in [
            (self.channels.x_galvo, &channel.x_galvo),
            (self.channels.y_galvo, &channel.y_galvo),
        ] {
            write_mirror(
                data.row_mut(index).into_slice(),
                ramp_start,
                ramp_len,
                drive.offset(),
                drive.amplitude(),
            );
        }

        data.row_mut(self.channels.etl).fill(channel.etl_volts);
        data.row_mut(self.channels.device_active)
            .fill(self.device_active_level);
        for enable in &self.extra_enables {
            data.row_mut(enable.channel).fill(enable.level);
        }

        let mut laser = data.row_mut(channel.daq_channel);
        match self.illumination {
            IlluminationMode::Continuous => laser.fill(self.laser_on_level),
            IlluminationMode::Strobed => {
                let begin = layout.roll + layout.guard;
                let end = (layout.roll + layout.on)
                    .saturating_sub(layout.guard)
                    .min(layout.samples);
                if begin >= end {
                    return Err(DaqError::Configuration(format!(
                        "strobe guard of {} samples closes the laser window",
                        layout.guard
                    )));
                }
                for sample in laser.iter_mut().skip(begin).take(end - begin) {
                    *sample = self.laser_on_level;
                }
                let last = layout.samples - 1;
                laser[0] = 0.0;
                laser[last] = 0.0;
            }
        }

        let buffer = WaveformBuffer {
            data,
            sample_rate_hz: self.timing.sample_rate_hz,
        };
        self.check_limits(&buffer, channel)?;
        Ok(buffer)
    }

    /// Every driven channel must stay inside its safety range and repeat without a
    /// jump larger than its own largest sample-to-sample step.
    fn check_limits(&self, buffer: &WaveformBuffer, channel: &WavelengthChannel) -> AppResult<()> {
        let mut checks = vec![
            ("x galvo", self.channels.x_galvo, self.limits.galvo),
            ("y galvo", self.channels.y_galvo, self.limits.galvo),
            ("etl", self.channels.etl, self.limits.lens),
            ("device active", self.channels.device_active, self.limits.enable),
            ("laser", channel.daq_channel, self.limits.laser),
        ];
        checks.extend(
            self.extra_enables
                .iter()
                .map(|enable| ("enable", enable.channel, self.limits.enable)),
        );
        for (name, index, [limit_low, limit_high]) in checks {
            let row = buffer.channel(index);
            let low = row.iter().copied().fold(f64::INFINITY, f64::min);
            let high = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if low < limit_low || high > limit_high {
                return Err(DaqError::UnsafeWaveform {
                    channel: format!("{} ({})", name, index),
                    detail: format!(
                        "spans [{:.3}, {:.3}] V, outside the safe range [{}, {}] V",
                        low, high, limit_low, limit_high
                    ),
                });
            }
            let wrap = buffer.wrap_step(index);
            let interior = buffer.max_interior_step(index);
            if wrap > interior + WRAP_TOLERANCE_V {
                return Err(DaqError::UnsafeWaveform {
                    channel: format!("{} ({})", name, index),
                    detail: format!(
                        "jumps {:.4} V across the period boundary, more than its largest step of {:.4} V",
                        wrap, interior
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Mirror drive: an arctangent-form ramp from `offset - amplitude` to
/// `offset + amplitude`, then a linear snap-back, both wrapped modulo the period.
fn write_mirror(
    row: Option<&mut [f64]>,
    ramp_start: isize,
    ramp_len: usize,
    offset: f64,
    amplitude: f64,
) {
    let Some(row) = row else { return };
    let samples = row.len();
    let wrap = |i: isize| i.rem_euclid(samples as isize) as usize;

    let last = (ramp_len - 1).max(1) as f64;
    for i in 0..ramp_len {
        let half_phase = PI * i as f64 / last;
        // atan(cot(x)) written with atan2 so both ends stay finite
        let value = -2.0 * amplitude / PI * half_phase.cos().atan2(half_phase.sin()) + offset;
        row[wrap(ramp_start + i as isize)] = value;
    }

    let snap_len = samples - ramp_len;
    let snap_last = (snap_len - 1).max(1) as f64;
    for i in 0..snap_len {
        let value = offset + amplitude - 2.0 * amplitude * i as f64 / snap_last;
        row[wrap(ramp_start + (ramp_len + i) as isize)] = value;
    }
}
