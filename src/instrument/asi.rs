//! ASI stage controllers (Tiger and MS-2000) over RS-232.
//!
//! Both controllers speak the same ASCII command set with positions in tenths of a
//! micron. They differ in how the scan-sync TTL output is routed and in the settle
//! time appended to each scan line.
//!
//! ## Protocol
//!
//! | Operation | Command |
//! |-----------|---------|
//! | Absolute move | `M X=<units>` |
//! | Motor status | `/` (reply `B` busy, `N` idle) |
//! | Velocity | `S X=<mm/s>` |
//! | Backlash | `B X=<mm>` |
//! | Acceleration | `AC X=<ms>` |
//! | Scan pattern | `SCAN F=<0 raster, 1 serpentine>` |
//! | Fast-axis range | `SCANR X=<start mm> Y=<stop mm>` |
//! | Slow-axis range | `SCANV X=<start> Y=<stop> Z=<lines> F=<settle ms>` |
//! | Start scan | `SCAN` |
//! | Position | `W X Y Z` |
//!
//! Errors are reported as `:N-<code>` replies.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::StageModel;
use crate::instrument::serial::SerialLink;
use crate::instrument::{Axis, MotorStatus, ScanSweep, Stage, StageSettings};

/// Controller units per millimetre.
const UNITS_PER_MM: f64 = 10_000.0;

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// An ASI stage controller.
pub struct AsiStage {
    model: StageModel,
    link: Box<dyn SerialLink>,
    poll_interval: Duration,
    move_timeout: Duration,
}

impl AsiStage {
    /// Driver for `model` talking over `link`.
    pub fn new(
        model: StageModel,
        link: Box<dyn SerialLink>,
        poll_interval: Duration,
        move_timeout: Duration,
    ) -> Self {
        Self {
            model,
            link,
            poll_interval,
            move_timeout,
        }
    }

    /// Controller family.
    pub fn model(&self) -> StageModel {
        self.model
    }

    async fn command(&self, command: &str) -> Result<String> {
        let reply = self
            .link
            .query(command)
            .await
            .with_context(|| format!("ASI command '{}'", command))?;
        if reply.starts_with(":N") {
            bail!("ASI controller rejected '{}': {}", command, reply);
        }
        debug!("ASI '{}' -> '{}'", command, reply);
        Ok(reply)
    }

    /// Route the scan-sync signal to the output the camera trigger listens on.
    fn sync_output_command(&self) -> &'static str {
        match self.model {
            // PLC preset 52 exposes stage SYNC on BNC 3 of card 6.
            StageModel::Tiger => "6CCA X=52",
            StageModel::Ms2000 => "TTL Y=3",
        }
    }

    /// Extra settle time per scan line (ms).
    fn scan_settle_ms(&self) -> u32 {
        match self.model {
            StageModel::Tiger => 10,
            StageModel::Ms2000 => 2,
        }
    }
}

#[async_trait]
impl Stage for AsiStage {
    async fn initialize(&self, settings: &StageSettings) -> Result<()> {
        self.command(self.sync_output_command()).await?;
        let pattern = if settings.serpentine { 1 } else { 0 };
        self.command(&format!("SCAN F={}", pattern)).await?;
        for axis in Axis::ALL {
            self.command(&format!("B {}={}", axis, settings.backlash_mm))
                .await?;
            self.set_velocity(axis, settings.velocity_mm_s).await?;
            self.command(&format!("AC {}={}", axis, settings.acceleration_ms))
                .await?;
        }
        let position = self.position().await?;
        info!(
            "{:?} stage initialized at X={:.4} Y={:.4} Z={:.4} mm",
            self.model, position[0], position[1], position[2]
        );
        Ok(())
    }

    async fn position(&self) -> Result<[f64; 3]> {
        let reply = self.command("W X Y Z").await?;
        let values: Vec<f64> = reply
            .split_whitespace()
            .skip(1)
            .take(3)
            .map(|v| v.parse::<f64>().map(|u| u / UNITS_PER_MM))
            .collect::<Result<_, _>>()
            .with_context(|| format!("unparseable position reply '{}'", reply))?;
        match values.as_slice() {
            [x, y, z] => Ok([*x, *y, *z]),
            _ => Err(anyhow!("position reply '{}' has {} values", reply, values.len())),
        }
    }

    async fn go_absolute(&self, axis: Axis, position_mm: f64, wait: bool) -> Result<()> {
        let units = (position_mm * UNITS_PER_MM).round() as i64;
        self.command(&format!("M {}={}", axis, units)).await?;
        if wait {
            self.wait_until_idle(self.poll_interval, self.move_timeout)
                .await?;
        }
        Ok(())
    }

    async fn motor_status(&self) -> Result<MotorStatus> {
        let reply = self.command("/").await?;
        Ok(if reply.starts_with('B') {
            MotorStatus::Busy
        } else {
            MotorStatus::Idle
        })
    }

    async fn set_velocity(&self, axis: Axis, mm_per_s: f64) -> Result<()> {
        self.command(&format!("S {}={}", axis, round_to(mm_per_s, 5)))
            .await?;
        Ok(())
    }

    async fn configure_scan_sweep(&self, sweep: &ScanSweep) -> Result<()> {
        self.command(&format!(
            "SCANR X={} Y={}",
            round_to(sweep.start_mm, 3),
            round_to(sweep.end_mm, 3)
        ))
        .await?;
        let slow = round_to(sweep.slow_axis_mm, 3);
        self.command(&format!(
            "SCANV X={} Y={} Z=1 F={}",
            slow,
            slow,
            self.scan_settle_ms()
        ))
        .await?;
        Ok(())
    }

    async fn start_scan(&self, wait: bool) -> Result<()> {
        self.command("SCAN").await?;
        if wait {
            self.wait_until_idle(self.poll_interval, self.move_timeout)
                .await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Releasing {:?} stage controller", self.model);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::serial::scripted::ScriptedLink;

    fn stage(model: StageModel, link: &ScriptedLink) -> AsiStage {
        AsiStage::new(
            model,
            Box::new(link.clone()),
            Duration::from_millis(1),
            Duration::from_millis(200),
        )
    }

    fn settings() -> StageSettings {
        StageSettings {
            backlash_mm: 0.0,
            velocity_mm_s: 1.0,
            acceleration_ms: 100.0,
            serpentine: true,
        }
    }

    #[tokio::test]
    async fn tiger_initialization_sequence() {
        let link = ScriptedLink::new();
        link.reply("W X Y Z", &[":A 12000 -5000 300"]);
        let stage = stage(StageModel::Tiger, &link);
        stage.initialize(&settings()).await.unwrap();
        let sent = link.sent();
        assert_eq!(sent[0], "6CCA X=52");
        assert_eq!(sent[1], "SCAN F=1");
        assert_eq!(&sent[2..5], &["B X=0", "S X=1", "AC X=100"]);
        assert_eq!(sent.last().map(String::as_str), Some("W X Y Z"));
    }

    #[tokio::test]
    async fn ms2000_routes_ttl_and_settles_faster() {
        let link = ScriptedLink::new();
        link.reply("W X Y Z", &[":A 0 0 0"]);
        let stage = stage(StageModel::Ms2000, &link);
        stage.initialize(&settings()).await.unwrap();
        stage
            .configure_scan_sweep(&ScanSweep {
                start_mm: -0.25,
                end_mm: 0.75,
                slow_axis_mm: 1.23456,
            })
            .await
            .unwrap();
        let sent = link.sent();
        assert_eq!(sent[0], "TTL Y=3");
        assert!(sent.contains(&"SCANR X=-0.25 Y=0.75".to_string()));
        assert!(sent.contains(&"SCANV X=1.235 Y=1.235 Z=1 F=2".to_string()));
    }

    #[tokio::test]
    async fn absolute_move_uses_controller_units_and_waits() {
        let link = ScriptedLink::new();
        link.reply("/", &["B", "B", "N"]);
        let stage = stage(StageModel::Tiger, &link);
        stage.go_absolute(Axis::Z, 0.12345, true).await.unwrap();
        assert_eq!(link.sent(), vec!["M Z=1235", "/", "/", "/"]);
    }

    #[tokio::test]
    async fn position_is_converted_to_mm() {
        let link = ScriptedLink::new();
        link.reply("W X Y Z", &[":A 12000 -5000 300"]);
        let position = stage(StageModel::Tiger, &link).position().await.unwrap();
        assert_eq!(position, [1.2, -0.5, 0.03]);
    }

    #[tokio::test]
    async fn rejected_command_is_an_error() {
        let link = ScriptedLink::new();
        link.reply("S ", &[":N-4"]);
        let err = stage(StageModel::Tiger, &link)
            .set_velocity(Axis::X, 0.5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }
}
