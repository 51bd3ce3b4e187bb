//! Cobolt Skyra multi-line laser over RS-232.
//!
//! Commands are prefixed with the logical laser channel (1-4). The driver works in
//! modulation mode: the analog-output board gates emission through the digital
//! modulation input while the high/low currents set the two levels.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::instrument::serial::SerialLink;
use crate::instrument::Laser;

/// Skyra laser driver. Drive levels are diode currents in mA.
pub struct SkyraLaser {
    link: Box<dyn SerialLink>,
}

impl SkyraLaser {
    /// Driver on an open link.
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        Self { link }
    }

    async fn command(&self, channel: u8, body: &str) -> Result<()> {
        let command = format!("{}{}", channel, body);
        let reply = self
            .link
            .query(&command)
            .await
            .with_context(|| format!("Skyra command '{}'", command))?;
        if reply.to_ascii_lowercase().contains("error") {
            bail!("Skyra rejected '{}': {}", command, reply);
        }
        debug!("Skyra '{}' -> '{}'", command, reply);
        Ok(())
    }
}

#[async_trait]
impl Laser for SkyraLaser {
    async fn prepare_channel(&self, channel: u8) -> Result<()> {
        self.command(channel, "em").await?;
        self.command(channel, "sdmes 1").await?;
        self.command(channel, "sames 0").await
    }

    async fn enable(&self, channel: u8) -> Result<()> {
        self.command(channel, "l1").await
    }

    async fn disable(&self, channel: u8) -> Result<()> {
        self.command(channel, "l0").await
    }

    async fn set_high_drive_level(&self, channel: u8, value: f64) -> Result<()> {
        self.command(channel, &format!("smc {}", value)).await
    }

    async fn set_low_drive_level(&self, channel: u8, value: f64) -> Result<()> {
        self.command(channel, &format!("slth {}", value)).await
    }
}
