//! Thorlabs FW102C six-position filter wheel.
//!
//! The wheel echoes each command and finishes its reply with a `>` prompt once the
//! move has completed, so a query doubles as a wait.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::instrument::serial::SerialLink;
use crate::instrument::FilterWheel;

/// Number of slots on the wheel.
pub const SLOTS: u8 = 6;

/// FW102C driver over a serial link.
pub struct Fw102c {
    link: Box<dyn SerialLink>,
}

impl Fw102c {
    /// Driver on an open link.
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl FilterWheel for Fw102c {
    async fn set_position(&self, slot: u8) -> Result<()> {
        if !(1..=SLOTS).contains(&slot) {
            bail!("filter slot {} outside 1..={}", slot, SLOTS);
        }
        let command = format!("pos={}", slot);
        let reply = self
            .link
            .query(&command)
            .await
            .with_context(|| format!("FW102C command '{}'", command))?;
        if reply.contains("CMD_NOT_DEFINED") || reply.contains("CMD_ARG_INVALID") {
            bail!("FW102C rejected '{}': {}", command, reply);
        }
        debug!("Filter wheel at slot {}", slot);
        Ok(())
    }
}
