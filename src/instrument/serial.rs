//! Line-oriented serial links for the ASCII-protocol instruments.
//!
//! [`SerialLink`] is the seam drivers talk through. [`SerialPortLink`] wraps the
//! `serialport` crate and runs the blocking I/O on Tokio's blocking executor; tests
//! substitute a scripted link.

use anyhow::Result;
use async_trait::async_trait;

/// Request/response text transport.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Send `command` and return the trimmed reply.
    async fn query(&self, command: &str) -> Result<String>;
}

/// Line framing of one instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Appended to every command.
    pub terminator: &'static str,
    /// Last byte of every reply.
    pub delimiter: u8,
}

impl Framing {
    /// Commands end in CR, replies in LF.
    pub const CR_LF: Framing = Framing {
        terminator: "\r",
        delimiter: b'\n',
    };
    /// Commands end in CR, replies end at the `>` prompt.
    pub const PROMPT: Framing = Framing {
        terminator: "\r",
        delimiter: b'>',
    };
}

#[cfg(feature = "instrument_serial")]
pub use port::SerialPortLink;

#[cfg(feature = "instrument_serial")]
mod port {
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, bail, Context, Result};
    use async_trait::async_trait;
    use serialport::SerialPort;
    use tokio::sync::Mutex;
    use tracing::debug;

    use super::{Framing, SerialLink};
    use crate::config::DeviceLink;

    /// Serial port opened through the `serialport` crate.
    pub struct SerialPortLink {
        port_name: String,
        framing: Framing,
        timeout: Duration,
        port: Arc<Mutex<Box<dyn SerialPort>>>,
    }

    impl std::fmt::Debug for SerialPortLink {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialPortLink")
                .field("port_name", &self.port_name)
                .field("framing", &self.framing)
                .finish()
        }
    }

    impl SerialPortLink {
        /// Open the port named in `link`.
        pub fn open(link: &DeviceLink, framing: Framing) -> Result<Self> {
            let port_name = link
                .port
                .clone()
                .ok_or_else(|| anyhow!("no serial port configured"))?;
            let port = serialport::new(&port_name, link.baud_rate)
                .timeout(Duration::from_millis(100)) // Internal read timeout
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        port_name, link.baud_rate
                    )
                })?;
            debug!("Serial port '{}' opened at {} baud", port_name, link.baud_rate);
            Ok(Self {
                port_name,
                framing,
                timeout: link.timeout,
                port: Arc::new(Mutex::new(port)),
            })
        }
    }

    #[async_trait]
    impl SerialLink for SerialPortLink {
        async fn query(&self, command: &str) -> Result<String> {
            let framed = format!("{}{}", command, self.framing.terminator);
            let command_for_log = command.to_string();
            let delimiter = self.framing.delimiter;
            let timeout = self.timeout;
            let port = self.port.clone();
            let port_name = self.port_name.clone();

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> Result<String> {
                let mut port = port.blocking_lock();
                port.write_all(framed.as_bytes())
                    .context("Failed to write to serial port")?;
                port.flush().context("Failed to flush serial port")?;
                debug!("{} <- {}", port_name, command_for_log);

                let mut response = Vec::new();
                let mut byte = [0u8; 1];
                let start = Instant::now();
                loop {
                    if start.elapsed() > timeout {
                        bail!("Serial read timeout after {:?}", timeout);
                    }
                    match port.read(&mut byte) {
                        Ok(1) => {
                            response.push(byte[0]);
                            if byte[0] == delimiter {
                                break;
                            }
                        }
                        Ok(_) => bail!("Unexpected EOF on {}", port_name),
                        // Port timeout is shorter than our overall timeout
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                    }
                }
                let response = String::from_utf8_lossy(&response).trim().to_string();
                debug!("{} -> {}", port_name, response);
                Ok(response)
            })
            .await
            .context("Serial I/O task panicked")?
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::SerialLink;

    /// Records commands; replies come from prefix rules or default to `:A`.
    #[derive(Clone, Default)]
    pub struct ScriptedLink {
        sent: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<HashMap<String, Vec<String>>>>,
        failing: Arc<Mutex<Option<String>>>,
    }

    impl ScriptedLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue replies for commands starting with `prefix`; the last one repeats.
        pub fn reply(&self, prefix: &str, replies: &[&str]) {
            self.replies.lock().insert(
                prefix.to_string(),
                replies.iter().map(|r| r.to_string()).collect(),
            );
        }

        /// Fail every command starting with `prefix`.
        pub fn fail_on(&self, prefix: &str) {
            *self.failing.lock() = Some(prefix.to_string());
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SerialLink for ScriptedLink {
        async fn query(&self, command: &str) -> Result<String> {
            self.sent.lock().push(command.to_string());
            if let Some(prefix) = self.failing.lock().as_deref() {
                if command.starts_with(prefix) {
                    bail!("scripted failure on '{}'", command);
                }
            }
            let mut replies = self.replies.lock();
            let rule = replies
                .iter_mut()
                .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            Ok(match rule {
                Some((_, queue)) if queue.len() > 1 => queue.remove(0),
                Some((_, queue)) => queue.first().cloned().unwrap_or_default(),
                None => ":A".to_string(),
            })
        }
    }
}
