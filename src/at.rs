//! Line oriented AT command exchanges over a blocking serial port.

use crate::error::LinkError;
use crate::platform::{Deadline, Platform};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use embedded_io::{Read, ReadReady, Write};
use heapless::Vec;

/// Phrases the modem prints when a command failed for good, no need to wait for the timeout.
pub const FAILURE_MARKERS: [&str; 2] = ["Join failed", "Please join"];

pub const LINE_BUFFER_SIZE: usize = 256;
const RX_POLL_INTERVAL_MS: u32 = 1;

/// Command/response engine on top of the modem UART.
pub struct AtPort<U> {
    serial: U,
    line: Vec<u8, LINE_BUFFER_SIZE>,
}

impl<U: Read + Write + ReadReady> AtPort<U> {
    pub fn new(serial: U) -> Self {
        Self {
            serial,
            line: Vec::new(),
        }
    }

    /// Sends `command` and waits until a response line contains `expected`.
    ///
    /// Lines carrying one of the [`FAILURE_MARKERS`] end the exchange with
    /// [`LinkError::Rejected`], running out of time ends it with [`LinkError::Timeout`].
    /// Unrelated lines are skipped.
    pub fn exchange<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        command: &str,
        expected: &str,
        timeout_ms: u32,
    ) -> Result<(), LinkError> {
        self.drain()?;
        self.send_line(command)?;

        let deadline = Deadline::start(&*platform, timeout_ms);
        while let Some(line) = self.read_line(platform, &deadline)? {
            if line.contains(expected) {
                #[cfg(feature = "defmt")]
                trace!("at: {} -> {}", command, line);
                return Ok(());
            }
            if FAILURE_MARKERS.iter().any(|marker| line.contains(marker)) {
                #[cfg(feature = "defmt")]
                warn!("at: {} rejected: {}", command, line);
                return Err(LinkError::Rejected);
            }
        }

        #[cfg(feature = "defmt")]
        warn!("at: timeout waiting for {}", expected);
        Err(LinkError::Timeout)
    }

    /// Throws away whatever is pending in the receive buffer.
    pub fn drain(&mut self) -> Result<(), LinkError> {
        let mut scratch = [0u8; 16];
        while self.serial.read_ready().map_err(|_| LinkError::Serial)? {
            let n = self
                .serial
                .read(&mut scratch)
                .map_err(|_| LinkError::Serial)?;
            if n == 0 {
                break;
            }
        }
        self.line.clear();
        Ok(())
    }

    fn send_line(&mut self, command: &str) -> Result<(), LinkError> {
        self.serial
            .write_all(command.as_bytes())
            .and_then(|()| self.serial.write_all(b"\r\n"))
            .and_then(|()| self.serial.flush())
            .map_err(|_| LinkError::Serial)
    }

    /// Collects bytes up to a newline. Returns the line without its line ending, or `None` once
    /// the deadline passed. The watchdog is fed on every idle poll.
    fn read_line<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        deadline: &Deadline,
    ) -> Result<Option<&str>, LinkError> {
        self.line.clear();

        loop {
            if deadline.expired(&*platform) {
                return Ok(None);
            }

            if !self.serial.read_ready().map_err(|_| LinkError::Serial)? {
                platform.delay_ms(RX_POLL_INTERVAL_MS);
                platform.feed();
                continue;
            }

            let mut byte = [0u8; 1];
            if self
                .serial
                .read(&mut byte)
                .map_err(|_| LinkError::Serial)?
                == 0
            {
                continue;
            }

            if byte[0] == b'\n' || self.line.push(byte[0]).is_err() {
                break;
            }
        }

        let text = core::str::from_utf8(&self.line).unwrap_or("");
        Ok(Some(text.trim_end_matches(['\r', '\n'])))
    }

    pub fn release(self) -> U {
        self.serial
    }
}
