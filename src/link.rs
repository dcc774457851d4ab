//! LoRaWAN status uplink through an AT command modem (Wio-E5 style command set).

use crate::at::AtPort;
use crate::error::LinkError;
use crate::platform::{Platform, sleep_alive};
use crate::raw::TOTAL_SLOTS;
use crate::record::DispensingRecord;
use core::fmt::Write as _;
#[cfg(feature = "defmt")]
use defmt::{debug, info, warn};
use embedded_io::{Read, ReadReady, Write};
use heapless::String;

/// Longest command the modem accepts, `AT+MSG="..."` included.
pub const MAX_COMMAND_LENGTH: usize = 128;
pub const MAX_MESSAGE_LENGTH: usize = MAX_COMMAND_LENGTH - 10;

const SETTLE_QUANTUM_MS: u32 = 100;

/// Connectivity as seen by the firmware. Rebuilt on every boot, a radio session does not
/// survive a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What a status uplink reports. The string form is the tag in the message text.
#[derive(strum::IntoStaticStr, strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    #[strum(serialize = "BOOT")]
    Boot,
    #[strum(serialize = "CALIB_OK")]
    CalibrationOk,
    #[strum(serialize = "CALIB_FAIL")]
    CalibrationFailed,
    #[strum(serialize = "PILL_OK")]
    PillOk,
    #[strum(serialize = "PILL_FAIL")]
    PillMissed,
    /// Sent as the `[SUMMARY]` line instead of a per-event line.
    #[strum(serialize = "SUMMARY")]
    CycleComplete,
    #[strum(serialize = "PWR_FAIL")]
    PowerFail,
    #[strum(serialize = "EVENT")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Time the modem needs after power-up before it answers.
    pub settle_ms: u32,
    pub probe_attempts: u8,
    pub probe_gap_ms: u32,
    /// Timeout of the probe and configuration exchanges.
    pub short_timeout_ms: u32,
    pub join_attempts: u8,
    pub join_timeout_ms: u32,
    pub join_gap_ms: u32,
    pub send_timeout_ms: u32,
    pub app_key: &'static str,
    pub class: char,
    pub port: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            settle_ms: 4000,
            probe_attempts: 3,
            probe_gap_ms: 500,
            short_timeout_ms: 2000,
            join_attempts: 2,
            join_timeout_ms: 20_000,
            join_gap_ms: 2000,
            send_timeout_ms: 15_000,
            app_key: "c24500f38e2104def45e59422db86803",
            class: 'A',
            port: 8,
        }
    }
}

pub struct WirelessLink<U> {
    port: AtPort<U>,
    state: LinkState,
    config: LinkConfig,
}

impl<U: Read + Write + ReadReady> WirelessLink<U> {
    pub fn new(serial: U, config: LinkConfig) -> Self {
        Self {
            port: AtPort::new(serial),
            state: LinkState::Disconnected,
            config,
        }
    }

    pub fn current_state(&self) -> LinkState {
        self.state
    }

    /// Waits for the modem to boot, then probes it with `AT`.
    ///
    /// Ends in [`LinkState::Disconnected`] if it answered, [`LinkState::Error`] if it did not.
    pub fn initialize<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Result<(), LinkError> {
        sleep_alive(platform, self.config.settle_ms, SETTLE_QUANTUM_MS);

        for attempt in 0..self.config.probe_attempts {
            match self
                .port
                .exchange(platform, "AT", "OK", self.config.short_timeout_ms)
            {
                Ok(()) => {
                    #[cfg(feature = "defmt")]
                    info!("link: modem answered probe {}", attempt + 1);
                    self.state = LinkState::Disconnected;
                    return Ok(());
                }
                Err(LinkError::Serial) => break,
                Err(_) => {}
            }

            if attempt + 1 < self.config.probe_attempts {
                sleep_alive(platform, self.config.probe_gap_ms, SETTLE_QUANTUM_MS);
            }
        }

        #[cfg(feature = "defmt")]
        warn!("link: modem init failed");
        self.state = LinkState::Error;
        Err(LinkError::InitFailed)
    }

    /// Configures OTAA mode, app key, class and port, then tries to join.
    ///
    /// Does nothing if already connected. Any failing configuration step aborts; a failed
    /// join is retried once after a pause. Failure leaves the link
    /// [`Disconnected`](LinkState::Disconnected).
    pub fn join_network<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
    ) -> Result<(), LinkError> {
        if self.state == LinkState::Connected {
            return Ok(());
        }
        self.state = LinkState::Connecting;

        if let Err(e) = self.configure(platform) {
            self.state = LinkState::Disconnected;
            return Err(e);
        }

        let mut result = Err(LinkError::Timeout);
        for attempt in 0..self.config.join_attempts {
            #[cfg(feature = "defmt")]
            info!("link: join attempt {}/{}", attempt + 1, self.config.join_attempts);

            result = self
                .port
                .exchange(platform, "AT+JOIN", "Done", self.config.join_timeout_ms);
            if result.is_ok() {
                self.state = LinkState::Connected;
                return Ok(());
            }

            if attempt + 1 < self.config.join_attempts {
                sleep_alive(platform, self.config.join_gap_ms, SETTLE_QUANTUM_MS);
            }
        }

        #[cfg(feature = "defmt")]
        warn!("link: join failed after {} attempts", self.config.join_attempts);
        self.state = LinkState::Disconnected;
        result
    }

    /// Sends one status line for `event`. Only possible while connected.
    ///
    /// Never blocks longer than the send timeout, a missing acknowledgement is just an error.
    pub fn send_status<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        event: EventKind,
        record: &DispensingRecord,
    ) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }

        let message = format_status(event, record, platform.uptime_secs())?;

        #[cfg(feature = "defmt")]
        debug!("link: sending {}", message.as_str());

        let mut command: String<MAX_COMMAND_LENGTH> = String::new();
        write!(command, "AT+MSG=\"{message}\"").map_err(|_| LinkError::PayloadTooLong)?;

        self.port
            .exchange(platform, &command, "Done", self.config.send_timeout_ms)
    }

    pub fn release(self) -> U {
        self.port.release()
    }

    fn configure<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Result<(), LinkError> {
        let timeout = self.config.short_timeout_ms;
        let mut command: String<MAX_COMMAND_LENGTH> = String::new();

        self.port
            .exchange(platform, "AT+MODE=LWOTAA", "LWOTAA", timeout)?;

        write!(command, "AT+KEY=APPKEY,\"{}\"", self.config.app_key)
            .map_err(|_| LinkError::PayloadTooLong)?;
        self.port.exchange(platform, &command, "KEY", timeout)?;

        let mut class = [0u8; 4];
        let class = self.config.class.encode_utf8(&mut class);
        command.clear();
        write!(command, "AT+CLASS={class}").map_err(|_| LinkError::PayloadTooLong)?;
        self.port.exchange(platform, &command, class, timeout)?;

        let mut port: String<3> = String::new();
        write!(port, "{}", self.config.port).map_err(|_| LinkError::PayloadTooLong)?;
        command.clear();
        write!(command, "AT+PORT={port}").map_err(|_| LinkError::PayloadTooLong)?;
        self.port.exchange(platform, &command, &port, timeout)
    }
}

/// Builds the uplink text.
///
/// * per event: `[<EVENT>] Time:<uptime>s Slot:<n> Left:<n>`
/// * cycle complete: `[SUMMARY] Time:<uptime>s OK:<n> Fail:<n> Status:Refilling`
pub fn format_status(
    event: EventKind,
    record: &DispensingRecord,
    uptime_secs: u32,
) -> Result<String<MAX_MESSAGE_LENGTH>, LinkError> {
    let mut message = String::new();

    let written = match event {
        EventKind::CycleComplete => {
            let ok = record.success_count();
            write!(
                message,
                "[SUMMARY] Time:{uptime_secs}s OK:{ok} Fail:{} Status:Refilling",
                TOTAL_SLOTS - ok
            )
        }
        _ => write!(
            message,
            "[{event}] Time:{uptime_secs}s Slot:{} Left:{}",
            record.current_slot(),
            record.pills_left
        ),
    };

    written.map_err(|_| LinkError::PayloadTooLong)?;
    Ok(message)
}
