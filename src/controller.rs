//! Top level dispensing state machine.
//!
//! The controller owns every component and the in-memory [`DispensingRecord`]. Anything that
//! moves the wheel is bracketed by two saves of the record: `rotating` is persisted as `true`
//! before the first step and as `false` after the coils are off again. Finding it `true` at boot
//! means power was lost mid-motion, so the wheel position is unknown and homing is forced.

use crate::error::MotorError;
use crate::link::{EventKind, LinkState, WirelessLink};
use crate::motor::MotorDriver;
use crate::panel::{Button, Panel};
use crate::platform::{Clock, Deadline, Platform};
use crate::record::{DispensingRecord, ErrorFlags};
use crate::sensor::SensorMonitor;
use crate::store::PersistentStore;
use core::fmt::{self, Write as _};
#[cfg(feature = "defmt")]
use defmt::{error, info, warn};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_io::{Read, ReadReady, Write};
use embedded_storage::Storage;
use heapless::String;

const JOURNAL_LINE_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispenserConfig {
    /// Wait between two slots unless the start button skips it.
    pub dispense_interval_ms: u32,
    /// Indicator toggle period while waiting for calibration.
    pub blink_interval_ms: u32,
    /// How long a pill may take to hit the vibration sensor.
    pub drop_timeout_ms: u32,
    pub debounce_ms: u32,
    pub error_blinks: u32,
    pub error_blink_ms: u32,
    /// Sleep per pass of the idle states.
    pub idle_poll_ms: u32,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            dispense_interval_ms: 30_000,
            blink_interval_ms: 500,
            drop_timeout_ms: 1000,
            debounce_ms: 50,
            error_blinks: 5,
            error_blink_ms: 200,
            idle_poll_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    WaitForCalibration,
    Calibrating,
    WaitForStart,
    Dispensing,
    HandleError,
    SleepInterval,
    /// Never entered on purpose, leads straight back to [`State::WaitForCalibration`].
    Done,
}

pub struct Dispenser<'a, P, S, U, M, O, B, L>
where
    S: Storage,
    M: OutputPin,
    O: InputPin,
{
    platform: P,
    motor: MotorDriver<M>,
    sensors: SensorMonitor<'a, O>,
    store: PersistentStore<S>,
    link: WirelessLink<U>,
    panel: Panel<B, L>,
    config: DispenserConfig,
    record: DispensingRecord,
    state: State,
    blink: Deadline,
    next_dispense: Deadline,
}

impl<'a, P, S, U, M, O, B, L> Dispenser<'a, P, S, U, M, O, B, L>
where
    P: Platform,
    S: Storage,
    U: Read + Write + ReadReady,
    M: OutputPin,
    O: InputPin,
    B: InputPin,
    L: OutputPin,
{
    pub fn new(
        platform: P,
        motor: MotorDriver<M>,
        sensors: SensorMonitor<'a, O>,
        store: PersistentStore<S>,
        link: WirelessLink<U>,
        panel: Panel<B, L>,
        config: DispenserConfig,
    ) -> Self {
        let blink = Deadline::start(&platform, config.blink_interval_ms);
        let next_dispense = Deadline::start(&platform, config.dispense_interval_ms);
        Self {
            platform,
            motor,
            sensors,
            store,
            link,
            panel,
            config,
            record: DispensingRecord::new(),
            state: State::WaitForCalibration,
            blink,
            next_dispense,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn record(&self) -> &DispensingRecord {
        &self.record
    }

    pub fn link_state(&self) -> LinkState {
        self.link.current_state()
    }

    /// Boots and then runs the control loop forever.
    pub fn run(&mut self) -> ! {
        self.boot();
        loop {
            self.tick();
        }
    }

    /// Everything that happens once before the control loop:
    ///
    /// 1. emergency reset if the calibrate button is held
    /// 2. load the record, falling back to defaults
    /// 3. bring up the radio link (best effort)
    /// 4. recover from an interrupted rotation
    pub fn boot(&mut self) -> State {
        if let Err(_e) = self.motor.initialize() {
            #[cfg(feature = "defmt")]
            error!("boot: motor init failed: {}", _e);
        }

        if self.panel.is_held(Button::Calibrate) {
            self.emergency_reset();
        }

        let loaded = match self.store.load() {
            Ok(record) => {
                self.record = record;
                true
            }
            Err(_) => {
                self.record = self.store.initialize_default();
                false
            }
        };

        self.bring_up_link();

        self.state = self.restore(loaded);
        self.blink = Deadline::start(&self.platform, self.config.blink_interval_ms);
        self.state
    }

    /// One pass of the control loop: runs the current state and moves to the next one.
    pub fn tick(&mut self) -> State {
        self.platform.feed();

        let next = match self.state {
            State::WaitForCalibration => self.wait_for_calibration(),
            State::Calibrating => self.calibrate(),
            State::WaitForStart => self.wait_for_start(),
            State::Dispensing => self.dispense(),
            State::HandleError => self.handle_error(),
            State::SleepInterval => self.sleep_interval(),
            State::Done => State::WaitForCalibration,
        };

        #[cfg(feature = "defmt")]
        {
            if next != self.state {
                info!("controller: {} -> {}", self.state, next);
            }
        }

        self.state = next;
        next
    }

    fn restore(&mut self, loaded: bool) -> State {
        if !loaded {
            journal(
                &mut self.store,
                &self.platform,
                format_args!("boot: defaults, {} pills", self.record.pills_left),
            );
            return State::WaitForCalibration;
        }

        if self.record.rotating {
            #[cfg(feature = "defmt")]
            warn!("boot: power lost during rotation, recalibrating");

            self.record.error_flags.insert(ErrorFlags::TURNING_INTERRUPTED);
            self.record.rotating = false;
            self.persist();
            self.notify(EventKind::PowerFail);
            journal(
                &mut self.store,
                &self.platform,
                format_args!("boot: rotation interrupted, {} left", self.record.pills_left),
            );
            return State::Calibrating;
        }

        if self.record.pills_left == 0 {
            // power was lost between the last slot and the refill
            self.record.reset_cycle();
            self.persist();
            journal(&mut self.store, &self.platform, format_args!("boot: empty wheel, refilled"));
            return State::WaitForCalibration;
        }

        journal(
            &mut self.store,
            &self.platform,
            format_args!(
                "boot: restored, {} left, flags {:#04x}",
                self.record.pills_left,
                self.record.error_flags.bits()
            ),
        );
        State::WaitForCalibration
    }

    fn wait_for_calibration(&mut self) -> State {
        if self.blink.expired(&self.platform) {
            self.panel.toggle_indicator();
            self.blink = Deadline::start(&self.platform, self.config.blink_interval_ms);
        }

        if self.panel.pressed(&mut self.platform, Button::Calibrate) {
            self.panel.set_indicator(false);
            return State::Calibrating;
        }

        self.platform.delay_ms(self.config.idle_poll_ms);
        State::WaitForCalibration
    }

    fn calibrate(&mut self) -> State {
        self.record.rotating = true;
        self.persist();

        let homed = self.motor.calibrate(&mut self.platform, &mut self.sensors);

        self.record.rotating = false;
        match homed {
            Ok(()) => {
                self.record.calibrated = true;
                self.record.error_flags.remove(ErrorFlags::CALIB_FAIL);
                self.persist();
                journal(&mut self.store, &self.platform, format_args!("calibration ok"));
                self.notify(EventKind::CalibrationOk);
                State::WaitForStart
            }
            Err(e) => {
                self.record.error_flags.insert(ErrorFlags::CALIB_FAIL);
                if e == MotorError::SensorNotFound {
                    self.record.error_flags.insert(ErrorFlags::MOTOR_STUCK);
                }
                self.persist();
                journal(&mut self.store, &self.platform, format_args!("calibration failed: {e}"));
                self.notify(EventKind::CalibrationFailed);
                self.panel.blink(
                    &mut self.platform,
                    self.config.error_blinks,
                    self.config.error_blink_ms,
                );
                State::WaitForCalibration
            }
        }
    }

    fn wait_for_start(&mut self) -> State {
        self.panel.set_indicator(true);
        if self.panel.pressed(&mut self.platform, Button::Start) {
            return State::Dispensing;
        }

        self.platform.delay_ms(self.config.idle_poll_ms);
        State::WaitForStart
    }

    fn dispense(&mut self) -> State {
        self.panel.set_indicator(true);

        if self.record.pills_left == 0 {
            return self.complete_cycle();
        }

        self.record.rotating = true;
        self.persist();

        self.sensors.reset_drop_latch();
        let moved = self.motor.advance_one_slot(&mut self.platform);

        self.record.rotating = false;
        self.record.pills_left = self.record.pills_left.saturating_sub(1);
        if moved.is_err() {
            self.record.error_flags.insert(ErrorFlags::MOTOR_STUCK);
        }
        self.persist();

        let dropped = self
            .sensors
            .wait_for_drop(&mut self.platform, self.config.drop_timeout_ms);
        self.record.record_outcome(dropped);
        self.persist();

        let slot = self.record.current_slot();
        let left = self.record.pills_left;
        if dropped {
            journal(
                &mut self.store,
                &self.platform,
                format_args!("slot {slot} dispensed, {left} left"),
            );
            self.notify(EventKind::PillOk);
        } else {
            journal(
                &mut self.store,
                &self.platform,
                format_args!("slot {slot} missed, {left} left"),
            );
            self.notify(EventKind::PillMissed);
        }

        if self.record.pills_left == 0 {
            self.complete_cycle()
        } else if !dropped {
            State::HandleError
        } else {
            self.next_dispense = Deadline::start(&self.platform, self.config.dispense_interval_ms);
            State::SleepInterval
        }
    }

    fn complete_cycle(&mut self) -> State {
        journal(
            &mut self.store,
            &self.platform,
            format_args!(
                "cycle complete: ok {} fail {}",
                self.record.success_count(),
                self.record.fail_count()
            ),
        );
        self.notify(EventKind::CycleComplete);

        self.record.reset_cycle();
        self.persist();
        State::WaitForCalibration
    }

    fn handle_error(&mut self) -> State {
        self.panel.blink(
            &mut self.platform,
            self.config.error_blinks,
            self.config.error_blink_ms,
        );
        self.next_dispense = Deadline::start(&self.platform, self.config.dispense_interval_ms);
        State::SleepInterval
    }

    fn sleep_interval(&mut self) -> State {
        self.panel.set_indicator(true);
        if self.next_dispense.expired(&self.platform)
            || self.panel.pressed(&mut self.platform, Button::Start)
        {
            return State::Dispensing;
        }

        self.platform.delay_ms(self.config.idle_poll_ms);
        State::SleepInterval
    }

    /// Writes a fresh default record, then waits for the button to be let go.
    fn emergency_reset(&mut self) {
        #[cfg(feature = "defmt")]
        warn!("boot: emergency reset");

        self.panel.blink(&mut self.platform, 5, 100);
        self.record = self.store.initialize_default();
        while self.panel.is_held(Button::Calibrate) {
            self.platform.feed();
            self.platform.delay_ms(self.config.idle_poll_ms);
        }
        journal(&mut self.store, &self.platform, format_args!("emergency reset"));
    }

    fn bring_up_link(&mut self) {
        if let Err(_e) = self.link.initialize(&mut self.platform) {
            #[cfg(feature = "defmt")]
            warn!("link: init failed, running offline: {}", _e);
            return;
        }

        match self.link.join_network(&mut self.platform) {
            Ok(()) => {
                self.notify(EventKind::Boot);
                self.panel.flash(&mut self.platform, 1000);
            }
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("link: join failed, running offline: {}", _e);
                self.panel.blink(&mut self.platform, 3, 100);
            }
        }
    }

    /// Saves the record. A failed verification is reported, not retried.
    fn persist(&mut self) {
        if let Err(_e) = self.store.save(&self.record) {
            #[cfg(feature = "defmt")]
            error!("controller: record not persisted: {}", _e);
        }
    }

    /// Best effort uplink, skipped entirely while offline.
    fn notify(&mut self, event: EventKind) {
        if self.link.current_state() != LinkState::Connected {
            return;
        }
        if let Err(_e) = self.link.send_status(&mut self.platform, event, &self.record) {
            #[cfg(feature = "defmt")]
            warn!("link: {} not sent: {}", event, _e);
        }
    }
}

/// Appends a timestamped line to the EEPROM log ring.
fn journal<S: Storage, C: Clock>(
    store: &mut PersistentStore<S>,
    clock: &C,
    args: fmt::Arguments<'_>,
) {
    let mut line: String<JOURNAL_LINE_LENGTH> = String::new();
    // overlong lines are cut by the store anyway
    let _ = write!(line, "[{}s] ", clock.uptime_secs());
    let _ = line.write_fmt(args);

    if let Err(_e) = store.append_log(&line) {
        #[cfg(feature = "defmt")]
        warn!("controller: log append failed: {}", _e);
    }
}
