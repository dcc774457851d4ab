#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use core::convert::Infallible;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_storage::{ReadStorage, Storage};
use pill_dispenser::motor::{MotorDriver, STEPS_PER_REV, STEPS_PER_SLOT};
use pill_dispenser::platform::{Clock, Watchdog};
use pill_dispenser::{
    Dispenser, DispenserConfig, DropLatch, LinkConfig, Panel, PersistentStore, SensorMonitor,
    WirelessLink,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const EEPROM_SIZE: usize = 32 * 1024;

// same order as the driver's half step table
const HALF_STEP_SEQUENCE: [[bool; 4]; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

// ---------------------------------------------------------------------------------------------
// EEPROM

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
}

#[derive(Default)]
pub struct EepromState {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Address whose lowest bit does not stick on write, to provoke verify failures.
    pub flaky_address: Option<usize>,
}

/// Byte addressed EEPROM that lives on across simulated reboots. Clones share the same cells.
#[derive(Clone)]
pub struct Eeprom(Rc<RefCell<EepromState>>);

#[derive(Debug)]
pub struct EepromError;

impl Eeprom {
    pub fn new() -> Self {
        Self::with_size(EEPROM_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        Self(Rc::new(RefCell::new(EepromState {
            buf: vec![0xffu8; size],
            fail_after_operation: usize::MAX,
            ..Default::default()
        })))
    }

    pub fn new_with_fault(fail_after_operation: usize) -> Self {
        let eeprom = Self::new();
        eeprom.0.borrow_mut().fail_after_operation = fail_after_operation;
        eeprom
    }

    pub fn from_image(image: &[u8]) -> Self {
        let eeprom = Self::with_size(image.len());
        eeprom.0.borrow_mut().buf.copy_from_slice(image);
        eeprom
    }

    pub fn image(&self) -> Vec<u8> {
        self.0.borrow().buf.clone()
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.0.borrow().buf[offset..offset + len].to_vec()
    }

    pub fn flip_bit(&self, offset: usize, bit: u8) {
        self.0.borrow_mut().buf[offset] ^= 1 << bit;
    }

    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        self.0.borrow_mut().buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_flaky_address(&self, address: Option<usize>) {
        self.0.borrow_mut().flaky_address = address;
    }

    pub fn fail_after(&self, operations: usize) {
        let mut state = self.0.borrow_mut();
        state.fail_after_operation = state.operations.len() + operations;
    }

    pub fn disable_faults(&self) {
        self.0.borrow_mut().fail_after_operation = usize::MAX;
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.0.borrow().operations.clone()
    }

    pub fn writes(&self) -> usize {
        self.0
            .borrow()
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.0.borrow().operations {
            println!("  {:?}", op);
        }
    }
}

impl ReadStorage for Eeprom {
    type Error = EepromError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        if state.operations.len() >= state.fail_after_operation {
            println!("    eeprom: FAULT");
            return Err(EepromError);
        }
        state.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&state.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.0.borrow().buf.len()
    }
}

impl Storage for Eeprom {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        println!(
            "    eeprom: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            state.operations.len()
        );
        if state.operations.len() >= state.fail_after_operation {
            println!("    eeprom: FAULT");
            return Err(EepromError);
        }
        state.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        state.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(address) = state.flaky_address {
            if (offset..offset + bytes.len()).contains(&address) {
                state.buf[address] ^= 0x01;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Board: clock, watchdog, stepper model, optical mark, drop sensor, buttons, LED

pub struct HwState {
    pub now_ns: u64,
    pub feeds: usize,
    pub coils: [bool; 4],
    /// Half step phase the rotor follows, as last seen energized.
    pub phase: usize,
    /// Shaft position in half steps, never wrapped.
    pub position: i64,
    pub steps_since_stop: u32,
    pub motions: Vec<u32>,
    /// First half step of the optical mark within one revolution, `None` if it never shows.
    pub optical_mark: Option<u32>,
    pub optical_width: u32,
    /// Drop outcome per completed slot advance, `default_drop` once exhausted.
    pub drop_plan: VecDeque<bool>,
    pub default_drop: bool,
    pub calibrate_presses: Vec<(u64, u64)>,
    pub start_presses: Vec<(u64, u64)>,
    pub led: bool,
    pub led_toggles: usize,
    pub latch: &'static DropLatch,
}

impl HwState {
    pub fn now_ms(&self) -> u64 {
        self.now_ns / 1_000_000
    }

    fn optical_aligned(&self) -> bool {
        match self.optical_mark {
            Some(mark) => {
                let angle = self.position.rem_euclid(STEPS_PER_REV as i64) as u32;
                angle >= mark && angle < mark + self.optical_width
            }
            None => false,
        }
    }

    fn held(&self, presses: &[(u64, u64)]) -> bool {
        let now = self.now_ms();
        presses.iter().any(|&(from, to)| now >= from && now < to)
    }

    /// Called on every delay: the rotor follows the energized pattern.
    fn settle_rotor(&mut self) {
        let Some(phase) = HALF_STEP_SEQUENCE.iter().position(|p| *p == self.coils) else {
            return;
        };
        let len = HALF_STEP_SEQUENCE.len();
        if phase == (self.phase + 1) % len {
            self.position += 1;
            self.steps_since_stop += 1;
        } else if phase == (self.phase + len - 1) % len {
            self.position -= 1;
            self.steps_since_stop += 1;
        }
        self.phase = phase;
    }

    /// Called on every coil write: all coils off ends a motion.
    fn coils_changed(&mut self) {
        if self.coils.iter().any(|&c| c) || self.steps_since_stop == 0 {
            return;
        }

        let steps = self.steps_since_stop;
        self.motions.push(steps);
        self.steps_since_stop = 0;

        if steps == STEPS_PER_SLOT {
            let dropped = self.drop_plan.pop_front().unwrap_or(self.default_drop);
            if dropped {
                self.latch.signal();
            }
        }
    }
}

/// Simulated dispenser board. Every handle handed out shares the same state.
#[derive(Clone)]
pub struct Board(pub Rc<RefCell<HwState>>);

impl Board {
    pub fn new() -> Self {
        let latch: &'static DropLatch = Box::leak(Box::new(DropLatch::new()));
        Self(Rc::new(RefCell::new(HwState {
            now_ns: 0,
            feeds: 0,
            coils: [false; 4],
            phase: 0,
            position: 0,
            steps_since_stop: 0,
            motions: Vec::new(),
            optical_mark: Some(1000),
            optical_width: 16,
            drop_plan: VecDeque::new(),
            default_drop: true,
            calibrate_presses: Vec::new(),
            start_presses: Vec::new(),
            led: false,
            led_toggles: 0,
            latch,
        })))
    }

    pub fn latch(&self) -> &'static DropLatch {
        self.0.borrow().latch
    }

    pub fn now_ms(&self) -> u64 {
        self.0.borrow().now_ms()
    }

    pub fn feeds(&self) -> usize {
        self.0.borrow().feeds
    }

    pub fn position(&self) -> i64 {
        self.0.borrow().position
    }

    pub fn motions(&self) -> Vec<u32> {
        self.0.borrow().motions.clone()
    }

    pub fn coils(&self) -> [bool; 4] {
        self.0.borrow().coils
    }

    pub fn led(&self) -> bool {
        self.0.borrow().led
    }

    pub fn led_toggles(&self) -> usize {
        self.0.borrow().led_toggles
    }

    pub fn optical_aligned(&self) -> bool {
        self.0.borrow().optical_aligned()
    }

    pub fn set_optical_mark(&self, mark: Option<u32>) {
        self.0.borrow_mut().optical_mark = mark;
    }

    pub fn plan_drops(&self, drops: &[bool]) {
        self.0.borrow_mut().drop_plan.extend(drops.iter().copied());
    }

    pub fn set_default_drop(&self, dropped: bool) {
        self.0.borrow_mut().default_drop = dropped;
    }

    /// Holds the calibrate button from now on for `duration_ms`.
    pub fn press_calibrate(&self, duration_ms: u64) {
        let mut state = self.0.borrow_mut();
        let now = state.now_ms();
        state.calibrate_presses.push((now, now + duration_ms));
    }

    pub fn press_start(&self, duration_ms: u64) {
        let mut state = self.0.borrow_mut();
        let now = state.now_ms();
        state.start_presses.push((now, now + duration_ms));
    }

    /// A power cycle: the rotor keeps its angle, the driver restarts at phase 0.
    pub fn power_cycle(&self) {
        let mut state = self.0.borrow_mut();
        state.coils = [false; 4];
        state.phase = 0;
        state.steps_since_stop = 0;
        state.now_ns = 0;
        state.calibrate_presses.clear();
        state.start_presses.clear();
        state.latch.reset();
    }

    pub fn platform(&self) -> SimPlatform {
        SimPlatform(self.clone())
    }

    pub fn coils_pins(&self) -> [CoilPin; 4] {
        [0, 1, 2, 3].map(|index| CoilPin {
            board: self.clone(),
            index,
        })
    }

    pub fn optical_pin(&self) -> OpticalPin {
        OpticalPin(self.clone())
    }

    pub fn button_pin(&self, button: SimButton) -> ButtonPin {
        ButtonPin {
            board: self.clone(),
            button,
        }
    }

    pub fn led_pin(&self) -> LedPin {
        LedPin(self.clone())
    }
}

pub struct SimPlatform(Board);

impl DelayNs for SimPlatform {
    fn delay_ns(&mut self, ns: u32) {
        let mut state = self.0.0.borrow_mut();
        state.settle_rotor();
        state.now_ns += ns as u64;
    }
}

impl Clock for SimPlatform {
    fn now_ms(&self) -> u64 {
        self.0.now_ms()
    }
}

impl Watchdog for SimPlatform {
    fn feed(&mut self) {
        self.0.0.borrow_mut().feeds += 1;
    }
}

impl digital::ErrorType for CoilPin {
    type Error = Infallible;
}

pub struct CoilPin {
    board: Board,
    index: usize,
}

impl OutputPin for CoilPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut state = self.board.0.borrow_mut();
        state.coils[self.index] = false;
        state.coils_changed();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.board.0.borrow_mut().coils[self.index] = true;
        Ok(())
    }
}

/// Active low, like the real slotted opto interrupter output.
pub struct OpticalPin(Board);

impl digital::ErrorType for OpticalPin {
    type Error = Infallible;
}

impl InputPin for OpticalPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.0.borrow().optical_aligned())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.0.borrow().optical_aligned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimButton {
    Calibrate,
    Start,
}

pub struct ButtonPin {
    board: Board,
    button: SimButton,
}

impl digital::ErrorType for ButtonPin {
    type Error = Infallible;
}

impl InputPin for ButtonPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.is_low().map(|low| !low)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        let state = self.board.0.borrow();
        Ok(match self.button {
            SimButton::Calibrate => state.held(&state.calibrate_presses),
            SimButton::Start => state.held(&state.start_presses),
        })
    }
}

pub struct LedPin(Board);

impl digital::ErrorType for LedPin {
    type Error = Infallible;
}

impl OutputPin for LedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.0.borrow_mut();
        if state.led {
            state.led_toggles += 1;
        }
        state.led = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.0.borrow_mut();
        if !state.led {
            state.led_toggles += 1;
        }
        state.led = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// AT modem

struct Rule {
    prefix: String,
    lines: Vec<String>,
    remaining: Option<usize>,
}

#[derive(Default)]
pub struct ModemState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    rules: Vec<Rule>,
    pub commands: Vec<String>,
}

/// Scripted modem: every complete command line is answered by the first matching rule.
/// Commands without a rule stay unanswered.
#[derive(Clone, Default)]
pub struct Modem(pub Rc<RefCell<ModemState>>);

impl Modem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A modem that answers the whole bring-up and every uplink with success.
    pub fn cooperative() -> Self {
        let modem = Self::new();
        modem.respond("AT+MODE", &["+MODE: LWOTAA"]);
        modem.respond("AT+KEY", &["+KEY: APPKEY C24500F38E2104DEF45E59422DB86803"]);
        modem.respond("AT+CLASS", &["+CLASS: A"]);
        modem.respond("AT+PORT", &["+PORT: 8"]);
        modem.respond(
            "AT+JOIN",
            &[
                "+JOIN: Start",
                "+JOIN: NORMAL",
                "+JOIN: Network joined",
                "+JOIN: Done",
            ],
        );
        modem.respond("AT+MSG", &["+MSG: Start", "+MSG: Done"]);
        modem.respond("AT", &["+AT: OK"]);
        modem
    }

    /// Answers every command starting with `prefix`.
    pub fn respond(&self, prefix: &str, lines: &[&str]) {
        self.add_rule(prefix, lines, None);
    }

    /// Answers the next `times` commands starting with `prefix`, ahead of any standing rule.
    pub fn respond_times(&self, prefix: &str, lines: &[&str], times: usize) {
        self.add_rule(prefix, lines, Some(times));
    }

    /// Queues bytes as if the modem had printed them unprompted.
    pub fn unsolicited(&self, text: &str) {
        self.0.borrow_mut().rx.extend(text.bytes());
    }

    pub fn commands(&self) -> Vec<String> {
        self.0.borrow().commands.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| {
                c.strip_prefix("AT+MSG=\"")
                    .and_then(|m| m.strip_suffix('"'))
                    .map(str::to_owned)
            })
            .collect()
    }

    fn add_rule(&self, prefix: &str, lines: &[&str], remaining: Option<usize>) {
        let rule = Rule {
            prefix: prefix.to_owned(),
            lines: lines.iter().map(|&l| l.to_owned()).collect(),
            remaining,
        };
        let mut state = self.0.borrow_mut();
        if remaining.is_some() {
            state.rules.insert(0, rule);
        } else {
            state.rules.push(rule);
        }
    }
}

impl ModemState {
    fn command_complete(&mut self, command: String) {
        println!("    modem: <- {command}");
        let rule = self.rules.iter_mut().find(|rule| {
            command.starts_with(rule.prefix.as_str()) && rule.remaining != Some(0)
        });
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            for line in &rule.lines {
                println!("    modem: -> {line}");
                self.rx.extend(line.bytes());
                self.rx.extend(b"\r\n");
            }
        }
        self.commands.push(command);
    }
}

impl embedded_io::ErrorType for Modem {
    type Error = Infallible;
}

impl embedded_io::Read for Modem {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl embedded_io::ReadReady for Modem {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.borrow().rx.is_empty())
    }
}

impl embedded_io::Write for Modem {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.0.borrow_mut();
        for &byte in buf {
            state.tx.push(byte);
            if state.tx.ends_with(b"\r\n") {
                let len = state.tx.len() - 2;
                let command = String::from_utf8_lossy(&state.tx[..len]).into_owned();
                state.tx.clear();
                state.command_complete(command);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------------
// Assembled dispenser

pub type SimDispenser = Dispenser<
    'static,
    SimPlatform,
    Eeprom,
    Modem,
    CoilPin,
    OpticalPin,
    ButtonPin,
    LedPin,
>;

/// Wires a controller to `board`, `eeprom` and `modem` with the default configuration.
pub fn dispenser(board: &Board, eeprom: &Eeprom, modem: &Modem) -> SimDispenser {
    dispenser_with(board, eeprom, modem, DispenserConfig::default())
}

pub fn dispenser_with(
    board: &Board,
    eeprom: &Eeprom,
    modem: &Modem,
    config: DispenserConfig,
) -> SimDispenser {
    let motor = MotorDriver::new(board.coils_pins());
    let sensors = SensorMonitor::new(board.optical_pin(), board.latch());
    let store = PersistentStore::new(eeprom.clone()).unwrap();
    let link = WirelessLink::new(modem.clone(), LinkConfig::default());
    let panel = Panel::new(
        board.button_pin(SimButton::Calibrate),
        board.button_pin(SimButton::Start),
        board.led_pin(),
        config.debounce_ms,
    );
    Dispenser::new(
        board.platform(),
        motor,
        sensors,
        store,
        link,
        panel,
        config,
    )
}
