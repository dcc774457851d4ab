use crate::raw::{RECORD_MAGIC, TOTAL_SLOTS};
use core::fmt;

/// Sticky diagnostic bits. They accumulate over a dispensing cycle and are only cleared
/// wholesale once the cycle completes.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub const NONE: ErrorFlags = ErrorFlags(0x00);
    pub const MOTOR_STUCK: ErrorFlags = ErrorFlags(0x01);
    pub const POWER_FAIL: ErrorFlags = ErrorFlags(0x02);
    pub const NO_PILL: ErrorFlags = ErrorFlags(0x04);
    pub const CALIB_FAIL: ErrorFlags = ErrorFlags(0x08);
    /// Power was lost while the wheel was turning.
    pub const TURNING_INTERRUPTED: ErrorFlags = ErrorFlags(0x10);

    const NAMES: [(ErrorFlags, &'static str); 5] = [
        (Self::MOTOR_STUCK, "MOTOR_STUCK"),
        (Self::POWER_FAIL, "POWER_FAIL"),
        (Self::NO_PILL, "NO_PILL"),
        (Self::CALIB_FAIL, "CALIB_FAIL"),
        (Self::TURNING_INTERRUPTED, "TURNING_INTERRUPTED"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ErrorFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ErrorFlags) {
        self.0 &= !other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::ops::BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ErrorFlags(NONE)");
        }

        write!(f, "ErrorFlags(")?;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        let unknown = self.0 & !Self::NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0);
        if unknown != 0 {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{unknown:#04x}")?;
        }
        write!(f, ")")
    }
}

/// Outcome of one slot in the current cycle.
#[derive(strum::FromRepr, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SlotOutcome {
    /// Not reached yet in this cycle, or no drop was detected.
    Missed = 0,
    Dispensed = 1,
}

/// The single persisted entity. Every save replaces it as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DispensingRecord {
    pub magic: u32,
    pub pills_left: u8,
    pub calibrated: bool,
    pub total_dispensed: u16,
    pub total_cycles: u16,
    pub error_flags: ErrorFlags,
    /// Crash marker, true strictly while the motor is moving.
    pub rotating: bool,
    pub dispense_log: [SlotOutcome; TOTAL_SLOTS],
}

impl Default for DispensingRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl DispensingRecord {
    /// A fresh record for a full wheel that has never been homed.
    pub const fn new() -> Self {
        Self {
            magic: RECORD_MAGIC,
            pills_left: TOTAL_SLOTS as u8,
            calibrated: false,
            total_dispensed: 0,
            total_cycles: 0,
            error_flags: ErrorFlags::NONE,
            rotating: false,
            dispense_log: [SlotOutcome::Missed; TOTAL_SLOTS],
        }
    }

    /// Zero based index of the slot the next dispense presents, `TOTAL_SLOTS` once empty.
    pub fn current_slot(&self) -> usize {
        TOTAL_SLOTS.saturating_sub(self.pills_left as usize)
    }

    pub fn success_count(&self) -> usize {
        self.dispense_log
            .iter()
            .filter(|&&outcome| outcome == SlotOutcome::Dispensed)
            .count()
    }

    pub fn fail_count(&self) -> usize {
        TOTAL_SLOTS - self.success_count()
    }

    /// Books the outcome of the slot that was just presented. `pills_left` must already be
    /// decremented for it.
    pub fn record_outcome(&mut self, dropped: bool) {
        if dropped {
            self.error_flags.remove(ErrorFlags::NO_PILL);
            self.total_dispensed = self.total_dispensed.saturating_add(1);
        } else {
            self.error_flags.insert(ErrorFlags::NO_PILL);
        }

        if let Some(slot) = self.current_slot().checked_sub(1) {
            if let Some(entry) = self.dispense_log.get_mut(slot) {
                *entry = if dropped {
                    SlotOutcome::Dispensed
                } else {
                    SlotOutcome::Missed
                };
            }
        }

        self.total_cycles = self.total_cycles.saturating_add(1);
    }

    /// Refill after a completed cycle: full wheel, no flags, empty per-slot log.
    /// Lifetime counters and the calibration state are kept.
    pub fn reset_cycle(&mut self) {
        self.pills_left = TOTAL_SLOTS as u8;
        self.error_flags.clear();
        self.dispense_log = [SlotOutcome::Missed; TOTAL_SLOTS];
    }
}
