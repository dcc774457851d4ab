//! Host side decoder for raw pill dispenser EEPROM images.
//!
//! Uses the firmware's own decoders from [`pill_dispenser::raw`], so the tool always reads the
//! layout the firmware writes.

pub mod error;

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

pub use error::Error;
use pill_dispenser::raw::{
    self, EEPROM_SIZE, LOG_ENTRY_SIZE, LOG_START_ADDR, MAX_LOG_ENTRIES, RECORD_ADDR, RECORD_SIZE,
};
use pill_dispenser::{DispensingRecord, SlotOutcome, StoreError};

/// Content of one log ring slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSlot {
    Empty,
    Message(String),
    /// The slot is in use but its CRC does not validate. Holds the raw slot as hex.
    Corrupt(String),
}

/// A complete 32 KiB EEPROM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EepromImage {
    bytes: Vec<u8>,
}

impl EepromImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() != EEPROM_SIZE {
            return Err(Error::InvalidImageSize(bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_bytes(fs::read(path)?)
    }

    /// Decodes the dispensing record, or tells why it would be rejected at boot.
    pub fn record(&self) -> Result<DispensingRecord, StoreError> {
        let mut buf = [0u8; RECORD_SIZE];
        buf.copy_from_slice(&self.bytes[RECORD_ADDR..RECORD_ADDR + RECORD_SIZE]);
        raw::decode_record(&buf)
    }

    pub fn log_slot(&self, index: usize) -> LogSlot {
        let offset = LOG_START_ADDR + index * LOG_ENTRY_SIZE;
        let mut buf = [0u8; LOG_ENTRY_SIZE];
        buf.copy_from_slice(&self.bytes[offset..offset + LOG_ENTRY_SIZE]);

        match raw::decode_log_entry(&buf) {
            Ok(None) => LogSlot::Empty,
            Ok(Some(message)) => LogSlot::Message(message.as_str().to_owned()),
            Err(_) => LogSlot::Corrupt(hex::encode(buf)),
        }
    }

    /// Every slot that is in use, with its index.
    pub fn log(&self) -> Vec<(usize, LogSlot)> {
        (0..MAX_LOG_ENTRIES)
            .map(|index| (index, self.log_slot(index)))
            .filter(|(_, slot)| *slot != LogSlot::Empty)
            .collect()
    }

    /// Slot the firmware would write next after booting from this image.
    pub fn resume_index(&self) -> usize {
        (0..MAX_LOG_ENTRIES)
            .find(|&index| {
                let offset = LOG_START_ADDR + index * LOG_ENTRY_SIZE;
                raw::log_slot_is_empty(&self.bytes[offset..offset + LOG_ENTRY_SIZE])
            })
            .unwrap_or(0)
    }
}

/// Human readable multi line rendering of a record.
pub fn format_record(record: &DispensingRecord) -> String {
    let mut out = String::new();
    let log: String = record
        .dispense_log
        .iter()
        .map(|outcome| match outcome {
            SlotOutcome::Dispensed => '1',
            SlotOutcome::Missed => '0',
        })
        .collect();

    // writing to a String can not fail
    let _ = writeln!(out, "Pills left\t: {}", record.pills_left);
    let _ = writeln!(out, "Calibrated\t: {}", record.calibrated);
    let _ = writeln!(out, "Rotating\t: {}", record.rotating);
    let _ = writeln!(out, "Error flags\t: {:?}", record.error_flags);
    let _ = writeln!(out, "Dispense log\t: {log}");
    let _ = writeln!(out, "Total dispensed\t: {}", record.total_dispensed);
    let _ = write!(out, "Total cycles\t: {}", record.total_cycles);
    out
}
