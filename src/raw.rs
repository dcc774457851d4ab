use crate::error::StoreError;
use crate::record::{DispensingRecord, ErrorFlags, SlotOutcome};
use crc::{CRC_16_IBM_3740, Crc};
use heapless::String;

pub const EEPROM_SIZE: usize = 32 * 1024;

pub const LOG_START_ADDR: usize = 0;
pub const LOG_TOTAL_SIZE: usize = 8 * 1024;
pub const LOG_ENTRY_SIZE: usize = 64;
pub const MAX_LOG_ENTRIES: usize = LOG_TOTAL_SIZE / LOG_ENTRY_SIZE;
// one byte for the terminator, two for the CRC
pub const MAX_LOG_MESSAGE_LENGTH: usize = LOG_ENTRY_SIZE - 5;

pub const RECORD_SLOT_SIZE: usize = 64;
pub const RECORD_ADDR: usize = EEPROM_SIZE - RECORD_SLOT_SIZE;

pub const RECORD_MAGIC: u32 = 0xDEAD_BEEF;
pub const TOTAL_SLOTS: usize = 7;

pub const RECORD_SIZE: usize = 4 + 1 + 1 + 2 + 2 + 1 + 1 + TOTAL_SLOTS + 2;
const RECORD_PAYLOAD_SIZE: usize = RECORD_SIZE - 2;

const _: () = assert!(RECORD_SIZE <= RECORD_SLOT_SIZE);
const _: () = assert!(LOG_START_ADDR + LOG_TOTAL_SIZE <= RECORD_ADDR);

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no final xor.
///
/// Stored big-endian behind the data it covers, the CRC over data plus code is zero.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Residue check: true if `block` ends with the big-endian CRC of everything before it.
pub fn crc16_residue_ok(block: &[u8]) -> bool {
    crc16(block) == 0
}

// Byte offsets inside the packed record.
const OFF_MAGIC: usize = 0;
const OFF_PILLS_LEFT: usize = 4;
const OFF_CALIBRATED: usize = 5;
const OFF_TOTAL_DISPENSED: usize = 6;
const OFF_TOTAL_CYCLES: usize = 8;
const OFF_ERROR_FLAGS: usize = 10;
const OFF_ROTATING: usize = 11;
const OFF_DISPENSE_LOG: usize = 12;
const OFF_CHECKSUM: usize = OFF_DISPENSE_LOG + TOTAL_SLOTS;

const _: () = assert!(OFF_CHECKSUM == RECORD_PAYLOAD_SIZE);

/// Serializes the record little-endian and appends the big-endian CRC of the payload.
pub fn encode_record(record: &DispensingRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];

    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&record.magic.to_le_bytes());
    buf[OFF_PILLS_LEFT] = record.pills_left;
    buf[OFF_CALIBRATED] = record.calibrated as u8;
    buf[OFF_TOTAL_DISPENSED..OFF_TOTAL_DISPENSED + 2]
        .copy_from_slice(&record.total_dispensed.to_le_bytes());
    buf[OFF_TOTAL_CYCLES..OFF_TOTAL_CYCLES + 2].copy_from_slice(&record.total_cycles.to_le_bytes());
    buf[OFF_ERROR_FLAGS] = record.error_flags.bits();
    buf[OFF_ROTATING] = record.rotating as u8;
    for (dst, outcome) in buf[OFF_DISPENSE_LOG..OFF_CHECKSUM]
        .iter_mut()
        .zip(record.dispense_log.iter())
    {
        *dst = *outcome as u8;
    }

    let crc = crc16(&buf[..RECORD_PAYLOAD_SIZE]);
    buf[OFF_CHECKSUM..].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// Validates sentinel and CRC residue, then deserializes the record.
pub fn decode_record(buf: &[u8; RECORD_SIZE]) -> Result<DispensingRecord, StoreError> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != RECORD_MAGIC {
        return Err(StoreError::InvalidMagic(magic));
    }

    if !crc16_residue_ok(buf) {
        return Err(StoreError::ChecksumMismatch);
    }

    let pills_left = buf[OFF_PILLS_LEFT];
    if usize::from(pills_left) > TOTAL_SLOTS {
        return Err(StoreError::InvalidPillCount(pills_left));
    }

    let mut dispense_log = [SlotOutcome::Missed; TOTAL_SLOTS];
    for (outcome, &raw) in dispense_log
        .iter_mut()
        .zip(buf[OFF_DISPENSE_LOG..OFF_CHECKSUM].iter())
    {
        *outcome = SlotOutcome::from_repr(raw).unwrap_or(SlotOutcome::Missed);
    }

    Ok(DispensingRecord {
        magic,
        pills_left,
        calibrated: buf[OFF_CALIBRATED] != 0,
        total_dispensed: u16::from_le_bytes([
            buf[OFF_TOTAL_DISPENSED],
            buf[OFF_TOTAL_DISPENSED + 1],
        ]),
        total_cycles: u16::from_le_bytes([buf[OFF_TOTAL_CYCLES], buf[OFF_TOTAL_CYCLES + 1]]),
        error_flags: ErrorFlags::from_bits(buf[OFF_ERROR_FLAGS]),
        rotating: buf[OFF_ROTATING] != 0,
        dispense_log,
    })
}

/// Truncates `message` to fit a log slot, in bytes, on a character boundary.
pub fn truncate_log_message(message: &str) -> &str {
    if message.len() <= MAX_LOG_MESSAGE_LENGTH {
        return message;
    }
    let mut end = MAX_LOG_MESSAGE_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Builds a zero padded log slot: message bytes, NUL terminator, big-endian CRC over both.
pub fn encode_log_entry(message: &str) -> [u8; LOG_ENTRY_SIZE] {
    let message = truncate_log_message(message);
    let len = message.len();

    let mut buf = [0u8; LOG_ENTRY_SIZE];
    buf[..len].copy_from_slice(message.as_bytes());

    let crc = crc16(&buf[..len + 1]);
    buf[len + 1..len + 3].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// A slot counts as free when its first byte is zero or erased (`0xFF`).
pub fn log_slot_is_empty(buf: &[u8]) -> bool {
    matches!(buf.first(), None | Some(0x00) | Some(0xFF))
}

/// Decodes a log slot, `Ok(None)` for a free slot.
pub fn decode_log_entry(
    buf: &[u8; LOG_ENTRY_SIZE],
) -> Result<Option<String<MAX_LOG_MESSAGE_LENGTH>>, StoreError> {
    if log_slot_is_empty(buf) {
        return Ok(None);
    }

    let len = buf[..=MAX_LOG_MESSAGE_LENGTH]
        .iter()
        .position(|&b| b == 0)
        .ok_or(StoreError::LogEntryCorrupt)?;

    if !crc16_residue_ok(&buf[..len + 3]) {
        return Err(StoreError::LogEntryCorrupt);
    }

    let text = core::str::from_utf8(&buf[..len]).map_err(|_| StoreError::LogEntryCorrupt)?;
    let mut message = String::new();
    message
        .push_str(text)
        .map_err(|_| StoreError::LogEntryCorrupt)?;
    Ok(Some(message))
}
