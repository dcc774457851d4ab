use thiserror::Error;

/// Errors reported by the [`PersistentStore`](crate::store::PersistentStore).
///
/// None of them are fatal for the dispenser: a failed save is reported and the
/// controller keeps running, a failed load falls back to a fresh default record.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum StoreError {
    /// The internal error value is returned from the provided `impl Storage`
    #[error("internal storage error")]
    Storage,

    /// The block read back after a save differs from the block that was written
    #[error("save verification failed")]
    VerifyFailed,

    /// The sentinel at the start of the record does not match `RECORD_MAGIC`
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    /// The CRC residue over payload and trailing code is not zero
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The record validates but claims more pills than the wheel has slots
    #[error("invalid pill count: {0}")]
    InvalidPillCount(u8),

    /// A log slot holds a message whose own CRC does not validate
    #[error("corrupted log entry")]
    LogEntryCorrupt,

    /// The requested log slot lies outside of the ring
    #[error("log index out of range")]
    LogIndexOutOfRange,

    /// The storage device is too small for the memory map
    #[error("storage capacity too small")]
    CapacityTooSmall,
}

/// Errors returned by the [`MotorDriver`](crate::motor::MotorDriver).
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorError {
    /// Homing ran past the safety ceiling without seeing the optical reference.
    #[error("optical reference not found")]
    SensorNotFound,

    /// Driving one of the coil outputs failed.
    #[error("coil output error")]
    Coil,
}

/// Errors returned by the [`WirelessLink`](crate::link::WirelessLink).
///
/// The controller treats every one of them as "offline", dispensing never depends on them.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum LinkError {
    /// The serial transport reported an error
    #[error("serial transport error")]
    Serial,

    /// No success marker arrived before the exchange deadline
    #[error("timeout waiting for response")]
    Timeout,

    /// The modem answered with a known failure marker
    #[error("modem rejected command")]
    Rejected,

    /// Uplinks are only possible once the network has been joined
    #[error("not connected")]
    NotConnected,

    /// The modem did not answer any probe after power-up
    #[error("modem init failed")]
    InitFailed,

    /// The formatted command does not fit the modem's command buffer
    #[error("payload too long")]
    PayloadTooLong,
}
