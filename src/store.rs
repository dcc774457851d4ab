use crate::error::StoreError;
use crate::raw::{
    self, EEPROM_SIZE, LOG_ENTRY_SIZE, LOG_START_ADDR, MAX_LOG_ENTRIES, MAX_LOG_MESSAGE_LENGTH,
    RECORD_ADDR, RECORD_SIZE,
};
use crate::record::DispensingRecord;
#[cfg(feature = "defmt")]
use defmt::{debug, info, trace, warn};
use embedded_storage::Storage;
use heapless::String;

/// CRC protected dispensing record plus a wrap-around message log, both living in a byte
/// addressed EEPROM.
///
/// Memory map (32 KiB device):
/// * `0x0000..0x2000`: log ring, 128 slots of 64 bytes
/// * `0x7FC0..0x8000`: dispensing record
pub struct PersistentStore<S: Storage> {
    pub(crate) storage: S,
    pub(crate) log_index: usize,
}

impl<S: Storage> PersistentStore<S> {
    /// Scans the log ring once for the first free slot, which becomes the next write position.
    /// If every slot is taken, or the scan can not read the device, writing resumes at slot 0.
    pub fn new(storage: S) -> Result<PersistentStore<S>, StoreError> {
        if storage.capacity() < EEPROM_SIZE {
            return Err(StoreError::CapacityTooSmall);
        }

        let mut store = Self {
            storage,
            log_index: 0,
        };
        store.log_index = store.scan_log().unwrap_or_else(|_e| {
            #[cfg(feature = "defmt")]
            warn!("store: log scan failed, resuming at slot 0: {}", _e);
            0
        });

        #[cfg(feature = "defmt")]
        debug!("store: log resumes at slot {}", store.log_index);

        Ok(store)
    }

    /// Writes the whole record, reads it back and compares it byte by byte.
    ///
    /// A mismatch is reported as [`StoreError::VerifyFailed`]; the store does not retry.
    pub fn save(&mut self, record: &DispensingRecord) -> Result<(), StoreError> {
        let buf = raw::encode_record(record);
        self.write(RECORD_ADDR, &buf)?;

        let mut verify = [0u8; RECORD_SIZE];
        self.read(RECORD_ADDR, &mut verify)?;

        if verify != buf {
            #[cfg(feature = "defmt")]
            warn!("store: save verification failed");
            return Err(StoreError::VerifyFailed);
        }

        #[cfg(feature = "defmt")]
        trace!("store: saved record, pills left {}", record.pills_left);

        Ok(())
    }

    /// Reads the record and accepts it only if the sentinel matches and the CRC residue over
    /// payload plus stored code is zero.
    pub fn load(&mut self) -> Result<DispensingRecord, StoreError> {
        let mut buf = [0u8; RECORD_SIZE];
        self.read(RECORD_ADDR, &mut buf)?;

        match raw::decode_record(&buf) {
            Ok(record) => {
                #[cfg(feature = "defmt")]
                info!("store: loaded record, pills left {}", record.pills_left);
                Ok(record)
            }
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("store: load rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Builds a fresh record and persists it right away.
    ///
    /// The record is returned even if the save could not be verified, the caller keeps
    /// working from the in-memory copy.
    pub fn initialize_default(&mut self) -> DispensingRecord {
        let record = DispensingRecord::new();
        if let Err(_e) = self.save(&record) {
            #[cfg(feature = "defmt")]
            warn!("store: defaults not persisted: {}", _e);
        }
        record
    }

    /// Appends `message` to the log ring, truncated to the usable length of a slot.
    ///
    /// Empty messages are ignored.
    pub fn append_log(&mut self, message: &str) -> Result<(), StoreError> {
        if message.is_empty() {
            return Ok(());
        }

        if self.log_index >= MAX_LOG_ENTRIES {
            self.log_index = 0;
        }

        let buf = raw::encode_log_entry(message);
        self.write(Self::log_slot_addr(self.log_index), &buf)?;

        #[cfg(feature = "defmt")]
        trace!("store: log [{}] {}", self.log_index, raw::truncate_log_message(message));

        self.log_index += 1;
        Ok(())
    }

    /// Slot the next [`append_log`](Self::append_log) writes to.
    pub fn log_index(&self) -> usize {
        self.log_index % MAX_LOG_ENTRIES
    }

    /// Reads one log slot, `Ok(None)` if it is free.
    pub fn read_log(
        &mut self,
        index: usize,
    ) -> Result<Option<String<MAX_LOG_MESSAGE_LENGTH>>, StoreError> {
        if index >= MAX_LOG_ENTRIES {
            return Err(StoreError::LogIndexOutOfRange);
        }

        let mut buf = [0u8; LOG_ENTRY_SIZE];
        self.read(Self::log_slot_addr(index), &mut buf)?;
        raw::decode_log_entry(&buf)
    }

    /// Gives the storage back, e.g. to inspect it in tests.
    pub fn release(self) -> S {
        self.storage
    }

    fn scan_log(&mut self) -> Result<usize, StoreError> {
        let mut buf = [0u8; LOG_ENTRY_SIZE];
        for index in 0..MAX_LOG_ENTRIES {
            self.read(Self::log_slot_addr(index), &mut buf)?;
            if raw::log_slot_is_empty(&buf) {
                return Ok(index);
            }
        }

        #[cfg(feature = "defmt")]
        info!("store: log area full, wrapping to 0");
        Ok(0)
    }

    const fn log_slot_addr(index: usize) -> usize {
        LOG_START_ADDR + index * LOG_ENTRY_SIZE
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.storage
            .read(addr as u32, buf)
            .map_err(|_| StoreError::Storage)
    }

    fn write(&mut self, addr: usize, buf: &[u8]) -> Result<(), StoreError> {
        self.storage
            .write(addr as u32, buf)
            .map_err(|_| StoreError::Storage)
    }
}
