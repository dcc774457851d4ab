use thiserror::Error;

/// Errors that can occur while reading an EEPROM image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(
        "invalid image size {0}: must be exactly {expected} bytes",
        expected = pill_dispenser::raw::EEPROM_SIZE
    )]
    InvalidImageSize(usize),
}
