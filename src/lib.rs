#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod at;
pub mod controller;
pub mod error;
pub mod link;
pub mod motor;
pub mod panel;
pub mod platform;
pub mod raw;
pub mod record;
pub mod sensor;
pub mod store;

pub use controller::{Dispenser, DispenserConfig, State};
pub use error::{LinkError, MotorError, StoreError};
pub use link::{EventKind, LinkConfig, LinkState, WirelessLink};
pub use motor::MotorDriver;
pub use panel::{Button, Panel};
pub use platform::{Clock, Deadline, Platform, Watchdog};
pub use record::{DispensingRecord, ErrorFlags, SlotOutcome};
pub use sensor::{DropLatch, SensorMonitor};
pub use store::PersistentStore;
