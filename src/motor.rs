//! Four coil unipolar stepper (28BYJ-48 class) driven in half steps.

use crate::error::MotorError;
use crate::platform::Platform;
#[cfg(feature = "defmt")]
use defmt::{debug, error};
use embedded_hal::digital::OutputPin;

/// Half steps per output shaft revolution.
pub const STEPS_PER_REV: u32 = 4096;
/// Medication compartments on the wheel, including the calibration gap.
pub const SLOTS_PER_REV: u32 = 8;
pub const STEPS_PER_SLOT: u32 = STEPS_PER_REV / SLOTS_PER_REV;
/// Extra steps after one full revolution so homing always leaves the current detent.
pub const HOMING_OVERRUN_STEPS: u32 = 200;
/// Steps spent looking for the optical reference before giving up.
pub const HOMING_SEARCH_LIMIT: u32 = STEPS_PER_REV * 3;

const STEP_SETTLE_MS: u32 = 2;
const FEED_EVERY_STEPS: u32 = 10;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Forward,
    Backward,
}

/// Something that tells whether the wheel sits at its homing mark.
pub trait HomeReference {
    fn at_home(&mut self) -> bool;
}

impl<T: HomeReference> HomeReference for &mut T {
    fn at_home(&mut self) -> bool {
        T::at_home(self)
    }
}

pub struct MotorDriver<M: OutputPin> {
    coils: [M; 4],
    phase: usize,
}

impl<M: OutputPin> MotorDriver<M> {
    #[must_use]
    pub fn new(coils: [M; 4]) -> Self {
        Self { coils, phase: 0 }
    }

    /// De-energizes all coils and restarts the phase counter.
    pub fn initialize(&mut self) -> Result<(), MotorError> {
        self.phase = 0;
        self.stop()
    }

    /// De-energizes all coils. The rotor keeps its position through the gearbox detent.
    pub fn stop(&mut self) -> Result<(), MotorError> {
        for coil in self.coils.iter_mut() {
            coil.set_low().map_err(|_| MotorError::Coil)?;
        }
        Ok(())
    }

    /// Current index into the half step sequence.
    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Moves one half step and waits for the rotor to settle.
    pub fn step<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        direction: Direction,
    ) -> Result<(), MotorError> {
        self.phase = match direction {
            Direction::Forward => (self.phase + 1) % HALF_STEP_SEQUENCE.len(),
            Direction::Backward => {
                (self.phase + HALF_STEP_SEQUENCE.len() - 1) % HALF_STEP_SEQUENCE.len()
            }
        };

        for (coil, &energized) in self.coils.iter_mut().zip(HALF_STEP_SEQUENCE[self.phase].iter()) {
            if energized {
                coil.set_high().map_err(|_| MotorError::Coil)?;
            } else {
                coil.set_low().map_err(|_| MotorError::Coil)?;
            }
        }

        platform.delay_ms(STEP_SETTLE_MS);
        Ok(())
    }

    /// Homes the wheel against the optical reference.
    ///
    /// Turns one revolution plus [`HOMING_OVERRUN_STEPS`], then keeps stepping until
    /// `reference` reports the mark. After [`HOMING_SEARCH_LIMIT`] further steps without the
    /// mark this fails with [`MotorError::SensorNotFound`]. The coils are off again in both cases.
    pub fn calibrate<P, R>(&mut self, platform: &mut P, mut reference: R) -> Result<(), MotorError>
    where
        P: Platform + ?Sized,
        R: HomeReference,
    {
        let homed = self.home(platform, &mut reference);
        let stopped = self.stop();
        homed.and(stopped)
    }

    /// Turns exactly one slot pitch (1/8 revolution) forward, then de-energizes.
    ///
    /// Slot to slot motion is not checked against the sensor, homing is assumed to hold.
    pub fn advance_one_slot<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
    ) -> Result<(), MotorError> {
        let moved = self.run(platform, STEPS_PER_SLOT);
        let stopped = self.stop();
        moved.and(stopped)
    }

    fn home<P, R>(&mut self, platform: &mut P, reference: &mut R) -> Result<(), MotorError>
    where
        P: Platform + ?Sized,
        R: HomeReference,
    {
        self.run(platform, STEPS_PER_REV + HOMING_OVERRUN_STEPS)?;

        let mut searched = 0;
        while !reference.at_home() {
            if searched >= HOMING_SEARCH_LIMIT {
                #[cfg(feature = "defmt")]
                error!("motor: optical reference not found after {} steps", searched);
                return Err(MotorError::SensorNotFound);
            }

            self.step(platform, Direction::Forward)?;
            searched += 1;
            if searched % FEED_EVERY_STEPS == 0 {
                platform.feed();
            }
        }

        #[cfg(feature = "defmt")]
        debug!("motor: reference found after {} search steps", searched);
        Ok(())
    }

    fn run<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        steps: u32,
    ) -> Result<(), MotorError> {
        for i in 0..steps {
            self.step(platform, Direction::Forward)?;
            if i % FEED_EVERY_STEPS == 0 {
                platform.feed();
            }
        }
        Ok(())
    }

    pub fn release(self) -> [M; 4] {
        self.coils
    }
}
