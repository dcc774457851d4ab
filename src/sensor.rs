use crate::motor::HomeReference;
use crate::platform::{Platform, poll_until};
#[cfg(feature = "defmt")]
use defmt::{debug, trace};
use core::sync::atomic::{AtomicBool, Ordering};
use embedded_hal::digital::InputPin;

const DROP_POLL_INTERVAL_MS: u32 = 10;

/// Pill drop latch, set from the vibration sensor's falling edge interrupt.
///
/// The interrupt only ever calls [`signal`](Self::signal), the foreground loop only reads and
/// clears it. Put it in a `static` and call `signal` from the GPIO handler:
///
/// ```
/// use pill_dispenser::sensor::DropLatch;
///
/// static PILL_DROP: DropLatch = DropLatch::new();
///
/// fn on_piezo_falling_edge() {
///     PILL_DROP.signal();
/// }
/// # on_piezo_falling_edge();
/// # assert!(PILL_DROP.is_set());
/// ```
#[derive(Debug, Default)]
pub struct DropLatch(AtomicBool);

impl DropLatch {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Interrupt side.
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Optical alignment sensor plus the latched vibration (pill drop) sensor.
pub struct SensorMonitor<'a, O: InputPin> {
    optical: O,
    drop_latch: &'a DropLatch,
}

impl<'a, O: InputPin> SensorMonitor<'a, O> {
    #[must_use]
    pub fn new(optical: O, drop_latch: &'a DropLatch) -> Self {
        Self {
            optical,
            drop_latch,
        }
    }

    /// True while the reference mark is in front of the sensor (output pulled low).
    ///
    /// A failing pin read counts as "not aligned".
    pub fn optical_aligned(&mut self) -> bool {
        self.optical.is_low().unwrap_or(false)
    }

    /// Forgets any drop seen so far. Call right before moving the wheel so that a drop from
    /// an earlier slot can not be booked for the next one.
    pub fn reset_drop_latch(&mut self) {
        self.drop_latch.reset();
    }

    /// Waits up to `timeout_ms` for the drop latch.
    ///
    /// A drop that happened while the wheel was still moving counts immediately.
    pub fn wait_for_drop<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        timeout_ms: u32,
    ) -> bool {
        if self.drop_latch.is_set() {
            #[cfg(feature = "defmt")]
            debug!("sensors: pill detected (immediate)");
            return true;
        }

        #[cfg(feature = "defmt")]
        trace!("sensors: waiting for pill drop ({} ms)", timeout_ms);

        let latch = self.drop_latch;
        let dropped = poll_until(platform, timeout_ms, DROP_POLL_INTERVAL_MS, |_| latch.is_set());

        #[cfg(feature = "defmt")]
        {
            if dropped {
                debug!("sensors: pill detected (delayed)");
            } else {
                debug!("sensors: no pill detected (timeout)");
            }
        }

        dropped
    }

    pub fn release(self) -> O {
        self.optical
    }
}

impl<O: InputPin> HomeReference for SensorMonitor<'_, O> {
    fn at_home(&mut self) -> bool {
        self.optical_aligned()
    }
}
