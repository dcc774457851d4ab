use embedded_hal::delay::DelayNs;

/// Everything the dispenser needs from the board besides pins, the UART and the EEPROM:
/// a blocking delay, a monotonic clock and the watchdog.
pub trait Platform: Clock + Watchdog + DelayNs {}

impl<T: Clock + Watchdog + DelayNs> Platform for T {}

/// Monotonic time since boot.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn uptime_secs(&self) -> u32 {
        (self.now_ms() / 1000) as u32
    }
}

impl<T: Clock> Clock for &mut T {
    fn now_ms(&self) -> u64 {
        T::now_ms(self)
    }
}

/// Liveness signal. Has to be called more often than the watchdog trip threshold, otherwise
/// the board resets, which the controller then recovers from like from a power failure.
pub trait Watchdog {
    fn feed(&mut self);
}

impl<T: Watchdog> Watchdog for &mut T {
    fn feed(&mut self) {
        T::feed(self)
    }
}

/// A point in time `timeout_ms` after the moment it was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Deadline {
    start_ms: u64,
    timeout_ms: u64,
}

impl Deadline {
    pub fn start<C: Clock + ?Sized>(clock: &C, timeout_ms: u32) -> Self {
        Self {
            start_ms: clock.now_ms(),
            timeout_ms: timeout_ms as u64,
        }
    }

    pub fn elapsed_ms<C: Clock + ?Sized>(&self, clock: &C) -> u64 {
        clock.now_ms().saturating_sub(self.start_ms)
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.elapsed_ms(clock) >= self.timeout_ms
    }
}

/// Checks `condition` until it holds or `timeout_ms` have passed, sleeping `quantum_ms`
/// between checks and feeding the watchdog after every sleep.
///
/// The condition is evaluated once before the first sleep, so an already satisfied condition
/// returns immediately. There is no way to abort the wait early other than the condition itself.
pub fn poll_until<P, F>(
    platform: &mut P,
    timeout_ms: u32,
    quantum_ms: u32,
    mut condition: F,
) -> bool
where
    P: Platform + ?Sized,
    F: FnMut(&mut P) -> bool,
{
    let deadline = Deadline::start(&*platform, timeout_ms);
    loop {
        if condition(platform) {
            return true;
        }
        if deadline.expired(&*platform) {
            return false;
        }
        platform.delay_ms(quantum_ms);
        platform.feed();
    }
}

/// Sleeps `duration_ms` in chunks of `quantum_ms`, feeding the watchdog in between.
pub fn sleep_alive<P: Platform + ?Sized>(platform: &mut P, duration_ms: u32, quantum_ms: u32) {
    let mut remaining = duration_ms;
    while remaining > 0 {
        let chunk = remaining.min(quantum_ms.max(1));
        platform.delay_ms(chunk);
        platform.feed();
        remaining -= chunk;
    }
}
