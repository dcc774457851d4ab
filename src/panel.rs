//! Operator panel: calibrate and start/skip buttons (active low) and one indicator LED.

use crate::platform::Platform;
use embedded_hal::digital::{InputPin, OutputPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Button {
    Calibrate,
    /// Starts a cycle, or skips the rest of the wait between two slots.
    Start,
}

pub struct Panel<B, L> {
    calibrate: B,
    start: B,
    led: L,
    led_on: bool,
    debounce_ms: u32,
}

impl<B: InputPin, L: OutputPin> Panel<B, L> {
    pub fn new(calibrate: B, start: B, led: L, debounce_ms: u32) -> Self {
        Self {
            calibrate,
            start,
            led,
            led_on: false,
            debounce_ms,
        }
    }

    /// Raw level check without debouncing.
    pub fn is_held(&mut self, button: Button) -> bool {
        let pin = match button {
            Button::Calibrate => &mut self.calibrate,
            Button::Start => &mut self.start,
        };
        pin.is_low().unwrap_or(false)
    }

    /// A press is a low level that is still low after the debounce time.
    pub fn pressed<P: Platform + ?Sized>(&mut self, platform: &mut P, button: Button) -> bool {
        if !self.is_held(button) {
            return false;
        }
        platform.delay_ms(self.debounce_ms);
        self.is_held(button)
    }

    pub fn set_indicator(&mut self, on: bool) {
        // indicator errors are not worth failing for
        let _ = if on {
            self.led.set_high()
        } else {
            self.led.set_low()
        };
        self.led_on = on;
    }

    pub fn toggle_indicator(&mut self) {
        self.set_indicator(!self.led_on);
    }

    pub fn indicator(&self) -> bool {
        self.led_on
    }

    /// Blinks `times` times with `half_period_ms` on and off, feeding the watchdog after each.
    pub fn blink<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        times: u32,
        half_period_ms: u32,
    ) {
        for _ in 0..times {
            self.set_indicator(true);
            platform.delay_ms(half_period_ms);
            self.set_indicator(false);
            platform.delay_ms(half_period_ms);
            platform.feed();
        }
    }

    /// Lights the indicator for `duration_ms`, then switches it off.
    pub fn flash<P: Platform + ?Sized>(&mut self, platform: &mut P, duration_ms: u32) {
        self.set_indicator(true);
        platform.delay_ms(duration_ms);
        platform.feed();
        self.set_indicator(false);
    }

    pub fn release(self) -> (B, B, L) {
        (self.calibrate, self.start, self.led)
    }
}
