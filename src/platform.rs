//! Hardware collaborators of the engine. A board support crate implements these for the real
//! radio, timer and EEPROM; the integration tests implement them with in-memory fakes.

use crate::protocol::MAX_PAYLOAD;

/// Monotonic millisecond counter. Wraps around after ~49 days, so intervals must be computed with
/// [`crate::wait::elapsed`] instead of comparing absolute values.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<T: Clock> Clock for &T {
    fn now_ms(&self) -> u32 {
        T::now_ms(self)
    }
}

impl<T: Clock> Clock for &mut T {
    fn now_ms(&self) -> u32 {
        T::now_ms(self)
    }
}

/// Transmit power levels of the radio, strongest first.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PowerLevel {
    Max = 0,
    High = 1,
    Low = 2,
    Min = 3,
}

/// Half-duplex packet radio. Receiving and transmitting are mutually exclusive: callers stop
/// listening before sending. After a channel switch the caller waits for the radio to settle.
pub trait Radio {
    type Error;

    fn set_channel(&mut self, channel: u8);

    fn set_power_level(&mut self, level: PowerLevel);

    fn start_listening(&mut self);

    fn stop_listening(&mut self);

    /// Sends a single frame of at most [`MAX_PAYLOAD`] bytes. There is no link level
    /// acknowledgment, success only means the frame left the radio.
    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error>;

    /// Copies the next pending frame into `buf` and returns its length.
    fn receive(&mut self, buf: &mut [u8; MAX_PAYLOAD]) -> Option<usize>;

    /// Whether the last received frame arrived with a strong signal (received power detector).
    fn signal_strong(&mut self) -> bool;

    fn flush_rx(&mut self);

    fn power_up(&mut self);

    fn power_down(&mut self);
}

impl<T: Radio> Radio for &mut T {
    type Error = T::Error;

    fn set_channel(&mut self, channel: u8) {
        T::set_channel(self, channel)
    }

    fn set_power_level(&mut self, level: PowerLevel) {
        T::set_power_level(self, level)
    }

    fn start_listening(&mut self) {
        T::start_listening(self)
    }

    fn stop_listening(&mut self) {
        T::stop_listening(self)
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        T::send(self, payload)
    }

    fn receive(&mut self, buf: &mut [u8; MAX_PAYLOAD]) -> Option<usize> {
        T::receive(self, buf)
    }

    fn signal_strong(&mut self) -> bool {
        T::signal_strong(self)
    }

    fn flush_rx(&mut self) {
        T::flush_rx(self)
    }

    fn power_up(&mut self) {
        T::power_up(self)
    }

    fn power_down(&mut self) {
        T::power_down(self)
    }
}

/// Everything else the engine needs from the microcontroller.
pub trait Board: Clock {
    /// Busy wait.
    fn delay_ms(&mut self, ms: u32);

    /// Low power sleep. Has no side effect besides elapsed time.
    fn sleep_ms(&mut self, ms: u32);

    /// Supply voltage scaled to 0..=255.
    fn battery_level(&mut self) -> u8;

    /// Suspends the MCU until an external wake signal arrives. Returns `false` without suspending
    /// when the board has no wake-on-interrupt source.
    fn suspend_until_wake(&mut self) -> bool {
        false
    }
}

impl<T: Board> Board for &mut T {
    fn delay_ms(&mut self, ms: u32) {
        T::delay_ms(self, ms)
    }

    fn sleep_ms(&mut self, ms: u32) {
        T::sleep_ms(self, ms)
    }

    fn battery_level(&mut self) -> u8 {
        T::battery_level(self)
    }

    fn suspend_until_wake(&mut self) -> bool {
        T::suspend_until_wake(self)
    }
}

/// Status register bits of an SPI EEPROM.
pub const STATUS_WIP: u8 = 1 << 0;
pub const STATUS_WEL: u8 = 1 << 1;

/// Single byte transfers to an SPI EEPROM. The write enable handshake and the completion poll on
/// top of it live in [`crate::store::Eeprom`].
pub trait EepromBus {
    type Error;

    fn read(&mut self, address: u32) -> Result<u8, Self::Error>;

    fn write_enable(&mut self) -> Result<(), Self::Error>;

    fn read_status(&mut self) -> Result<u8, Self::Error>;

    fn program(&mut self, address: u32, byte: u8) -> Result<(), Self::Error>;

    fn capacity(&self) -> usize;
}
