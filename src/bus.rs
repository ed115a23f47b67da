//! Software (bit-banged) two-wire bus primitive.
//!
//! Drives a pair of open-drain lines to form start/stop conditions and
//! bit-at-a-time transfers with clock-stretch tolerance. Carries no
//! knowledge of message content; framing and checksums live one layer up.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::{InputPin, OutputPin};

// Line settle time between edges.
const SETTLE_US: u16 = 1;
/// Hold time start condition (t_HD;STA).
const START_HOLD_US: u16 = 10;
/// Set-up time stop condition (t_SU;STO).
const STOP_SETUP_US: u16 = 10;
// Data-valid window on either side of the clock high phase.
const BIT_HOLD_US: u16 = 5;
// Clock-stretch wait polls the clock line in 10 us steps.
const STRETCH_POLL_US: u16 = 10;
const STRETCH_POLLS_PER_MS: u32 = 100;

/// Acknowledge policy for a received byte.
///
/// [`Ack::Ack`] pulls the data line low on the ninth clock ("continue"),
/// [`Ack::Nack`] releases it ("this was the last byte of the read").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ack {
    Ack,
    Nack,
}

/// Bus-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError<E> {
    /// Line I/O error.
    Pin(E),
    /// Peer did not pull the data line low on the acknowledge clock.
    NoAck,
    /// Peer held the clock line low past the configured bound.
    Timeout,
}

impl<E> core::fmt::Display for BusError<E>
where
    E: core::error::Error,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Pin(error) => write!(f, "line I/O error: {error}"),
            Self::NoAck => write!(f, "no acknowledge from peer"),
            Self::Timeout => write!(f, "clock-stretch timeout"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for BusError<E> {}

impl<E> From<E> for BusError<E> {
    fn from(error: E) -> Self {
        Self::Pin(error)
    }
}

/// Bit-banged bus over two open-drain lines.
///
/// `set_high` releases a line (open-drain high), `set_low` drives it.
/// The platform layer must hand over pins already configured as
/// open-drain outputs that can also be read back.
#[derive(Debug)]
pub struct SoftI2c<SDA, SCL, D> {
    sda: SDA,
    scl: SCL,
    delay: D,
}

impl<SDA, SCL, D, E> SoftI2c<SDA, SCL, D>
where
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayUs<u16>,
{
    /// Construct a new [`SoftI2c`] from the two line handles and a delay
    /// provider. No bus traffic is generated until [`SoftI2c::init`].
    pub fn new(sda: SDA, scl: SCL, delay: D) -> Self {
        Self { sda, scl, delay }
    }

    /// Release both lines into the idle state.
    pub fn init(&mut self) -> Result<(), BusError<E>> {
        self.sda.set_high()?;
        self.scl.set_high()?;
        Ok(())
    }

    /// Write a start condition: data falls while the clock is released.
    ///
    /// ```text
    ///       _____
    /// SDA:       |_____
    ///       _______
    /// SCL:         |___
    /// ```
    pub fn start_condition(&mut self) -> Result<(), BusError<E>> {
        self.sda.set_high()?;
        self.delay.delay_us(SETTLE_US);
        self.scl.set_high()?;
        self.delay.delay_us(SETTLE_US);
        self.sda.set_low()?;
        self.delay.delay_us(START_HOLD_US);
        self.scl.set_low()?;
        self.delay.delay_us(START_HOLD_US);
        Ok(())
    }

    /// Write a stop condition: data rises while the clock is released.
    ///
    /// ```text
    ///              _____
    /// SDA:   _____|
    ///            _______
    /// SCL:   ___|
    /// ```
    pub fn stop_condition(&mut self) -> Result<(), BusError<E>> {
        self.scl.set_low()?;
        self.delay.delay_us(SETTLE_US);
        self.sda.set_low()?;
        self.delay.delay_us(SETTLE_US);
        self.scl.set_high()?;
        self.delay.delay_us(STOP_SETUP_US);
        self.sda.set_high()?;
        self.delay.delay_us(STOP_SETUP_US);
        Ok(())
    }

    /// Transfer a single bit out. A `true` bit releases the data line so
    /// the peer may hold it low for its own acknowledge.
    pub fn write_bit(&mut self, bit: bool, timeout_ms: u32) -> Result<(), BusError<E>> {
        if bit {
            self.sda.set_high()?;
        } else {
            self.sda.set_low()?;
        }

        self.wait_while_clock_stretching(timeout_ms)?;
        self.delay.delay_us(BIT_HOLD_US);
        self.scl.set_low()?;

        Ok(())
    }

    /// Transfer a single bit in, releasing the data line so the peer can
    /// drive it.
    pub fn read_bit(&mut self, timeout_ms: u32) -> Result<bool, BusError<E>> {
        self.sda.set_high()?;

        self.wait_while_clock_stretching(timeout_ms)?;
        self.delay.delay_us(BIT_HOLD_US);

        // Clock is high, data is valid.
        let bit = self.sda.is_high()?;
        self.delay.delay_us(BIT_HOLD_US);
        self.scl.set_low()?;

        Ok(bit)
    }

    /// Write one byte most-significant bit first and check the peer's
    /// acknowledge on the ninth clock.
    pub fn write_byte(&mut self, byte: u8, timeout_ms: u32) -> Result<(), BusError<E>> {
        for shift in 0..8 {
            self.write_bit(byte & (0x80 >> shift) != 0, timeout_ms)?;
        }

        if self.read_bit(timeout_ms)? {
            return Err(BusError::NoAck);
        }

        Ok(())
    }

    /// Read one byte most-significant bit first, then answer with the
    /// caller's acknowledge policy.
    pub fn read_byte(&mut self, ack: Ack, timeout_ms: u32) -> Result<u8, BusError<E>> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | u8::from(self.read_bit(timeout_ms)?);
        }

        self.write_bit(ack == Ack::Nack, timeout_ms)?;

        Ok(byte)
    }

    /// Release the clock line, then poll it until the peer lets it rise.
    ///
    /// The countdown is `timeout_ms` converted to 10 us steps; expiry is
    /// the only retry bound anywhere in the stack.
    fn wait_while_clock_stretching(&mut self, timeout_ms: u32) -> Result<(), BusError<E>> {
        self.scl.set_high()?;

        let mut polls = timeout_ms.saturating_mul(STRETCH_POLLS_PER_MS);
        while self.scl.is_low()? {
            if polls == 0 {
                return Err(BusError::Timeout);
            }
            polls -= 1;
            self.delay.delay_us(STRETCH_POLL_US);
        }

        Ok(())
    }

    /// Release the line handles and the delay provider.
    pub fn free(self) -> (SDA, SCL, D) {
        (self.sda, self.scl, self.delay)
    }
}
