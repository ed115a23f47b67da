#![cfg_attr(not(test), no_std)]
//! SCD30 CO2, temperature and humidity sensor driver, bit-banging the
//! two-wire bus over a pair of open-drain GPIO lines.
//!
//! Reference: Interface Description Sensirion SCD30 Sensor Module.

pub mod bus;
#[cfg(test)]
mod sim;

use crc::{Crc, CRC_8_NRSC_5};
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::{InputPin, OutputPin};

use crate::bus::{Ack, BusError, SoftI2c};

/// 0x31 CRC (polynomial: 1 + x^4 + x^5 + x^8), seed 0xFF, no reflection.
const CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

/// SCD30 standard *7-bit bus address*.
pub const STANDARD_I2C_ADDRESS: u8 = 0x61;

/// Default clock-stretch timeout in milliseconds, applied per byte.
pub const DEFAULT_TIMEOUT_MS: u32 = 180;

/// SCD30 driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Scd30Error<E> {
    /// Bus transfer error.
    Bus(BusError<E>),
    /// Checksum mismatch on a received word.
    Checksum,
    /// Caller-supplied value outside the documented range.
    OutOfRange,
}

impl<E> core::fmt::Display for Scd30Error<E>
where
    E: core::error::Error,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bus(error) => write!(f, "bus error: {error}"),
            Self::Checksum => write!(f, "word checksum mismatch, CRC validation fail"),
            Self::OutOfRange => write!(f, "parameter outside documented range"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Scd30Error<E> {}

impl<E> From<BusError<E>> for Scd30Error<E> {
    fn from(error: BusError<E>) -> Self {
        Self::Bus(error)
    }
}

/// Sensor command opcodes, written most-significant byte first.
#[derive(Debug, Clone, Copy)]
enum Command {
    ReadSerialNumber = 0xD033,
    ReadArticleCode = 0xD025,
    StartSingleMeasurement = 0x0006,
    StartContinuousMeasurement = 0x0010,
    StopMeasurement = 0x0104,
    GetDataReady = 0x0202,
    ReadMeasurementBuffer = 0x0300,
    SetMeasurementInterval = 0x4600,
    SetForcedRecalibration = 0x5204,
    SetTemperatureOffset = 0x5403,
    SetAltitudeCompensation = 0x5102,
    AutomaticSelfCalibration = 0x5306,
    ReadFirmwareVersion = 0xD100,
    SoftReset = 0xD304,
}

/// One **SCD30** measurement. All three values are refreshed together;
/// a failed read leaves no partial record behind.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    /// CO2 concentration in parts per million (0 - 40,000 ppm).
    pub co2: f32,
    /// Temperature in °C (-40 - 70).
    pub temperature: f32,
    /// Relative humidity (0 - 100 %RH).
    pub humidity: f32,
}

/// **SCD30** CO2, temperature and humidity sensor on a bit-banged
/// two-wire bus.
///
/// The driver owns the configured bus address and the clock-stretch
/// timeout; both can be changed after construction. Every operation is
/// one complete bus transaction: the matching stop condition is issued
/// even when a mid-transaction step fails, so the bus is always
/// released.
#[derive(Debug)]
pub struct Scd30<SDA, SCL, D> {
    /// Bit-banged bus the sensor hangs off.
    bus: SoftI2c<SDA, SCL, D>,
    /// 7-bit bus address of the sensor.
    address: u8,
    /// Clock-stretch timeout in milliseconds, applied per byte.
    timeout_ms: u32,
}

impl<SDA, SCL, D, E> Scd30<SDA, SCL, D>
where
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayUs<u16>,
{
    /// Construct and initialize a new [`Scd30`] with the sensor's
    /// standard *7-bit address*.
    pub fn new(sda: SDA, scl: SCL, delay: D) -> Result<Self, Scd30Error<E>> {
        Self::with_address(STANDARD_I2C_ADDRESS, sda, scl, delay)
    }

    /// Construct and initialize a new [`Scd30`] with the given *7-bit
    /// address*, releasing both lines into the idle state.
    pub fn with_address(
        address: u8,
        sda: SDA,
        scl: SCL,
        delay: D,
    ) -> Result<Self, Scd30Error<E>> {
        let mut bus = SoftI2c::new(sda, scl, delay);
        bus.init()?;

        Ok(Self {
            bus,
            address,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        })
    }

    /// Set the sensor's 7-bit bus address.
    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    /// Set the clock-stretch timeout in milliseconds.
    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// Read the sensor's serial number as a NUL-terminated character
    /// string.
    pub fn read_serial_number(&mut self) -> Result<[u8; 32], Scd30Error<E>> {
        self.send_command(Command::ReadSerialNumber, None)?;

        let mut serial = [0u8; 32];
        self.read_phase(&mut serial)?;

        // Make sure the last byte is '\0'.
        serial[31] = 0;
        Ok(serial)
    }

    /// Read the sensor's article code as a NUL-terminated character
    /// string.
    pub fn read_article_code(&mut self) -> Result<[u8; 32], Scd30Error<E>> {
        self.send_command(Command::ReadArticleCode, None)?;

        let mut code = [0u8; 32];
        self.read_phase(&mut code)?;

        code[31] = 0;
        Ok(code)
    }

    /// Check whether a finished measurement is waiting in the sensor
    /// buffer.
    pub fn data_ready(&mut self) -> Result<bool, Scd30Error<E>> {
        self.send_command(Command::GetDataReady, None)?;

        let mut buffer = [0u8; 2];
        self.read_phase(&mut buffer)?;

        Ok(u16::from_be_bytes(buffer) == 1)
    }

    /// Start continuous measurement at the configured interval.
    ///
    /// `ambient_pressure_mbar` of 0 disables pressure compensation;
    /// otherwise 700 to 1400 mbar. Out-of-range values are rejected
    /// before any bus traffic is generated.
    pub fn start_periodic_measurement(
        &mut self,
        ambient_pressure_mbar: u16,
    ) -> Result<(), Scd30Error<E>> {
        if ambient_pressure_mbar != 0 && !(700..=1400).contains(&ambient_pressure_mbar) {
            return Err(Scd30Error::OutOfRange);
        }

        self.send_command(
            Command::StartContinuousMeasurement,
            Some(ambient_pressure_mbar),
        )
    }

    /// Start a single-shot measurement.
    pub fn start_single_measurement(&mut self) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::StartSingleMeasurement, Some(0x0000))
    }

    /// Stop any ongoing measurement and disable the periodic mode.
    pub fn stop_measurement(&mut self) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::StopMeasurement, None)
    }

    /// Configure the interval between continuous measurements, 2 to
    /// 1800 seconds. Out-of-range values are rejected before any bus
    /// traffic is generated.
    pub fn set_measurement_interval(&mut self, seconds: u16) -> Result<(), Scd30Error<E>> {
        if !(2..=1800).contains(&seconds) {
            return Err(Scd30Error::OutOfRange);
        }

        self.send_command(Command::SetMeasurementInterval, Some(seconds))
    }

    /// Read the last measurement from the sensor buffer.
    pub fn read_measurement(&mut self) -> Result<Measurement, Scd30Error<E>> {
        self.send_command(Command::ReadMeasurementBuffer, None)?;

        // 3 * 4 data bytes; the wire adds one checksum per 2-byte word.
        let mut buffer = [0u8; 12];
        self.read_phase(&mut buffer)?;

        Ok(Measurement {
            co2: f32_from_be(&buffer[0..4]),
            temperature: f32_from_be(&buffer[4..8]),
            humidity: f32_from_be(&buffer[8..12]),
        })
    }

    /// Force recalibration to a reference CO2 concentration, 400 to
    /// 2000 ppm.
    pub fn set_forced_recalibration(&mut self, co2_ppm: u16) -> Result<(), Scd30Error<E>> {
        if !(400..=2000).contains(&co2_ppm) {
            return Err(Scd30Error::OutOfRange);
        }

        self.send_command(Command::SetForcedRecalibration, Some(co2_ppm))
    }

    /// Compensate for heat from nearby electronics, in hundredths of a
    /// degree (e.g. 300 for 3 °C). The offset is only positive.
    pub fn set_temperature_offset(
        &mut self,
        offset_centi_celsius: u16,
    ) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::SetTemperatureOffset, Some(offset_centi_celsius))
    }

    /// Compensate for altitude above sea level, in meters.
    pub fn set_altitude_compensation(&mut self, altitude_meters: u16) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::SetAltitudeCompensation, Some(altitude_meters))
    }

    /// Enable or disable automatic self-calibration.
    pub fn set_auto_self_calibration(&mut self, enable: bool) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::AutomaticSelfCalibration, Some(u16::from(enable)))
    }

    /// Read the firmware version as (major, minor).
    pub fn read_firmware_version(&mut self) -> Result<(u8, u8), Scd30Error<E>> {
        self.send_command(Command::ReadFirmwareVersion, None)?;

        let mut buffer = [0u8; 2];
        self.read_phase(&mut buffer)?;

        Ok((buffer[0], buffer[1]))
    }

    /// Perform a **soft reset** of the sensor, without turning the
    /// power off and on again.
    pub fn soft_reset(&mut self) -> Result<(), Scd30Error<E>> {
        self.send_command(Command::SoftReset, None)
    }

    /// Release the line handles and the delay provider.
    pub fn free(self) -> (SDA, SCL, D) {
        self.bus.free()
    }

    /// Write access carrying `command` and, when present, one
    /// checksummed argument word.
    fn send_command(
        &mut self,
        command: Command,
        argument: Option<u16>,
    ) -> Result<(), Scd30Error<E>> {
        let result = self.write_access(command, argument);
        self.stop_access(result)
    }

    fn write_access(
        &mut self,
        command: Command,
        argument: Option<u16>,
    ) -> Result<(), Scd30Error<E>> {
        self.start_write_access()?;
        self.write_command(command)?;
        if let Some(word) = argument {
            self.write_word_with_checksum(word)?;
        }
        Ok(())
    }

    /// Read phase of a two-part transaction: address the sensor for
    /// reading and drain `out.len()` data bytes plus checksums.
    fn read_phase(&mut self, out: &mut [u8]) -> Result<(), Scd30Error<E>> {
        let result = self.read_access(out);
        self.stop_access(result)
    }

    fn read_access(&mut self, out: &mut [u8]) -> Result<(), Scd30Error<E>> {
        self.start_read_access()?;
        self.read_and_strip_checksum(out)
    }

    /// Issue the closing stop condition. The bus is released even when
    /// the transfer already failed; the transfer error takes precedence
    /// over a stop-condition error.
    fn stop_access<T>(&mut self, result: Result<T, Scd30Error<E>>) -> Result<T, Scd30Error<E>> {
        let stop = self.bus.stop_condition();
        let value = result?;
        stop?;
        Ok(value)
    }

    fn start_write_access(&mut self) -> Result<(), Scd30Error<E>> {
        self.bus.start_condition()?;
        self.bus.write_byte(self.address << 1, self.timeout_ms)?;
        Ok(())
    }

    fn start_read_access(&mut self) -> Result<(), Scd30Error<E>> {
        self.bus.start_condition()?;
        self.bus.write_byte(self.address << 1 | 0x01, self.timeout_ms)?;
        Ok(())
    }

    /// Write the 16-bit opcode, upper byte first. The opcode itself
    /// carries no checksum.
    fn write_command(&mut self, command: Command) -> Result<(), Scd30Error<E>> {
        let opcode = (command as u16).to_be_bytes();
        self.bus.write_byte(opcode[0], self.timeout_ms)?;
        self.bus.write_byte(opcode[1], self.timeout_ms)?;
        Ok(())
    }

    /// Write one 16-bit word, upper byte first, followed by the CRC-8
    /// over the two data bytes.
    fn write_word_with_checksum(&mut self, word: u16) -> Result<(), Scd30Error<E>> {
        let bytes = word.to_be_bytes();
        self.bus.write_byte(bytes[0], self.timeout_ms)?;
        self.bus.write_byte(bytes[1], self.timeout_ms)?;
        self.bus.write_byte(CRC.checksum(&bytes), self.timeout_ms)?;
        Ok(())
    }

    /// Read one 16-bit word and its trailing checksum byte. The decoded
    /// word is returned even when the checksum mismatches, so the
    /// caller decides whether to trust it.
    fn read_word_with_checksum(&mut self, final_ack: Ack) -> Result<(u16, bool), Scd30Error<E>> {
        let msb = self.bus.read_byte(Ack::Ack, self.timeout_ms)?;
        let lsb = self.bus.read_byte(Ack::Ack, self.timeout_ms)?;
        let checksum = self.bus.read_byte(final_ack, self.timeout_ms)?;

        let word = u16::from_be_bytes([msb, lsb]);
        Ok((word, CRC.checksum(&[msb, lsb]) == checksum))
    }

    /// Fill `out` from a run of checksummed words, two data bytes per
    /// word, discarding each checksum byte. Only the final word is
    /// answered with a negative acknowledge.
    ///
    /// A checksum mismatch does not cut the run short: the remaining
    /// words are still read and acknowledged so the bus sequence stays
    /// intact, and the failure is reported once the run completes.
    fn read_and_strip_checksum(&mut self, out: &mut [u8]) -> Result<(), Scd30Error<E>> {
        let words = (out.len() + 1) / 2;
        let mut checksum_ok = true;

        for (index, chunk) in out.chunks_mut(2).enumerate() {
            let final_ack = if index + 1 == words { Ack::Nack } else { Ack::Ack };
            let (word, ok) = self.read_word_with_checksum(final_ack)?;
            checksum_ok &= ok;
            chunk.copy_from_slice(&word.to_be_bytes()[..chunk.len()]);
        }

        if checksum_ok {
            Ok(())
        } else {
            Err(Scd30Error::Checksum)
        }
    }
}

/// Build the 32-bit pattern from four big-endian bytes, then
/// reinterpret it as an IEEE-754 single-precision float.
fn f32_from_be(bytes: &[u8]) -> f32 {
    // Callers always slice exactly four bytes: safe to unwrap.
    f32::from_bits(u32::from_be_bytes(bytes.try_into().unwrap()))
}
