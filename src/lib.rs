//! # Si4703 Driver
//!
//! This is a driver for the Silicon Labs Si4703 FM radio receiver, with RDS
//! support.
//!
//! The Si4703 is controlled over I²C through a block of sixteen 16-bit
//! registers. The chip has an unusual bus interface:
//!
//! * A read always starts at register `0x0A`, runs up to `0x0F`, and then wraps
//!   around to `0x00`. Reading all 32 bytes gives you every register.
//! * A write always starts at register `0x02`. There is no address byte.
//!
//! The [`Radio`] object keeps a copy of all sixteen registers. Every operation
//! refreshes that copy from the chip, changes a few bits and then writes the
//! control registers (`0x02` to `0x07`) back. Registers `0x08` (TEST2) and
//! `0x09` (BOOTCONFIG) hold calibration data and are never written.
//!
//! Frequencies are given in units of 100 kHz, so `973` is 97.3 MHz.
//!
//! # Example
//!
//! You might bring up the radio like this:
//!
//! ```rust,no_run
//! # use core::convert::Infallible;
//! # struct I2c;
//! # impl embedded_hal::blocking::i2c::Read for I2c {
//! #     type Error = ();
//! #     fn read(&mut self, _address: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
//! #         buffer.fill(0);
//! #         Ok(())
//! #     }
//! # }
//! # impl embedded_hal::blocking::i2c::Write for I2c {
//! #     type Error = ();
//! #     fn write(&mut self, _address: u8, _bytes: &[u8]) -> Result<(), Self::Error> {
//! #         Ok(())
//! #     }
//! # }
//! # struct Pin;
//! # impl embedded_hal::digital::v2::OutputPin for Pin {
//! #     type Error = Infallible;
//! #     fn set_low(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! #     fn set_high(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # struct Delay;
//! # impl embedded_hal::blocking::delay::DelayMs<u16> for Delay {
//! #     fn delay_ms(&mut self, _ms: u16) {}
//! # }
//! # let (mut i2c, reset, sdio, mut delay) = (I2c, Pin, Pin, Delay);
//! let config = si4703::Config::new(si4703::BAND_EUROPE);
//! let mut radio = si4703::Radio::new(reset, sdio, config);
//! if let Err(e) = radio.power_on(&mut i2c, &mut delay) {
//!     // Radio didn't respond
//! }
//! radio.set_volume(&mut i2c, 10).unwrap();
//! match radio.seek(&mut i2c, si4703::SeekDirection::Up) {
//!     Ok(si4703::NO_STATION) => {
//!         // Hit the band limit without finding anything
//!     }
//!     Ok(frequency) => {
//!         // Tuned to `frequency` (in units of 100 kHz)
//!     }
//!     Err(e) => {
//!         // Bus error, or the chip never finished seeking
//!     }
//! }
//! let mut name = [0u8; 9];
//! if let Ok(true) = radio.read_rds(&mut i2c, &mut delay, &mut name, 15_000) {
//!     // name[0..8] holds the station name
//! }
//! ```

#![no_std]
#![deny(unsafe_code)]
#![deny(missing_docs)]

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Read, Write};
use embedded_hal::digital::v2::OutputPin;

//
// Public Types
//

/// Which way a seek moves through the band.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SeekDirection {
    /// Seek towards lower frequencies
    Down,
    /// Seek towards higher frequencies
    Up,
}

/// Where the radio is in its power life-cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// [`Radio::power_on`] has never been called. The register cache is
    /// empty.
    Uninitialized,
    /// The radio is running.
    PoweredOn,
    /// The radio was powered down with [`Radio::power_off`], but is still
    /// configured and accessible over the bus.
    PoweredDown,
}

/// The chip operations that wait on the Seek/Tune Complete (STC) bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// A hardware seek
    Seek,
    /// A tune to a fixed channel
    Tune,
}

/// Everything that can go wrong talking to the radio.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The I²C bus refused a transaction (e.g. the chip did not ACK).
    Transport(E),
    /// The chip did not raise (or drop) STC within
    /// [`Config::stc_poll_limit`] register reads.
    Timeout(Operation),
    /// The reset line could not be driven.
    ///
    /// The HAL's pin error is not kept, as the two pins may have different
    /// error types.
    ResetPin,
    /// The SDIO line could not be driven while selecting 2-wire mode.
    SdioPin,
    /// The frequency is below the band's lower limit, or its channel number
    /// does not fit in the CHANNEL register.
    InvalidFrequency(u16),
    /// RDS buffers must hold at least 9 bytes.
    BufferTooSmall,
}

/// Describes a regional FM band in terms of the tuning law and the register
/// bits that select it.
///
/// Frequencies follow `frequency = spacing * channel + lower_limit`, all in
/// units of 100 kHz.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BandConfig {
    /// Bottom of the band, in units of 100 kHz.
    pub lower_limit: u16,
    /// Distance between channels, in units of 100 kHz.
    pub spacing: u16,
    /// The two BAND bits in SYSCONFIG2.
    ///
    /// Take the value from the datasheet, section 4.4
    pub band: u8,
    /// The two SPACE bits in SYSCONFIG2.
    ///
    /// Take the value from the datasheet, section 4.4
    pub space: u8,
    /// True for 50 µs de-emphasis (Europe, Japan), false for 75 µs (USA).
    pub de_emphasis_50us: bool,
}

/// Driver settings, fixed when the [`Radio`] is created.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// The regional band plan.
    pub band: BandConfig,
    /// How many register reads to make while waiting for STC to change
    /// before giving up with [`Error::Timeout`].
    pub stc_poll_limit: u32,
    /// RDS blocks whose block B value is not below this are not treated as
    /// part of the station name.
    pub rds_block_b_limit: u16,
}

/// Represents the state inside our Si4703 chip.
pub struct Radio<RST, SDIO> {
    reset_pin: RST,
    sdio_pin: SDIO,
    config: Config,
    power_state: PowerState,
    registers: [u16; NUM_REGISTERS],
}

/// A human-readable listing of the cached registers.
///
/// See [`Radio::dump`].
pub struct RegisterDump<'a> {
    registers: &'a [u16; NUM_REGISTERS],
}

//
// Private Types
//

/// The set of registers in the Si4703
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Register {
    DeviceId = 0x00,
    ChipId = 0x01,
    PowerConfig = 0x02,
    Channel = 0x03,
    SysConfig1 = 0x04,
    SysConfig2 = 0x05,
    SysConfig3 = 0x06,
    Test1 = 0x07,
    Test2 = 0x08,
    BootConfig = 0x09,
    StatusRssi = 0x0A,
    ReadChannel = 0x0B,
    RdsA = 0x0C,
    RdsB = 0x0D,
    RdsC = 0x0E,
    RdsD = 0x0F,
}

/// The registers we are allowed to change. These are the ones a push sends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ControlRegister {
    PowerConfig,
    Channel,
    SysConfig1,
    SysConfig2,
    SysConfig3,
    Test1,
}

/// A single bit within a register.
#[derive(Copy, Clone, Debug)]
struct Bit<R> {
    register: R,
    mask: u16,
}

//
// Public Data
//

/// The 7-bit I²C address of the Si4703.
pub const DEVICE_ADDRESS: u8 = 0x10;

/// The frequency returned by a seek that hit the band limit without finding a
/// station.
pub const NO_STATION: u16 = 0;

/// Europe: 87.5 - 108 MHz, 100 kHz spacing, 50 µs de-emphasis
pub const BAND_EUROPE: BandConfig = BandConfig {
    lower_limit: 875,
    spacing: 1,
    band: 0b00,
    space: 0b01,
    de_emphasis_50us: true,
};

/// USA / Australia: 87.5 - 108 MHz, 200 kHz spacing, 75 µs de-emphasis
pub const BAND_USA: BandConfig = BandConfig {
    lower_limit: 875,
    spacing: 2,
    band: 0b00,
    space: 0b00,
    de_emphasis_50us: false,
};

/// Japan (wide band): 76 - 108 MHz, 100 kHz spacing, 50 µs de-emphasis
pub const BAND_JAPAN_WIDE: BandConfig = BandConfig {
    lower_limit: 760,
    spacing: 1,
    band: 0b01,
    space: 0b01,
    de_emphasis_50us: true,
};

//
// Private Data
//

const NUM_REGISTERS: usize = 16;

/// Reads start here and wrap around after 0x0F.
const FIRST_READ_REGISTER: usize = Register::StatusRssi as usize;

/// Writes start here. We stop before TEST2.
const FIRST_WRITE_REGISTER: usize = Register::PowerConfig as usize;

const NUM_WRITE_REGISTERS: usize = 6;

const DEFAULT_STC_POLL_LIMIT: u32 = 20_000;

const DEFAULT_RDS_BLOCK_B_LIMIT: u16 = 500;

const CHANNEL_MASK: u16 = 0x01FF;
const READ_CHANNEL_MASK: u16 = 0x03FF;
const VOLUME_MASK: u16 = 0x000F;
const BAND_SPACE_MASK: u16 = 0x00F0;
const RSSI_MASK: u16 = 0x00FF;

/// Enables the crystal oscillator (XOSCEN plus a reserved bit), from AN230.
const TEST1_OSCILLATOR_ON: u16 = 0x8100;

// POWERCFG
const DMUTE: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 14);
const SKMODE: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 10);
const SEEKUP: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 9);
const SEEK: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 8);
const DISABLE: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 6);
const ENABLE: Bit<ControlRegister> = Bit::new(ControlRegister::PowerConfig, 0);

// CHANNEL
const TUNE: Bit<ControlRegister> = Bit::new(ControlRegister::Channel, 15);

// SYSCONFIG1
const RDS: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 12);
const DE: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 11);
const GPIO21: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 3);
const GPIO20: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 2);
const GPIO11: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 1);
const GPIO10: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig1, 0);

// SYSCONFIG3
const VOLEXT: Bit<ControlRegister> = Bit::new(ControlRegister::SysConfig3, 8);

// TEST1
const AHIZEN: Bit<ControlRegister> = Bit::new(ControlRegister::Test1, 14);

// STATUSRSSI
const RDSR: Bit<Register> = Bit::new(Register::StatusRssi, 15);
const STC: Bit<Register> = Bit::new(Register::StatusRssi, 14);
const SFBL: Bit<Register> = Bit::new(Register::StatusRssi, 13);
const ST: Bit<Register> = Bit::new(Register::StatusRssi, 8);

// Delays, in milliseconds
const RESET_SETTLE_MS: u16 = 1;
const OSCILLATOR_SETTLE_MS: u16 = 600;
const POWER_UP_MS: u16 = 110;
const POWER_DOWN_MS: u16 = 2;
const TUNE_START_MS: u16 = 60;
const TUNE_CLEAR_MS: u16 = 1;
const RDS_CLEAR_MS: u16 = 40;
const RDS_POLL_MS: u16 = 30;

//
// impls on Public Types
//

impl BandConfig {
    /// Convert a channel number into a frequency (in units of 100 kHz).
    ///
    /// Saturates at `u16::MAX` for channels beyond a custom band's range.
    pub fn frequency(&self, channel: u16) -> u16 {
        self.spacing
            .saturating_mul(channel)
            .saturating_add(self.lower_limit)
    }

    /// Convert a frequency (in units of 100 kHz) into a channel number.
    ///
    /// Frequencies between channels round down. Returns `None` if the
    /// frequency is below the bottom of the band, or if `spacing` is zero.
    pub fn channel(&self, frequency: u16) -> Option<u16> {
        frequency
            .checked_sub(self.lower_limit)?
            .checked_div(self.spacing)
    }
}

impl Config {
    /// Default settings for the given band.
    pub const fn new(band: BandConfig) -> Config {
        Config {
            band,
            stc_poll_limit: DEFAULT_STC_POLL_LIMIT,
            rds_block_b_limit: DEFAULT_RDS_BLOCK_B_LIMIT,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new(BAND_EUROPE)
    }
}

impl<RST, SDIO> Radio<RST, SDIO> {
    /// Create a new Si4703 proxy object.
    ///
    /// Nothing happens on the bus or the pins until you call
    /// [`Radio::power_on`].
    pub fn new(reset_pin: RST, sdio_pin: SDIO, config: Config) -> Radio<RST, SDIO> {
        Radio {
            reset_pin,
            sdio_pin,
            config,
            power_state: PowerState::Uninitialized,
            registers: [0; NUM_REGISTERS],
        }
    }

    /// Give back the reset and SDIO pins.
    pub fn release(self) -> (RST, SDIO) {
        (self.reset_pin, self.sdio_pin)
    }

    /// Get the settings this radio was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get where the radio is in its power life-cycle.
    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    /// Get the register cache, as of the last read from the chip.
    pub fn registers(&self) -> &[u16; NUM_REGISTERS] {
        &self.registers
    }

    /// Get something that prints the register cache, one register per line.
    pub fn dump(&self) -> RegisterDump<'_> {
        RegisterDump {
            registers: &self.registers,
        }
    }

    /// Power up the radio.
    ///
    /// If the radio was powered down with [`Radio::power_off`] it is just
    /// woken up again. Otherwise the chip is reset into 2-wire mode and goes
    /// through the full start-up sequence from AN230, which takes about
    /// 700 ms. The radio comes up unmuted with RDS on and the volume at its
    /// lowest setting.
    pub fn power_on<B, D, E>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
        D: DelayMs<u16>,
        RST: OutputPin,
        SDIO: OutputPin,
    {
        match self.power_state {
            PowerState::PoweredDown => self.wake(bus),
            PowerState::Uninitialized | PowerState::PoweredOn => self.cold_start(bus, delay),
        }
    }

    /// Put the radio into its low-power state.
    ///
    /// The register contents are kept, so a later [`Radio::power_on`] is
    /// quick. See AN230, "Powerdown Sequence".
    pub fn power_off<B, D, E>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
        D: DelayMs<u16>,
    {
        self.pull(bus)?;

        // Drive the GPIOs low to save current. GPIO3 is left alone as it
        // upsets XOSCEN.
        self.set_bit(GPIO21, true);
        self.set_bit(GPIO20, false);
        self.set_bit(GPIO11, true);
        self.set_bit(GPIO10, false);

        self.set_bit(DMUTE, false);
        self.set_bit(AHIZEN, true);
        self.set_bit(RDS, false);
        // ENABLE and DISABLE both high starts the powerdown
        self.set_bit(ENABLE, true);
        self.set_bit(DISABLE, true);
        self.push(bus)?;

        // 1.5 ms max until the chip clears ENABLE and DISABLE
        delay.delay_ms(POWER_DOWN_MS);

        self.power_state = PowerState::PoweredDown;
        #[cfg(feature = "defmt")]
        defmt::debug!("Si4703 powered down");
        Ok(())
    }

    /// Set the volume, from 0 (silent) to 30 (loudest).
    ///
    /// 0 to 15 use the extended (quieter) range of the chip; 16 to 30 use the
    /// normal range. Values over 30 are treated as 30.
    pub fn set_volume<B, E>(&mut self, bus: &mut B, volume: u8) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        let low_range = volume < 16;
        let mut level = volume;
        if level > 30 {
            level = 15;
        }
        if level > 15 {
            level -= 15;
        }

        self.pull(bus)?;
        self.set_register_bits(ControlRegister::SysConfig2, level as u16, VOLUME_MASK);
        self.set_bit(VOLEXT, low_range);
        self.push(bus)
    }

    /// Get the volume, from 0 to 30.
    ///
    /// See [`Radio::set_volume`].
    pub fn volume<B, E>(&mut self, bus: &mut B) -> Result<u8, Error<E>>
    where
        B: Read<Error = E>,
    {
        self.pull(bus)?;
        Ok(self.cached_volume())
    }

    /// Turn the volume up one step, and return the new volume (0 to 30).
    ///
    /// Going up from 15 moves from the extended range to the normal range.
    /// The volume stays at 30 once it gets there.
    pub fn increase_volume<B, E>(&mut self, bus: &mut B) -> Result<u8, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.pull(bus)?;
        let mut level = self.get_register_bits(Register::SysConfig2, VOLUME_MASK) + 1;
        if level > 15 {
            if self.is_set(VOLEXT) {
                self.set_bit(VOLEXT, false);
                level = 1;
            } else {
                level = 15;
            }
        }
        self.set_register_bits(ControlRegister::SysConfig2, level, VOLUME_MASK);
        self.push(bus)?;
        Ok(self.cached_volume())
    }

    /// Turn the volume down one step, and return the new volume (0 to 30).
    ///
    /// Going down from 16 moves from the normal range to the extended range.
    /// The volume stays at 0 once it gets there.
    pub fn decrease_volume<B, E>(&mut self, bus: &mut B) -> Result<u8, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.pull(bus)?;
        let current = self.get_register_bits(Register::SysConfig2, VOLUME_MASK);
        let level = if current > 1 {
            current - 1
        } else if self.is_set(VOLEXT) {
            0
        } else {
            self.set_bit(VOLEXT, true);
            15
        };
        self.set_register_bits(ControlRegister::SysConfig2, level, VOLUME_MASK);
        self.push(bus)?;
        Ok(self.cached_volume())
    }

    /// Flip the mute setting, and return true if the radio is now muted.
    pub fn toggle_mute<B, E>(&mut self, bus: &mut B) -> Result<bool, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.pull(bus)?;
        let muted = self.is_muted();
        // DMUTE is "disable mute", so setting it unmutes
        self.set_bit(DMUTE, muted);
        self.push(bus)?;
        Ok(self.is_muted())
    }

    /// Get whether the radio is muted.
    ///
    /// Reads from the cache, so this does not touch the bus.
    pub fn is_muted(&self) -> bool {
        !self.is_set(DMUTE)
    }

    /// Seek to the next station in the given direction.
    ///
    /// Seeking wraps around at the ends of the band. Returns the frequency of
    /// the station found, or [`NO_STATION`] if the chip gave up.
    pub fn seek<B, E>(&mut self, bus: &mut B, direction: SeekDirection) -> Result<u16, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.pull(bus)?;
        self.set_bit(SKMODE, true);
        self.set_bit(SEEKUP, direction == SeekDirection::Up);
        self.set_bit(SEEK, true);
        self.push(bus)?;

        if let Err(e) = self.wait_for_stc(bus, true, Operation::Seek) {
            return Err(self.abandon(bus, SEEK, e));
        }
        // SF/BL is only valid while STC is high
        let failed = self.is_set(SFBL);

        // The chip won't drop STC until it sees SEEK go low
        self.set_bit(SEEK, false);
        self.push(bus)?;
        self.wait_for_stc(bus, false, Operation::Seek)?;

        if failed {
            #[cfg(feature = "defmt")]
            defmt::debug!("Si4703 seek {} found nothing", direction);
            return Ok(NO_STATION);
        }
        self.channel(bus)
    }

    /// Seek to the next station above the current one.
    ///
    /// See [`Radio::seek`].
    pub fn seek_up<B, E>(&mut self, bus: &mut B) -> Result<u16, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.seek(bus, SeekDirection::Up)
    }

    /// Seek to the next station below the current one.
    ///
    /// See [`Radio::seek`].
    pub fn seek_down<B, E>(&mut self, bus: &mut B) -> Result<u16, Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.seek(bus, SeekDirection::Down)
    }

    /// Tune to the given frequency (in units of 100 kHz).
    ///
    /// Frequencies between channels round down to the channel below. Call
    /// [`Radio::channel`] to find out where the chip actually ended up.
    pub fn set_channel<B, D, E>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        frequency: u16,
    ) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
        D: DelayMs<u16>,
    {
        let channel = match self.config.band.channel(frequency) {
            Some(channel) if channel <= CHANNEL_MASK => channel,
            _ => return Err(Error::InvalidFrequency(frequency)),
        };

        // AN230, "Tuning"
        self.pull(bus)?;
        self.set_register_bits(ControlRegister::Channel, channel, CHANNEL_MASK);
        self.set_bit(TUNE, true);
        self.push(bus)?;

        // Tuning takes a while; no point hammering the bus straight away
        delay.delay_ms(TUNE_START_MS);
        if let Err(e) = self.wait_for_stc(bus, true, Operation::Tune) {
            return Err(self.abandon(bus, TUNE, e));
        }

        self.set_bit(TUNE, false);
        self.push(bus)?;

        delay.delay_ms(TUNE_CLEAR_MS);
        self.wait_for_stc(bus, false, Operation::Tune)
    }

    /// Get the frequency the radio is tuned to (in units of 100 kHz).
    pub fn channel<B, E>(&mut self, bus: &mut B) -> Result<u16, Error<E>>
    where
        B: Read<Error = E>,
    {
        self.pull(bus)?;
        let channel = self.get_register_bits(Register::ReadChannel, READ_CHANNEL_MASK);
        Ok(self.config.band.frequency(channel))
    }

    /// Get the received signal strength, in dBµV.
    pub fn signal_strength<B, E>(&mut self, bus: &mut B) -> Result<u8, Error<E>>
    where
        B: Read<Error = E>,
    {
        self.pull(bus)?;
        Ok(self.get_register_bits(Register::StatusRssi, RSSI_MASK) as u8)
    }

    /// Get whether the current station is being received in stereo.
    pub fn is_stereo<B, E>(&mut self, bus: &mut B) -> Result<bool, Error<E>>
    where
        B: Read<Error = E>,
    {
        self.pull(bus)?;
        Ok(self.is_set(ST))
    }

    /// Read the 8 character station name from RDS.
    ///
    /// The name arrives as four pairs of characters, in whatever order the
    /// station sends them. This keeps polling until all four pairs have
    /// arrived, or until `timeout_ms` milliseconds of waiting have passed.
    ///
    /// On success `buffer[0..8]` holds the name, `buffer[8]` is `0` and this
    /// returns `true`. On timeout `buffer[0]` is set to `0` (an empty string)
    /// and this returns `false`. The timeout is measured by adding up the
    /// delays between polls.
    pub fn read_rds<B, D, E>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<bool, Error<E>>
    where
        B: Read<Error = E>,
        D: DelayMs<u16>,
    {
        if buffer.len() < 9 {
            return Err(Error::BufferTooSmall);
        }

        let mut completed = [false; 4];
        let mut num_completed = 0;
        let mut elapsed_ms: u32 = 0;
        while num_completed < completed.len() && elapsed_ms < timeout_ms {
            self.pull(bus)?;
            if self.is_set(RDSR) {
                // The bottom two bits of block B say which pair this is
                let block_b = self.get_register_bits(Register::RdsB, 0xFFFF);
                let index = (block_b & 0b11) as usize;
                if !completed[index] && block_b < self.config.rds_block_b_limit {
                    completed[index] = true;
                    num_completed += 1;
                    let [high, low] = self.get_register_bits(Register::RdsD, 0xFFFF).to_be_bytes();
                    buffer[index * 2] = high;
                    buffer[index * 2 + 1] = low;
                }
                // Wait for RDSR to clear
                delay.delay_ms(RDS_CLEAR_MS);
                elapsed_ms = elapsed_ms.saturating_add(RDS_CLEAR_MS as u32);
            } else {
                delay.delay_ms(RDS_POLL_MS);
                elapsed_ms = elapsed_ms.saturating_add(RDS_POLL_MS as u32);
            }
        }

        if elapsed_ms >= timeout_ms {
            buffer[0] = 0;
            return Ok(false);
        }

        buffer[8] = 0;
        Ok(true)
    }

    /// Reset the chip into 2-wire mode and run the full start-up sequence.
    ///
    /// The chip picks its bus mode on the rising edge of reset: SEN is
    /// pulled high on the board, so SDIO low selects 2-wire (I²C).
    fn cold_start<B, D, E>(&mut self, bus: &mut B, delay: &mut D) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
        D: DelayMs<u16>,
        RST: OutputPin,
        SDIO: OutputPin,
    {
        self.sdio_pin.set_low().map_err(|_| Error::SdioPin)?;
        self.reset_pin.set_low().map_err(|_| Error::ResetPin)?;
        delay.delay_ms(RESET_SETTLE_MS);
        self.reset_pin.set_high().map_err(|_| Error::ResetPin)?;
        delay.delay_ms(RESET_SETTLE_MS);

        // Start the crystal oscillator (AN230)
        self.pull(bus)?;
        self.set_register_bits(ControlRegister::Test1, TEST1_OSCILLATOR_ON, 0xFFFF);
        self.push(bus)?;
        delay.delay_ms(OSCILLATOR_SETTLE_MS);

        self.pull(bus)?;
        self.set_bit(ENABLE, true);
        self.set_bit(DISABLE, false);
        self.set_bit(DMUTE, true);
        self.set_bit(RDS, true);
        self.push(bus)?;
        delay.delay_ms(POWER_UP_MS);

        self.pull(bus)?;
        let band = self.config.band;
        self.set_bit(DE, band.de_emphasis_50us);
        self.set_register_bits(
            ControlRegister::SysConfig2,
            ((band.band as u16 & 0b11) << 6) | ((band.space as u16 & 0b11) << 4),
            BAND_SPACE_MASK,
        );
        // Quietest audible volume
        self.set_register_bits(ControlRegister::SysConfig2, 0x0001, VOLUME_MASK);
        self.push(bus)?;

        self.power_state = PowerState::PoweredOn;
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Si4703 powered on, device 0x{:04x} chip 0x{:04x}",
            self.registers[Register::DeviceId as usize],
            self.registers[Register::ChipId as usize]
        );
        Ok(())
    }

    /// Bring the radio back from [`Radio::power_off`].
    fn wake<B, E>(&mut self, bus: &mut B) -> Result<(), Error<E>>
    where
        B: Read<Error = E> + Write<Error = E>,
    {
        self.pull(bus)?;
        self.set_bit(DMUTE, true);
        self.set_bit(AHIZEN, false);
        self.set_bit(RDS, true);
        self.set_bit(ENABLE, true);
        self.set_bit(DISABLE, false);
        self.push(bus)?;

        self.power_state = PowerState::PoweredOn;
        #[cfg(feature = "defmt")]
        defmt::debug!("Si4703 woken up");
        Ok(())
    }

    /// Keep reading the registers until STC is `set` (or isn't).
    fn wait_for_stc<B, E>(
        &mut self,
        bus: &mut B,
        set: bool,
        operation: Operation,
    ) -> Result<(), Error<E>>
    where
        B: Read<Error = E>,
    {
        for _ in 0..self.config.stc_poll_limit {
            self.pull(bus)?;
            if self.is_set(STC) == set {
                return Ok(());
            }
        }
        #[cfg(feature = "defmt")]
        defmt::warn!(
            "Si4703 {} timed out waiting for STC={}",
            operation,
            set
        );
        Err(Error::Timeout(operation))
    }

    /// Drop SEEK or TUNE after a failed wait, so the next operation can
    /// start a fresh one. The original error is handed back; a bus error
    /// while clearing the bit is dropped in its favour.
    fn abandon<B, E>(&mut self, bus: &mut B, bit: Bit<ControlRegister>, error: Error<E>) -> Error<E>
    where
        B: Write<Error = E>,
    {
        self.set_bit(bit, false);
        if self.push(bus).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("Si4703 could not clear SEEK/TUNE");
        }
        error
    }

    /// Transfer all sixteen registers from the actual chip into this proxy
    /// object, over I²C.
    fn pull<B, E>(&mut self, bus: &mut B) -> Result<(), Error<E>>
    where
        B: Read<Error = E>,
    {
        let mut buffer = [0u8; NUM_REGISTERS * 2];
        bus.read(DEVICE_ADDRESS, &mut buffer)
            .map_err(Error::Transport)?;
        self.load_registers(&buffer);
        Ok(())
    }

    /// Unpack a full read, which starts at STATUSRSSI and wraps after RDSD.
    fn load_registers(&mut self, buffer: &[u8; NUM_REGISTERS * 2]) {
        for (offset, bytes) in buffer.chunks_exact(2).enumerate() {
            let address = (FIRST_READ_REGISTER + offset) % NUM_REGISTERS;
            self.registers[address] = u16::from_be_bytes([bytes[0], bytes[1]]);
        }
    }

    /// Transfer the control registers from this proxy object to the actual
    /// chip, over I²C.
    fn push<B, E>(&mut self, bus: &mut B) -> Result<(), Error<E>>
    where
        B: Write<Error = E>,
    {
        let buffer = self.control_bytes();
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Setting Si4703 POWERCFG 0x{:04x} CHANNEL 0x{:04x} SYSCONFIG 0x{:04x} 0x{:04x} 0x{:04x} TEST1 0x{:04x}",
            self.registers[2],
            self.registers[3],
            self.registers[4],
            self.registers[5],
            self.registers[6],
            self.registers[7]
        );
        bus.write(DEVICE_ADDRESS, &buffer)
            .map_err(Error::Transport)
    }

    /// Pack the control registers in the order a write expects them. There's
    /// no register address; the chip always starts at POWERCFG.
    fn control_bytes(&self) -> [u8; NUM_WRITE_REGISTERS * 2] {
        let mut buffer = [0u8; NUM_WRITE_REGISTERS * 2];
        let control =
            &self.registers[FIRST_WRITE_REGISTER..FIRST_WRITE_REGISTER + NUM_WRITE_REGISTERS];
        for (bytes, value) in buffer.chunks_exact_mut(2).zip(control) {
            bytes.copy_from_slice(&value.to_be_bytes());
        }
        buffer
    }

    /// Work out the 0 to 30 volume from the cached VOLUME and VOLEXT bits.
    fn cached_volume(&self) -> u8 {
        let level = self.get_register_bits(Register::SysConfig2, VOLUME_MASK) as u8;
        if self.is_set(VOLEXT) {
            level
        } else {
            level + 15
        }
    }

    /// Update one of the control registers
    fn set_register_bits(&mut self, register: ControlRegister, value: u16, mask: u16) {
        let register: Register = register.into();
        // Clear the bits we want to change
        self.registers[register as usize] &= !mask;
        // Set any bits as necessary, but only in the cleared section
        self.registers[register as usize] |= value & mask;
    }

    /// Set or clear a single control bit
    fn set_bit(&mut self, bit: Bit<ControlRegister>, value: bool) {
        self.set_register_bits(bit.register, if value { 0xFFFF } else { 0 }, bit.mask);
    }

    /// Read back one of the cached registers
    fn get_register_bits(&self, register: Register, mask: u16) -> u16 {
        self.registers[register as usize] & mask
    }

    /// Read back a single cached bit, from any register
    fn is_set<R>(&self, bit: Bit<R>) -> bool
    where
        R: Into<Register>,
    {
        self.get_register_bits(bit.register.into(), bit.mask) != 0
    }
}

impl<'a> core::fmt::Display for RegisterDump<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Registers:")?;
        for register in Register::ALL {
            writeln!(
                f,
                "{:02X} {:<10}: {:04X}",
                register as u8,
                register.name(),
                self.registers[register as usize]
            )?;
        }
        Ok(())
    }
}

//
// impls on Private Types
//

impl Register {
    /// Every register, in address order
    const ALL: [Register; NUM_REGISTERS] = [
        Register::DeviceId,
        Register::ChipId,
        Register::PowerConfig,
        Register::Channel,
        Register::SysConfig1,
        Register::SysConfig2,
        Register::SysConfig3,
        Register::Test1,
        Register::Test2,
        Register::BootConfig,
        Register::StatusRssi,
        Register::ReadChannel,
        Register::RdsA,
        Register::RdsB,
        Register::RdsC,
        Register::RdsD,
    ];

    /// The datasheet's name for this register
    fn name(self) -> &'static str {
        match self {
            Register::DeviceId => "DEVICEID",
            Register::ChipId => "CHIPID",
            Register::PowerConfig => "POWERCFG",
            Register::Channel => "CHANNEL",
            Register::SysConfig1 => "SYSCONFIG1",
            Register::SysConfig2 => "SYSCONFIG2",
            Register::SysConfig3 => "SYSCONFIG3",
            Register::Test1 => "TEST1",
            Register::Test2 => "TEST2",
            Register::BootConfig => "BOOTCONFIG",
            Register::StatusRssi => "STATUSRSSI",
            Register::ReadChannel => "READCHAN",
            Register::RdsA => "RDSA",
            Register::RdsB => "RDSB",
            Register::RdsC => "RDSC",
            Register::RdsD => "RDSD",
        }
    }
}

impl From<ControlRegister> for Register {
    fn from(register: ControlRegister) -> Register {
        match register {
            ControlRegister::PowerConfig => Register::PowerConfig,
            ControlRegister::Channel => Register::Channel,
            ControlRegister::SysConfig1 => Register::SysConfig1,
            ControlRegister::SysConfig2 => Register::SysConfig2,
            ControlRegister::SysConfig3 => Register::SysConfig3,
            ControlRegister::Test1 => Register::Test1,
        }
    }
}

impl<R> Bit<R> {
    const fn new(register: R, bit: u8) -> Bit<R> {
        Bit {
            register,
            mask: 1 << bit,
        }
    }
}


//
// End of file
//
