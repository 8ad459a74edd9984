//! The settings block. It lives in RAM, is mirrored right behind the identity header of the
//! persistent store and is validated once at boot.

use crate::error::Error;
use crate::layout::CONFIG_ADDRESS;
use crate::platform::PowerLevel;
use crate::protocol::Setting;
use crate::store;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use embedded_storage::Storage;

pub const PING_CHANNEL: u8 = 100;
pub const READER_CHANNEL: u8 = 110;
pub const DOWNLOAD_CHANNEL: u8 = 120;

pub const DEFAULT_PING_PERIOD_MS: u16 = 350;
pub const DEFAULT_LISTEN_PERIOD_SECS: u16 = 10;
pub const DEFAULT_READER_PERIOD_SECS: u16 = 5;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u16 = 120;
pub const DEFAULT_TX_POWER: PowerLevel = PowerLevel::Low;
pub const DEFAULT_PING_STRONG: bool = false;

pub const CONFIG_SIZE: usize = 12;

const STRONG_FLAG: u8 = 0b1000_0000;

/// Transmit range code: power level in the low bits, bit 7 set when peers must receive the ping
/// with a strong signal to count it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxRange(u8);

impl TxRange {
    pub const fn new(level: PowerLevel, strong_required: bool) -> Self {
        let flag = if strong_required { STRONG_FLAG } else { 0 };
        Self(level as u8 | flag)
    }

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub fn power_level(self) -> PowerLevel {
        // anything above 3 means minimum power
        PowerLevel::from_repr(self.0 & !STRONG_FLAG).unwrap_or(PowerLevel::Min)
    }

    pub const fn strong_required(self) -> bool {
        self.0 & STRONG_FLAG != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Configuration {
    pub tx_range: TxRange,
    pub ping_channel: u8,
    pub reader_channel: u8,
    pub download_channel: u8,
    pub ping_period_ms: u16,
    pub listen_period_secs: u16,
    pub reader_period_secs: u16,
    pub session_timeout_secs: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            tx_range: TxRange::new(DEFAULT_TX_POWER, DEFAULT_PING_STRONG),
            ping_channel: PING_CHANNEL,
            reader_channel: READER_CHANNEL,
            download_channel: DOWNLOAD_CHANNEL,
            ping_period_ms: DEFAULT_PING_PERIOD_MS,
            listen_period_secs: DEFAULT_LISTEN_PERIOD_SECS,
            reader_period_secs: DEFAULT_READER_PERIOD_SECS,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

impl Configuration {
    pub fn to_bytes(&self) -> [u8; CONFIG_SIZE] {
        let mut raw = [0u8; CONFIG_SIZE];
        raw[0] = self.tx_range.raw();
        raw[1] = self.ping_channel;
        raw[2] = self.reader_channel;
        raw[3] = self.download_channel;
        raw[4..6].copy_from_slice(&self.ping_period_ms.to_le_bytes());
        raw[6..8].copy_from_slice(&self.listen_period_secs.to_le_bytes());
        raw[8..10].copy_from_slice(&self.reader_period_secs.to_le_bytes());
        raw[10..12].copy_from_slice(&self.session_timeout_secs.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8; CONFIG_SIZE]) -> Self {
        Self {
            tx_range: TxRange::from_raw(raw[0]),
            ping_channel: raw[1],
            reader_channel: raw[2],
            download_channel: raw[3],
            ping_period_ms: u16::from_le_bytes([raw[4], raw[5]]),
            listen_period_secs: u16::from_le_bytes([raw[6], raw[7]]),
            reader_period_secs: u16::from_le_bytes([raw[8], raw[9]]),
            session_timeout_secs: u16::from_le_bytes([raw[10], raw[11]]),
        }
    }

    /// Channels must match the reserved ones and no period may be zero. Anything else is treated
    /// as a corrupted block.
    pub fn is_valid(&self) -> bool {
        self.ping_channel == PING_CHANNEL
            && self.reader_channel == READER_CHANNEL
            && self.download_channel == DOWNLOAD_CHANNEL
            && self.ping_period_ms != 0
            && self.listen_period_secs != 0
            && self.reader_period_secs != 0
            && self.session_timeout_secs != 0
    }

    /// Reads the block from the store. A block failing [`Self::is_valid`] is replaced by the
    /// factory defaults, which are persisted right away. The flag reports whether that happened.
    pub fn load<S: Storage>(storage: &mut S) -> Result<(Self, bool), Error> {
        let mut raw = [0u8; CONFIG_SIZE];
        storage
            .read(CONFIG_ADDRESS, &mut raw)
            .map_err(|_| Error::StoreError)?;

        let config = Self::from_bytes(&raw);
        if config.is_valid() {
            #[cfg(feature = "defmt")]
            debug!("config: loaded {}", config);

            return Ok((config, false));
        }

        #[cfg(feature = "defmt")]
        warn!("config: invalid block, resetting to defaults");

        #[cfg(feature = "debug-logs")]
        println!("config: invalid block {raw:02x?}, resetting to defaults");

        Ok((Self::reset_to_defaults(storage)?, true))
    }

    pub fn reset_to_defaults<S: Storage>(storage: &mut S) -> Result<Self, Error> {
        let config = Self::default();
        config.persist(storage)?;
        Ok(config)
    }

    /// Writes the whole block. Unchanged bytes are skipped by the store.
    pub fn persist<S: Storage>(&self, storage: &mut S) -> Result<(), Error> {
        store::write_diffed(storage, CONFIG_ADDRESS, &self.to_bytes())
    }

    /// Changes a single field in RAM. Callers persist afterwards.
    pub fn apply(&mut self, setting: Setting) {
        #[cfg(feature = "defmt")]
        debug!("config: apply {}", setting);

        #[cfg(feature = "debug-logs")]
        println!("config: apply {setting:?}");

        match setting {
            Setting::TxRange(range) => self.tx_range = range,
            Setting::PingChannel(channel) => self.ping_channel = channel,
            Setting::ReaderChannel(channel) => self.reader_channel = channel,
            Setting::DownloadChannel(channel) => self.download_channel = channel,
            Setting::PingPeriodMs(ms) => self.ping_period_ms = ms,
            Setting::ListenPeriodSecs(secs) => self.listen_period_secs = secs,
            Setting::ReaderPeriodSecs(secs) => self.reader_period_secs = secs,
            Setting::SessionTimeoutSecs(secs) => self.session_timeout_secs = secs,
            Setting::Defaults => *self = Self::default(),
        }
    }

    pub fn ping_period_ms(&self) -> u32 {
        self.ping_period_ms as u32
    }

    pub fn listen_period_ms(&self) -> u32 {
        self.listen_period_secs as u32 * 1000
    }

    pub fn reader_period_ms(&self) -> u32 {
        self.reader_period_secs as u32 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_range_bits() {
        let range = TxRange::new(PowerLevel::High, true);
        assert_eq!(range.raw(), 0b1000_0001);
        assert!(range.strong_required());
        assert_eq!(range.power_level(), PowerLevel::High);

        assert_eq!(TxRange::from_raw(0x05).power_level(), PowerLevel::Min);
        assert!(!TxRange::from_raw(0x03).strong_required());
    }

    #[test]
    fn block_layout() {
        let config = Configuration::default();
        assert_eq!(
            config.to_bytes(),
            [2, 100, 110, 120, 0x5E, 0x01, 10, 0, 5, 0, 120, 0]
        );
        assert_eq!(Configuration::from_bytes(&config.to_bytes()), config);
    }

    #[test]
    fn validation() {
        assert!(Configuration::default().is_valid());
        assert!(!Configuration::from_bytes(&[0xFF; CONFIG_SIZE]).is_valid());

        let mut config = Configuration::default();
        config.session_timeout_secs = 0;
        assert!(!config.is_valid());

        let mut config = Configuration::default();
        config.apply(Setting::ReaderChannel(90));
        assert!(!config.is_valid());
    }
}
