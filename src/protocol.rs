//! Wire format of the radio frames.
//!
//! Every frame starts with an [`Opcode`] followed by a big-endian 16-bit tag id: the sender for
//! [`Opcode::Ping`] and [`Opcode::Ack`], the target for commands and the recorded remote tag for
//! data records. There is no authentication, any listener can decode any frame.

use crate::config::{CONFIG_SIZE, Configuration, TxRange};
use crate::error::Error;

/// Largest payload the radio carries in a single frame.
pub const MAX_PAYLOAD: usize = 32;

/// Opcode byte and tag id.
pub const HEADER_SIZE: usize = 3;

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    Ping = 0xA1,
    Ack = 0xA2,
    Start = 0xA3,
    Stop = 0xA4,
    Download = 0xA5,
    Reset = 0xA6,
    Diagnostic = 0xA7,
    DownloadAndReset = 0xA8,
    Data = 0xA9,
    WriteSetting = 0xAA,
    ReadSettings = 0xAB,
}

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SettingId {
    TxRange = 0,
    PingChannel = 1,
    ReaderChannel = 2,
    DownloadChannel = 3,
    PingPeriodMs = 4,
    ListenPeriodSecs = 5,
    ReaderPeriodSecs = 6,
    SessionTimeoutSecs = 7,
    Defaults = 8,
}

impl SettingId {
    /// Number of value bytes following the setting id.
    pub const fn value_width(self) -> usize {
        match self {
            SettingId::TxRange
            | SettingId::PingChannel
            | SettingId::ReaderChannel
            | SettingId::DownloadChannel => 1,
            SettingId::PingPeriodMs
            | SettingId::ListenPeriodSecs
            | SettingId::ReaderPeriodSecs
            | SettingId::SessionTimeoutSecs => 2,
            SettingId::Defaults => 0,
        }
    }
}

/// A single configuration change carried by [`Opcode::WriteSetting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Setting {
    TxRange(TxRange),
    PingChannel(u8),
    ReaderChannel(u8),
    DownloadChannel(u8),
    PingPeriodMs(u16),
    ListenPeriodSecs(u16),
    ReaderPeriodSecs(u16),
    SessionTimeoutSecs(u16),
    Defaults,
}

impl Setting {
    pub fn id(&self) -> SettingId {
        match self {
            Setting::TxRange(_) => SettingId::TxRange,
            Setting::PingChannel(_) => SettingId::PingChannel,
            Setting::ReaderChannel(_) => SettingId::ReaderChannel,
            Setting::DownloadChannel(_) => SettingId::DownloadChannel,
            Setting::PingPeriodMs(_) => SettingId::PingPeriodMs,
            Setting::ListenPeriodSecs(_) => SettingId::ListenPeriodSecs,
            Setting::ReaderPeriodSecs(_) => SettingId::ReaderPeriodSecs,
            Setting::SessionTimeoutSecs(_) => SettingId::SessionTimeoutSecs,
            Setting::Defaults => SettingId::Defaults,
        }
    }

    /// Parses the part of a WRITE_SETTING frame after the tag id: setting id, then the value with
    /// 16-bit values in big-endian order.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let (&raw_id, value) = payload.split_first().ok_or(Error::FrameTooShort)?;
        let id = SettingId::from_repr(raw_id).ok_or(Error::UnknownSetting(raw_id))?;
        if value.len() < id.value_width() {
            return Err(Error::FrameTooShort);
        }

        let byte = || value[0];
        let word = || u16::from_be_bytes([value[0], value[1]]);
        Ok(match id {
            SettingId::TxRange => Setting::TxRange(TxRange::from_raw(byte())),
            SettingId::PingChannel => Setting::PingChannel(byte()),
            SettingId::ReaderChannel => Setting::ReaderChannel(byte()),
            SettingId::DownloadChannel => Setting::DownloadChannel(byte()),
            SettingId::PingPeriodMs => Setting::PingPeriodMs(word()),
            SettingId::ListenPeriodSecs => Setting::ListenPeriodSecs(word()),
            SettingId::ReaderPeriodSecs => Setting::ReaderPeriodSecs(word()),
            SettingId::SessionTimeoutSecs => Setting::SessionTimeoutSecs(word()),
            SettingId::Defaults => Setting::Defaults,
        })
    }

    fn encode_into(&self, packet: &mut Packet) {
        packet.push_u8(self.id() as u8);
        match *self {
            Setting::TxRange(range) => packet.push_u8(range.raw()),
            Setting::PingChannel(channel)
            | Setting::ReaderChannel(channel)
            | Setting::DownloadChannel(channel) => packet.push_u8(channel),
            Setting::PingPeriodMs(value)
            | Setting::ListenPeriodSecs(value)
            | Setting::ReaderPeriodSecs(value)
            | Setting::SessionTimeoutSecs(value) => packet.push_u16(value),
            Setting::Defaults => {}
        }
    }
}

/// A received frame, borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub opcode: Opcode,
    pub tag_id: u16,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, Error> {
        let (&opcode, rest) = raw.split_first().ok_or(Error::FrameTooShort)?;
        let opcode = Opcode::from_repr(opcode).ok_or(Error::UnknownOpcode(opcode))?;
        if raw.len() < HEADER_SIZE {
            return Err(Error::FrameTooShort);
        }

        Ok(Self {
            opcode,
            tag_id: u16::from_be_bytes([rest[0], rest[1]]),
            payload: &rest[2..],
        })
    }

    /// The "strong signal required" flag of a PING. Frames without the flag byte (a reader's
    /// discovery ping) do not require a strong signal.
    pub fn strong_required(&self) -> bool {
        self.payload.first().is_some_and(|&flag| flag != 0)
    }
}

/// One session as streamed during a download. All times are seconds relative to the start of the
/// current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataRecord {
    pub tag_id: u16,
    pub first_seen: u32,
    pub last_seen: u32,
    pub now: u32,
}

impl DataRecord {
    const SIZE: usize = HEADER_SIZE + 12;

    pub fn parse(frame: &Frame<'_>) -> Result<Self, Error> {
        if frame.opcode != Opcode::Data {
            return Err(Error::UnexpectedResponse(frame.opcode as u8));
        }
        let p = frame.payload;
        if p.len() < Self::SIZE - HEADER_SIZE {
            return Err(Error::FrameTooShort);
        }
        let word = |i: usize| u32::from_be_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);

        Ok(Self {
            tag_id: frame.tag_id,
            first_seen: word(0),
            last_seen: word(4),
            now: word(8),
        })
    }
}

/// Battery level and configuration block as returned by READ_SETTINGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SettingsReport {
    pub battery: u8,
    pub config: Configuration,
}

impl SettingsReport {
    /// The response has no tag id: the battery byte directly follows the opcode.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let (&opcode, rest) = raw.split_first().ok_or(Error::FrameTooShort)?;
        if opcode != Opcode::Data as u8 {
            return Err(Error::UnexpectedResponse(opcode));
        }
        let (&battery, block) = rest.split_first().ok_or(Error::FrameTooShort)?;
        let block: &[u8; CONFIG_SIZE] = block
            .get(..CONFIG_SIZE)
            .and_then(|block| block.try_into().ok())
            .ok_or(Error::FrameTooShort)?;

        Ok(Self {
            battery,
            config: Configuration::from_bytes(block),
        })
    }
}

/// Outgoing frame buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    buf: [u8; MAX_PAYLOAD],
    len: usize,
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Packet({:02x?})", self.as_bytes())
    }
}

impl Packet {
    pub const fn empty() -> Self {
        Self {
            buf: [0u8; MAX_PAYLOAD],
            len: 0,
        }
    }

    pub fn addressed(opcode: Opcode, tag_id: u16) -> Self {
        let mut packet = Self::empty();
        packet.push_u8(opcode as u8);
        packet.push_u16(tag_id);
        packet
    }

    /// Copies a received frame, truncated to [`MAX_PAYLOAD`].
    pub fn from_slice(raw: &[u8]) -> Self {
        let mut packet = Self::empty();
        let len = raw.len().min(MAX_PAYLOAD);
        packet.buf[..len].copy_from_slice(&raw[..len]);
        packet.len = len;
        packet
    }

    pub fn ping(sender: u16, strong_required: bool) -> Self {
        let mut packet = Self::addressed(Opcode::Ping, sender);
        packet.push_u8(strong_required as u8);
        packet
    }

    pub fn ack(sender: u16, battery: Option<u8>) -> Self {
        let mut packet = Self::addressed(Opcode::Ack, sender);
        if let Some(battery) = battery {
            packet.push_u8(battery);
        }
        packet
    }

    pub fn data_record(record: &DataRecord) -> Self {
        let mut packet = Self::addressed(Opcode::Data, record.tag_id);
        packet.push_u32(record.first_seen);
        packet.push_u32(record.last_seen);
        packet.push_u32(record.now);
        packet
    }

    pub fn settings_report(report: &SettingsReport) -> Self {
        let mut packet = Self::empty();
        packet.push_u8(Opcode::Data as u8);
        packet.push_u8(report.battery);
        packet.push_slice(&report.config.to_bytes());
        packet
    }

    pub fn write_setting(target: u16, setting: &Setting) -> Self {
        let mut packet = Self::addressed(Opcode::WriteSetting, target);
        setting.encode_into(&mut packet);
        packet
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push_slice(&[value]);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.push_slice(&value.to_be_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push_slice(&value.to_be_bytes());
    }

    /// Appends as much of `bytes` as still fits.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(MAX_PAYLOAD - self.len);
        self.buf[self.len..self.len + len].copy_from_slice(&bytes[..len]);
        self.len += len;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn frame(&self) -> Result<Frame<'_>, Error> {
        Frame::parse(self.as_bytes())
    }
}
