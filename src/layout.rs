//! Byte layout of the persistent store. Every structure is serialized field by field with a fixed
//! width and byte order so images are portable between targets.
//!
//! ```text
//! 0x0000  tag id (LE u16)
//! 0x0002  check bytes 0xBE 0xEF
//! 0x0004  configuration block
//! 0x0010  session records, RECORD_SIZE stride, until the end of the store
//! ```

use crate::config::CONFIG_SIZE;

pub const IDENTITY_ADDRESS: u32 = 0x00;
pub const IDENTITY_SIZE: usize = 4;
pub const CHECK_BYTES: [u8; 2] = [0xBE, 0xEF];

pub const CONFIG_ADDRESS: u32 = IDENTITY_ADDRESS + IDENTITY_SIZE as u32;

pub const RECORDS_ADDRESS: u32 = CONFIG_ADDRESS + CONFIG_SIZE as u32;
pub const RECORD_SIZE: usize = 11;
pub const RECORD_CHECK: u8 = 0x5A;
pub const RECORD_CHECK_CLEARED: u8 = 0xFF;

const _: () = assert!(
    RECORDS_ADDRESS == 0x10,
    "Session records must start right after the configuration block"
);

/// The identity header: the tag id guarded by two check bytes.
pub(crate) fn encode_identity(tag_id: u16) -> [u8; IDENTITY_SIZE] {
    let [lo, hi] = tag_id.to_le_bytes();
    [lo, hi, CHECK_BYTES[0], CHECK_BYTES[1]]
}

pub(crate) fn decode_identity(raw: &[u8; IDENTITY_SIZE]) -> Option<u16> {
    if raw[2..4] != CHECK_BYTES {
        return None;
    }
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

/// A finished session as kept in the persistent store. Times are absolute seconds since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionRecord {
    pub tag_id: u16,
    pub first_seen: u32,
    pub last_seen: u32,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0u8; RECORD_SIZE];
        raw[0..2].copy_from_slice(&self.tag_id.to_le_bytes());
        raw[2..6].copy_from_slice(&self.first_seen.to_le_bytes());
        raw[6..10].copy_from_slice(&self.last_seen.to_le_bytes());
        raw[10] = RECORD_CHECK;
        raw
    }

    /// Returns `None` for a free slot.
    pub fn from_bytes(raw: &[u8; RECORD_SIZE]) -> Option<Self> {
        let tag_id = u16::from_le_bytes([raw[0], raw[1]]);
        if tag_id == 0 || raw[10] != RECORD_CHECK {
            return None;
        }

        Some(Self {
            tag_id,
            first_seen: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
            last_seen: u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]),
        })
    }
}

/// Addresses of all record slots of a store with the given capacity, lowest first.
pub(crate) fn record_slots(capacity: usize) -> impl Iterator<Item = u32> {
    let capacity = capacity as u32;
    (RECORDS_ADDRESS..)
        .step_by(RECORD_SIZE)
        .take_while(move |address| address + RECORD_SIZE as u32 <= capacity)
}
