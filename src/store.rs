//! Persistent store access. [`Eeprom`] drives an SPI EEPROM through the write enable handshake and
//! exposes it as [`embedded_storage::Storage`]; the free functions below implement the identity
//! header and the append-only session record array on top of any such storage.

use crate::error::Error;
use crate::layout::{
    IDENTITY_ADDRESS, IDENTITY_SIZE, RECORD_CHECK_CLEARED, RECORD_SIZE, SessionRecord,
    decode_identity, encode_identity, record_slots,
};
use crate::platform::{Clock, EepromBus, STATUS_WEL, STATUS_WIP};
use crate::wait::{self, Deadline};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};
use embedded_storage::{ReadStorage, Storage};

/// Upper bound for a single byte write to complete. Datasheet values are around 5 ms.
pub const WRITE_TIMEOUT_MS: u32 = 20;

pub struct Eeprom<B: EepromBus, C: Clock> {
    bus: B,
    clock: C,
}

impl<B: EepromBus, C: Clock> Eeprom<B, C> {
    pub fn new(bus: B, clock: C) -> Self {
        Self { bus, clock }
    }

    pub fn release(self) -> (B, C) {
        (self.bus, self.clock)
    }

    pub fn read_byte(&mut self, address: u32) -> Result<u8, Error> {
        self.check_address(address)?;
        self.bus.read(address).map_err(|_| Error::StoreError)
    }

    /// Writes a single byte unless it already holds the value. The write counts as successful once
    /// the device has cleared its write enable latch, which it does after the cell is programmed.
    pub fn write_byte(&mut self, address: u32, byte: u8) -> Result<(), Error> {
        if self.read_byte(address)? == byte {
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        trace!("eeprom: write @{:#06x} = {:#04x}", address, byte);

        self.bus.write_enable().map_err(|_| Error::StoreError)?;
        let status = self.bus.read_status().map_err(|_| Error::StoreError)?;
        if status & STATUS_WEL == 0 {
            return Err(Error::WriteNotEnabled);
        }

        self.bus
            .program(address, byte)
            .map_err(|_| Error::StoreError)?;

        let bus = &mut self.bus;
        let deadline = Deadline::after(&self.clock, WRITE_TIMEOUT_MS);
        let status = match wait::poll_until(&self.clock, deadline, || match bus.read_status() {
            Ok(status) if status & STATUS_WIP != 0 => None,
            other => Some(other),
        }) {
            Ok(status) => status.map_err(|_| Error::StoreError)?,
            Err(_) => {
                #[cfg(feature = "defmt")]
                warn!("eeprom: write @{:#06x} still in progress", address);

                self.bus.read_status().map_err(|_| Error::StoreError)?
            }
        };

        if status & STATUS_WEL != 0 {
            return Err(Error::WriteNotVerified);
        }
        Ok(())
    }

    fn check_address(&self, address: u32) -> Result<(), Error> {
        if address as usize >= self.bus.capacity() {
            return Err(Error::AddressOutOfRange);
        }
        Ok(())
    }
}

impl<B: EepromBus, C: Clock> ReadStorage for Eeprom<B, C> {
    type Error = Error;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        for (address, byte) in (offset..).zip(bytes.iter_mut()) {
            *byte = self.read_byte(address)?;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bus.capacity()
    }
}

impl<B: EepromBus, C: Clock> Storage for Eeprom<B, C> {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        for (address, &byte) in (offset..).zip(bytes) {
            self.write_byte(address, byte)?;
        }
        Ok(())
    }
}

/// Writes `bytes` at `offset`, touching only the runs of bytes that differ from what the storage
/// already holds.
pub fn write_diffed<S: Storage>(storage: &mut S, offset: u32, bytes: &[u8]) -> Result<(), Error> {
    const CHUNK: usize = 16;

    for (index, chunk) in bytes.chunks(CHUNK).enumerate() {
        let chunk_offset = offset + (index * CHUNK) as u32;
        let mut current = [0u8; CHUNK];
        let current = &mut current[..chunk.len()];
        storage
            .read(chunk_offset, current)
            .map_err(|_| Error::StoreError)?;

        let mut i = 0;
        while i < chunk.len() {
            if chunk[i] == current[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < chunk.len() && chunk[i] != current[i] {
                i += 1;
            }
            storage
                .write(chunk_offset + start as u32, &chunk[start..i])
                .map_err(|_| Error::StoreError)?;
        }
    }
    Ok(())
}

/// Reads the tag id of this device.
pub fn read_identity<S: Storage>(storage: &mut S) -> Result<u16, Error> {
    let mut raw = [0u8; IDENTITY_SIZE];
    storage
        .read(IDENTITY_ADDRESS, &mut raw)
        .map_err(|_| Error::StoreError)?;
    decode_identity(&raw).ok_or(Error::Unprovisioned)
}

pub fn write_identity<S: Storage>(storage: &mut S, tag_id: u16) -> Result<(), Error> {
    write_diffed(storage, IDENTITY_ADDRESS, &encode_identity(tag_id))
}

fn read_slot<S: Storage>(storage: &mut S, address: u32) -> Result<[u8; RECORD_SIZE], Error> {
    let mut raw = [0u8; RECORD_SIZE];
    storage
        .read(address, &mut raw)
        .map_err(|_| Error::StoreError)?;
    Ok(raw)
}

pub fn read_record<S: Storage>(
    storage: &mut S,
    address: u32,
) -> Result<Option<SessionRecord>, Error> {
    Ok(SessionRecord::from_bytes(&read_slot(storage, address)?))
}

/// The lowest addressed free record slot, if any.
pub fn first_free_slot<S: Storage>(storage: &mut S) -> Result<Option<u32>, Error> {
    for address in record_slots(storage.capacity()) {
        if read_record(storage, address)?.is_none() {
            return Ok(Some(address));
        }
    }
    Ok(None)
}

/// Stores a record in the first free slot. Returns the slot address, or `None` when the store is
/// exhausted and the record was not written.
pub fn append_record<S: Storage>(
    storage: &mut S,
    record: &SessionRecord,
) -> Result<Option<u32>, Error> {
    let Some(address) = first_free_slot(storage)? else {
        #[cfg(feature = "defmt")]
        warn!("store: full, dropping session of {}", record.tag_id);

        return Ok(None);
    };

    #[cfg(feature = "defmt")]
    trace!("store: append {} @{:#06x}", record.tag_id, address);

    #[cfg(feature = "debug-logs")]
    println!("store: append {record:?} @{address:#06x}");

    write_diffed(storage, address, &record.to_bytes())?;
    Ok(Some(address))
}

/// Invalidates every occupied slot by clearing its tag id and sentinel. The time fields are left
/// as they are. Returns the number of cleared records.
pub fn clear_records<S: Storage>(storage: &mut S) -> Result<usize, Error> {
    let mut cleared = 0;
    for address in record_slots(storage.capacity()) {
        let mut raw = read_slot(storage, address)?;
        if SessionRecord::from_bytes(&raw).is_none() {
            continue;
        }
        raw[0] = 0;
        raw[1] = 0;
        raw[RECORD_SIZE - 1] = RECORD_CHECK_CLEARED;
        write_diffed(storage, address, &raw)?;
        cleared += 1;
    }
    Ok(cleared)
}

/// Calls `f` for every occupied slot in ascending address order.
pub fn for_each_record<S, F>(storage: &mut S, mut f: F) -> Result<(), Error>
where
    S: Storage,
    F: FnMut(u32, SessionRecord) -> Result<(), Error>,
{
    for address in record_slots(storage.capacity()) {
        if let Some(record) = read_record(storage, address)? {
            f(address, record)?;
        }
    }
    Ok(())
}
