#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::{ReadStorage, Storage};
use proximity_tag::config::Configuration;
use proximity_tag::layout::{RECORD_SIZE, RECORDS_ADDRESS};
use proximity_tag::platform::{
    Board, Clock, EepromBus, PowerLevel, Radio, STATUS_WEL, STATUS_WIP,
};
use proximity_tag::protocol::{MAX_PAYLOAD, Opcode, Packet};
use proximity_tag::store;
use std::cell::Cell;
use std::collections::VecDeque;

pub const TAG_ID: u16 = 0x0042;
pub const LOCATOR_ID: u16 = 40000;

/// Store size used by most tests: room for 32 records.
pub const STORE_SIZE: usize = RECORDS_ADDRESS as usize + 32 * RECORD_SIZE;

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
}

/// Byte addressable in-memory store, erased to 0xFF like a fresh EEPROM.
#[derive(Default)]
pub struct MemStore {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
}

impl MemStore {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0xffu8; size],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(size: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; size],
            fail_after_operation,
            ..Default::default()
        }
    }

    /// A store with identity header and factory settings.
    pub fn provisioned(tag_id: u16) -> Self {
        let mut store = Self::new(STORE_SIZE);
        store::write_identity(&mut store, tag_id).unwrap();
        Configuration::default().persist(&mut store).unwrap();
        store.operations.clear();
        store
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn fail_now(&mut self) {
        self.fail_after_operation = self.operations.len();
    }

    pub fn writes(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .cloned()
            .collect()
    }

    pub fn slot(&self, index: usize) -> &[u8] {
        let start = RECORDS_ADDRESS as usize + index * RECORD_SIZE;
        &self.buf[start..start + RECORD_SIZE]
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

#[derive(Debug)]
pub struct StoreFault;

impl ReadStorage for MemStore {
    type Error = StoreFault;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.operations.len() >= self.fail_after_operation {
            println!("    store: FAULT");
            return Err(StoreFault);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Storage for MemStore {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        println!(
            "    store: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    store: FAULT");
            return Err(StoreFault);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Board with a fake clock. Every clock read advances time by one millisecond so busy waits
/// terminate; delays and sleeps advance it by their duration.
pub struct FakeBoard {
    pub now: Cell<u32>,
    pub battery: u8,
    pub sleeps: Vec<u32>,
    pub suspends: usize,
    pub can_suspend: bool,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self::starting_at(1000)
    }

    pub fn starting_at(now: u32) -> Self {
        Self {
            now: Cell::new(now),
            battery: 200,
            sleeps: Vec::new(),
            suspends: 0,
            can_suspend: true,
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for FakeBoard {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(1));
        now
    }
}

impl Board for FakeBoard {
    fn delay_ms(&mut self, ms: u32) {
        self.advance(ms);
    }

    fn sleep_ms(&mut self, ms: u32) {
        self.sleeps.push(ms);
        self.advance(ms);
    }

    fn battery_level(&mut self) -> u8 {
        self.battery
    }

    fn suspend_until_wake(&mut self) -> bool {
        if !self.can_suspend {
            return false;
        }
        self.suspends += 1;
        self.advance(60_000);
        true
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Sent {
    pub channel: u8,
    pub power: Option<PowerLevel>,
    pub bytes: Vec<u8>,
}

impl Sent {
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn is(&self, opcode: Opcode) -> bool {
        self.bytes.first() == Some(&(opcode as u8))
    }
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub channel: u8,
    pub bytes: Vec<u8>,
    pub strong: bool,
}

#[derive(Debug)]
pub struct RadioFault;

/// Scripted radio. Frames are heard only while listening and only on the channel they were queued
/// for. `replies` are queued one batch per transmitted frame, to script request/response
/// exchanges.
#[derive(Default)]
pub struct MockRadio {
    pub channel: u8,
    pub power: Option<PowerLevel>,
    pub listening: bool,
    pub powered: bool,
    pub inbound: VecDeque<Inbound>,
    pub replies: VecDeque<Vec<Inbound>>,
    pub sent: Vec<Sent>,
    pub fail_send: bool,
    last_strong: bool,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, channel: u8, bytes: &[u8], strong: bool) {
        self.inbound.push_back(Inbound {
            channel,
            bytes: bytes.to_vec(),
            strong,
        });
    }

    pub fn queue_packet(&mut self, channel: u8, packet: &Packet) {
        self.queue(channel, packet.as_bytes(), true);
    }

    pub fn reply(&mut self, batch: Vec<Inbound>) {
        self.replies.push_back(batch);
    }

    pub fn sent_on(&self, channel: u8) -> Vec<&Sent> {
        self.sent.iter().filter(|s| s.channel == channel).collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.sent.iter().filter(|s| s.is(opcode)).count()
    }
}

pub fn inbound(channel: u8, packet: &Packet, strong: bool) -> Inbound {
    Inbound {
        channel,
        bytes: packet.as_bytes().to_vec(),
        strong,
    }
}

impl Radio for MockRadio {
    type Error = RadioFault;

    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    fn set_power_level(&mut self, level: PowerLevel) {
        self.power = Some(level);
    }

    fn start_listening(&mut self) {
        self.listening = true;
    }

    fn stop_listening(&mut self) {
        self.listening = false;
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        assert!(!self.listening, "transmitting while listening");
        assert!(payload.len() <= MAX_PAYLOAD);
        if self.fail_send {
            return Err(RadioFault);
        }

        self.sent.push(Sent {
            channel: self.channel,
            power: self.power,
            bytes: payload.to_vec(),
        });
        if let Some(batch) = self.replies.pop_front() {
            self.inbound.extend(batch);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8; MAX_PAYLOAD]) -> Option<usize> {
        if !self.listening {
            return None;
        }
        let index = self
            .inbound
            .iter()
            .position(|frame| frame.channel == self.channel)?;
        let frame = self.inbound.remove(index)?;

        buf[..frame.bytes.len()].copy_from_slice(&frame.bytes);
        self.last_strong = frame.strong;
        Some(frame.bytes.len())
    }

    fn signal_strong(&mut self) -> bool {
        self.last_strong
    }

    fn flush_rx(&mut self) {
        let channel = self.channel;
        self.inbound.retain(|frame| frame.channel != channel);
    }

    fn power_up(&mut self) {
        self.powered = true;
    }

    fn power_down(&mut self) {
        self.powered = false;
    }
}

/// SPI EEPROM model with status register. `busy_polls` status reads report a write in progress
/// after each program; `stuck_wel` keeps the latch set as if the device rejected the write.
#[derive(Default)]
pub struct MockEepromBus {
    pub mem: Vec<u8>,
    pub wel: bool,
    pub busy: usize,
    pub busy_polls: usize,
    pub stuck_wel: bool,
    pub ignore_write_enable: bool,
    pub programs: Vec<(u32, u8)>,
}

impl MockEepromBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xffu8; size],
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct BusFault;

impl EepromBus for MockEepromBus {
    type Error = BusFault;

    fn read(&mut self, address: u32) -> Result<u8, Self::Error> {
        self.mem.get(address as usize).copied().ok_or(BusFault)
    }

    fn write_enable(&mut self) -> Result<(), Self::Error> {
        if !self.ignore_write_enable {
            self.wel = true;
        }
        Ok(())
    }

    fn read_status(&mut self) -> Result<u8, Self::Error> {
        let mut status = 0;
        if self.busy > 0 {
            self.busy -= 1;
            status |= STATUS_WIP;
        }
        if self.wel {
            status |= STATUS_WEL;
        }
        Ok(status)
    }

    fn program(&mut self, address: u32, byte: u8) -> Result<(), Self::Error> {
        if !self.wel {
            return Ok(());
        }
        self.mem[address as usize] = byte;
        self.programs.push((address, byte));
        self.busy = self.busy_polls;
        self.wel = self.stuck_wel;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}
