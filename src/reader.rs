//! Host side of the protocol: the handheld reader that configures devices and collects their data.
//!
//! A reader finds a device by pinging on the reader channel, then addresses it on the download
//! channel. Every exchange is best effort; a device that does not answer in time is reported as
//! [`Error::Unreachable`].

use crate::config::Configuration;
use crate::error::Error;
use crate::platform::{Board, PowerLevel, Radio};
use crate::protocol::{
    DataRecord, Frame, MAX_PAYLOAD, Opcode, Packet, Setting, SettingsReport,
};
use crate::wait::{Deadline, elapsed};
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};

/// How long [`Reader::discover`] keeps pinging.
pub const DISCOVERY_TIMEOUT_MS: u32 = 6000;

/// Interval of the discovery pings, half the devices' reader window so none is missed.
pub const DISCOVERY_PING_INTERVAL_MS: u32 = 10;

/// Time for the device to follow onto the download channel.
pub const COMMAND_SETTLE_MS: u32 = 10;

/// Wait for the first answer to a command.
pub const RESPONSE_TIMEOUT_MS: u32 = 1000;

/// Largest gap between two frames of a download.
pub const DOWNLOAD_GAP_MS: u32 = 250;

pub struct Reader<R: Radio, B: Board> {
    radio: R,
    board: B,
    channels: Configuration,
    last_ping: Option<u32>,
}

impl<R: Radio, B: Board> Reader<R, B> {
    /// A reader on the factory channels.
    pub fn new(radio: R, board: B) -> Self {
        Self::with_channels(radio, board, Configuration::default())
    }

    /// A reader using the channels of `config`. Only the channel fields are used.
    pub fn with_channels(mut radio: R, board: B, config: Configuration) -> Self {
        radio.set_power_level(PowerLevel::Max);
        radio.power_up();
        Self {
            radio,
            board,
            channels: config,
            last_ping: None,
        }
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_parts(self) -> (R, B) {
        (self.radio, self.board)
    }

    /// Pings on the reader channel until a device close by answers. Only answers received with a
    /// strong signal count, so the device held next to the reader is picked.
    pub fn discover(&mut self) -> Result<u16, Error> {
        self.listen_on(self.channels.reader_channel);
        self.radio.flush_rx();

        let deadline = Deadline::after(&self.board, DISCOVERY_TIMEOUT_MS);
        while !deadline.expired(&self.board) {
            self.ping_if_due()?;
            if let Some(tag_id) = self.receive_strong_ping() {
                #[cfg(feature = "defmt")]
                debug!("reader: found {}", tag_id);

                return Ok(tag_id);
            }
        }

        #[cfg(feature = "defmt")]
        warn!("reader: no device found");

        Err(Error::NoDeviceFound)
    }

    /// Sends a command to `target` on the download channel and returns the first frame it answers
    /// with.
    pub fn send_command(
        &mut self,
        target: u16,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<Packet, Error> {
        let mut packet = Packet::addressed(opcode, target);
        packet.push_slice(payload);
        self.send_packet(&packet)
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<Packet, Error> {
        self.listen_on(self.channels.download_channel);
        self.board.delay_ms(COMMAND_SETTLE_MS);
        self.radio.flush_rx();

        #[cfg(feature = "defmt")]
        trace!("reader: < {}", packet.as_bytes());

        self.transmit(packet)?;

        let deadline = Deadline::after(&self.board, RESPONSE_TIMEOUT_MS);
        while !deadline.expired(&self.board) {
            if let Some(response) = self.receive() {
                return Ok(response);
            }
        }

        #[cfg(feature = "defmt")]
        warn!("reader: {} timed out", packet.as_bytes());

        Err(Error::Unreachable)
    }

    /// Starts a recording. Returns the battery level reported with the acknowledgment.
    pub fn start(&mut self, target: u16) -> Result<u8, Error> {
        let ack = self.send_command(target, Opcode::Start, &[])?;
        expect_ack(&ack)?;
        // older firmware acknowledges without the battery byte
        Ok(ack.as_bytes().get(3).copied().unwrap_or(0))
    }

    pub fn stop(&mut self, target: u16) -> Result<(), Error> {
        let ack = self.send_command(target, Opcode::Stop, &[])?;
        expect_ack(&ack)
    }

    pub fn reset(&mut self, target: u16) -> Result<(), Error> {
        let ack = self.send_command(target, Opcode::Reset, &[])?;
        expect_ack(&ack)
    }

    pub fn write_setting(&mut self, target: u16, setting: &Setting) -> Result<(), Error> {
        let ack = self.send_packet(&Packet::write_setting(target, setting))?;
        expect_ack(&ack)
    }

    pub fn read_settings(&mut self, target: u16) -> Result<SettingsReport, Error> {
        let report = self.send_command(target, Opcode::ReadSettings, &[])?;
        SettingsReport::parse(report.as_bytes())
    }

    /// Downloads every session `target` holds, passing each to `sink`. With `and_reset` the
    /// device stops recording afterwards. Returns the number of records received.
    ///
    /// The download is complete once the device acknowledges. A gap of more than
    /// [`DOWNLOAD_GAP_MS`] between frames aborts it.
    pub fn download<F>(&mut self, target: u16, and_reset: bool, mut sink: F) -> Result<usize, Error>
    where
        F: FnMut(DataRecord),
    {
        let opcode = if and_reset {
            Opcode::DownloadAndReset
        } else {
            Opcode::Download
        };
        let mut next = Some(self.send_command(target, opcode, &[])?);

        let mut count = 0;
        let mut deadline = Deadline::after(&self.board, DOWNLOAD_GAP_MS);
        loop {
            let Some(packet) = next.take().or_else(|| self.receive()) else {
                if deadline.expired(&self.board) {
                    #[cfg(feature = "defmt")]
                    warn!("reader: download from {} stalled after {} records", target, count);

                    return Err(Error::Unreachable);
                }
                continue;
            };

            let frame = match packet.frame() {
                Ok(frame) => frame,
                Err(_e) => {
                    #[cfg(feature = "defmt")]
                    trace!("reader: skipping frame: {}", _e);

                    continue;
                }
            };

            match frame.opcode {
                Opcode::Ack => {
                    #[cfg(feature = "defmt")]
                    debug!("reader: download from {} complete, {} records", target, count);

                    return Ok(count);
                }
                Opcode::Data => {
                    sink(DataRecord::parse(&frame)?);
                    count += 1;
                    deadline.restart(&self.board);
                }
                _other => {
                    #[cfg(feature = "defmt")]
                    trace!("reader: skipping {}", _other);
                }
            }
        }
    }

    /// One step of unattended collection: listens on the reader channel and downloads and stops
    /// the first device that comes close. Returns the id of the harvested device and the number of
    /// records it delivered.
    pub fn harvest<F>(&mut self, sink: F) -> Result<Option<(u16, usize)>, Error>
    where
        F: FnMut(DataRecord),
    {
        self.listen_on(self.channels.reader_channel);
        self.ping_if_due()?;

        let Some(tag_id) = self.receive_strong_ping() else {
            return Ok(None);
        };

        // devices answer with a burst of pings
        while self.receive().is_some() {}

        let count = self.download(tag_id, true, sink)?;
        self.listen_on(self.channels.reader_channel);
        Ok(Some((tag_id, count)))
    }

    fn ping_if_due(&mut self) -> Result<(), Error> {
        let now = self.board.now_ms();
        if self
            .last_ping
            .is_some_and(|last| elapsed(now, last) < DISCOVERY_PING_INTERVAL_MS)
        {
            return Ok(());
        }
        self.last_ping = Some(now);
        self.transmit(&Packet::addressed(Opcode::Ping, 0))
    }

    fn receive_strong_ping(&mut self) -> Option<u16> {
        let packet = self.receive()?;
        let strong = self.radio.signal_strong();
        let frame = Frame::parse(packet.as_bytes()).ok()?;
        (frame.opcode == Opcode::Ping && frame.tag_id != 0 && strong).then_some(frame.tag_id)
    }

    fn listen_on(&mut self, channel: u8) {
        self.radio.set_channel(channel);
        self.radio.start_listening();
    }

    fn transmit(&mut self, packet: &Packet) -> Result<(), Error> {
        self.radio.stop_listening();
        let sent = self
            .radio
            .send(packet.as_bytes())
            .map_err(|_| Error::RadioError);
        self.radio.start_listening();
        sent
    }

    fn receive(&mut self) -> Option<Packet> {
        let mut buf = [0u8; MAX_PAYLOAD];
        let len = self.radio.receive(&mut buf)?;
        Some(Packet::from_slice(&buf[..len.min(MAX_PAYLOAD)]))
    }
}

fn expect_ack(packet: &Packet) -> Result<(), Error> {
    match packet.as_bytes().first() {
        Some(&opcode) if opcode == Opcode::Ack as u8 => Ok(()),
        Some(&opcode) => Err(Error::UnexpectedResponse(opcode)),
        None => Err(Error::FrameTooShort),
    }
}
