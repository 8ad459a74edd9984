use crate::config::Configuration;
use crate::error::Error;
use crate::layout::SessionRecord;
use crate::platform::{Board, PowerLevel, Radio};
use crate::protocol::{DataRecord, Frame, MAX_PAYLOAD, Opcode, Packet, Setting, SettingsReport};
use crate::session::SessionCache;
use crate::store;
use crate::wait::elapsed;
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};
use embedded_storage::Storage;

/// Highest tag id of a wearable tag. Larger ids belong to locators.
pub const MAX_TAG_ID: u16 = 32767;

/// A RESET less than this after the last one that cleared data is acknowledged but does nothing.
pub const RESET_DEBOUNCE_MS: u32 = 2000;

/// Gap between two streamed DATA frames, the reader has no flow control.
pub const DATA_PACING_MS: u32 = 2;

/// Time for the radio to become usable after a channel switch.
pub const CHANNEL_SETTLE_MS: u32 = 1;

/// Gap between the two copies of a beacon.
pub const BEACON_REPEAT_MS: u32 = 10;

/// Number of pings answering a reader, and the gap between them.
pub const ANNOUNCE_PINGS: usize = 3;
pub const ANNOUNCE_GAP_MS: u32 = 1;

/// A reader has to be close by, answer it quietly.
pub const READER_POWER_LEVEL: PowerLevel = PowerLevel::Min;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Wearable: beacons and records the tags around it.
    Tag,
    /// Stationary: only beacons.
    Locator,
}

impl Role {
    pub const fn of(tag_id: u16) -> Self {
        if tag_id > MAX_TAG_ID {
            Role::Locator
        } else {
            Role::Tag
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    Stopped,
    Active,
}

impl RunState {
    /// Devices ship stopped to protect the battery.
    pub const INITIAL: RunState = if cfg!(feature = "start-active") {
        RunState::Active
    } else {
        RunState::Stopped
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineStatistics {
    /// RESET and START commands that actually cleared the data.
    pub data_resets: u32,
    /// Sightings of new tags while the session cache was full.
    pub sightings_dropped: u32,
    /// Expired sessions that found no free slot in the store.
    pub records_lost: u32,
    pub store_failures: u32,
    pub frames_ignored: u32,
}

/// The device: configuration, session cache, run state and the hardware it drives. Constructed
/// once at boot and driven by [`crate::scheduler::Scheduler`].
pub struct Engine<S: Storage, R: Radio, B: Board> {
    store: S,
    radio: R,
    board: B,

    tag_id: u16,
    role: Role,
    config: Configuration,
    sessions: SessionCache,
    state: RunState,
    run_epoch_secs: u32,
    last_reset_ms: Option<u32>,
    statistics: EngineStatistics,
}

impl<S: Storage, R: Radio, B: Board> Engine<S, R, B> {
    /// Reads the identity and the configuration from the store and puts the radio on the ping
    /// channel. A corrupted configuration is silently replaced by the defaults.
    pub fn new(mut store: S, radio: R, board: B) -> Result<Self, Error> {
        let tag_id = store::read_identity(&mut store)?;
        let (config, _was_reset) = Configuration::load(&mut store)?;

        #[cfg(feature = "defmt")]
        debug!(
            "engine: tag id {}, {}, config reset: {}",
            tag_id,
            Role::of(tag_id),
            _was_reset
        );

        #[cfg(feature = "debug-logs")]
        println!(
            "engine: tag id {tag_id} ({:?}), config reset: {_was_reset}",
            Role::of(tag_id)
        );

        let run_epoch_secs = board.now_ms() / 1000;
        let mut engine = Self {
            store,
            radio,
            board,
            tag_id,
            role: Role::of(tag_id),
            config,
            sessions: SessionCache::new(),
            state: RunState::INITIAL,
            run_epoch_secs,
            last_reset_ms: None,
            statistics: EngineStatistics::default(),
        };
        engine.switch_to_ping_channel();
        Ok(engine)
    }

    pub fn tag_id(&self) -> u16 {
        self.tag_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == RunState::Active
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn statistics(&self) -> &EngineStatistics {
        &self.statistics
    }

    pub fn run_epoch_secs(&self) -> u32 {
        self.run_epoch_secs
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_parts(self) -> (S, R, B) {
        (self.store, self.radio, self.board)
    }

    pub fn now_ms(&self) -> u32 {
        self.board.now_ms()
    }

    /// Seconds since boot, the time base of sessions and records.
    pub fn seconds(&self) -> u32 {
        self.board.now_ms() / 1000
    }

    /// Seconds since the current run was started.
    pub fn run_secs(&self) -> u32 {
        self.seconds().wrapping_sub(self.run_epoch_secs)
    }

    pub fn stop(&mut self) {
        if self.state == RunState::Active {
            #[cfg(feature = "defmt")]
            debug!("engine: stopped");

            self.state = RunState::Stopped;
        }
    }

    /// Takes the next frame out of the radio, if one is pending.
    pub fn receive(&mut self) -> Option<Packet> {
        let mut buf = [0u8; MAX_PAYLOAD];
        let len = self.radio.receive(&mut buf)?;
        Some(Packet::from_slice(&buf[..len.min(MAX_PAYLOAD)]))
    }

    /// Handles one inbound frame. Frames that are malformed, addressed to another device or not
    /// meant for devices are ignored. Errors only report failures to answer or to persist.
    pub fn process(&mut self, raw: &[u8]) -> Result<(), Error> {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                trace!("engine: ignoring frame: {}", _e);

                self.statistics.frames_ignored += 1;
                return Ok(());
            }
        };

        if frame.opcode == Opcode::Ping {
            self.handle_ping(&frame);
            return Ok(());
        }

        if frame.tag_id != self.tag_id {
            self.statistics.frames_ignored += 1;
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        debug!("engine: > {}", frame.opcode);

        #[cfg(feature = "debug-logs")]
        println!("engine: > {}", frame.opcode);

        match frame.opcode {
            Opcode::Start => self.handle_start(),
            Opcode::Stop => self.handle_stop(),
            Opcode::Reset => self.handle_reset(),
            Opcode::Download => self.upload_data(false),
            Opcode::DownloadAndReset => self.upload_data(true),
            Opcode::ReadSettings => self.upload_settings(),
            Opcode::WriteSetting => self.handle_write_setting(frame.payload),
            Opcode::Ping | Opcode::Ack | Opcode::Data | Opcode::Diagnostic => {
                self.statistics.frames_ignored += 1;
                Ok(())
            }
        }
    }

    fn handle_ping(&mut self, frame: &Frame<'_>) {
        let remote = frame.tag_id;
        if self.state != RunState::Active
            || self.role == Role::Locator
            || remote == 0
            || remote == self.tag_id
        {
            return;
        }

        let strong = self.radio.signal_strong();
        if frame.strong_required() && !strong {
            return;
        }

        #[cfg(feature = "defmt")]
        trace!("engine: ping from {}, strong: {}", remote, strong);

        let now = self.seconds();
        match self.sessions.lookup_or_create(remote, now) {
            Some(session) => session.touch(now),
            None => {
                #[cfg(feature = "defmt")]
                warn!("engine: session cache full, dropping {}", remote);

                self.statistics.sightings_dropped += 1;
            }
        }
    }

    fn handle_start(&mut self) -> Result<(), Error> {
        let battery = self.board.battery_level();
        let acked = self.transmit(&Packet::ack(self.tag_id, Some(battery)));

        // a repeated START must not wipe a running recording
        if self.state == RunState::Stopped {
            self.state = RunState::Active;
            self.run_epoch_secs = self.seconds();
            self.reset_data()?;
        }
        acked
    }

    fn handle_stop(&mut self) -> Result<(), Error> {
        let acked = self.transmit(&Packet::ack(self.tag_id, None));
        self.stop();
        acked
    }

    fn handle_reset(&mut self) -> Result<(), Error> {
        let acked = self.transmit(&Packet::ack(self.tag_id, None));

        let now = self.board.now_ms();
        if self
            .last_reset_ms
            .is_none_or(|last| elapsed(now, last) >= RESET_DEBOUNCE_MS)
        {
            self.last_reset_ms = Some(now);
            self.reset_data()?;
        }
        acked
    }

    fn handle_write_setting(&mut self, payload: &[u8]) -> Result<(), Error> {
        let setting = match Setting::parse(payload) {
            Ok(setting) => setting,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("engine: ignoring setting: {}", _e);

                self.statistics.frames_ignored += 1;
                return Ok(());
            }
        };

        self.apply_setting(setting);
        self.transmit(&Packet::ack(self.tag_id, None))
    }

    /// Changes one setting and persists the configuration block. A failed write is counted and
    /// otherwise ignored, the new value stays in effect until the next boot.
    pub fn apply_setting(&mut self, setting: Setting) {
        self.config.apply(setting);
        if let Err(_e) = self.config.persist(&mut self.store) {
            #[cfg(feature = "defmt")]
            warn!("engine: persisting config failed: {}", _e);

            self.statistics.store_failures += 1;
        }
    }

    /// Clears the session cache and invalidates every persisted record.
    pub fn reset_data(&mut self) -> Result<(), Error> {
        self.sessions.clear();
        self.statistics.data_resets += 1;

        let _cleared = store::clear_records(&mut self.store).inspect_err(|_| {
            self.statistics.store_failures += 1;
        })?;

        #[cfg(feature = "defmt")]
        debug!("engine: data reset, {} records cleared", _cleared);

        #[cfg(feature = "debug-logs")]
        println!("engine: data reset, {_cleared} records cleared");

        Ok(())
    }

    /// Streams every persisted record, then every cached session, then an ACK. With `stop_after`
    /// the device stops even if the upload failed half way.
    fn upload_data(&mut self, stop_after: bool) -> Result<(), Error> {
        let uploaded = self
            .stream_records()
            .and_then(|()| self.transmit(&Packet::ack(self.tag_id, None)));

        #[cfg(feature = "defmt")]
        debug!("engine: upload complete, ok: {}", uploaded.is_ok());

        if stop_after {
            self.stop();
        }
        uploaded
    }

    fn stream_records(&mut self) -> Result<(), Error> {
        let epoch = self.run_epoch_secs;
        let Self {
            store,
            radio,
            board,
            sessions,
            ..
        } = self;

        store::for_each_record(store, |_address, record| {
            send_record(radio, board, &record, epoch)
        })?;

        for session in sessions.iter() {
            let now = board.now_ms() / 1000;
            send_record(radio, board, &session.to_record(now), epoch)?;
        }
        Ok(())
    }

    fn upload_settings(&mut self) -> Result<(), Error> {
        let report = SettingsReport {
            battery: self.board.battery_level(),
            config: self.config,
        };
        self.transmit(&Packet::settings_report(&report))
    }

    /// Moves expired sessions from the cache into the store. Returns the number of expired
    /// sessions, including any that were lost because the store is full.
    pub fn tick(&mut self) -> usize {
        let now = self.seconds();
        let timeout = self.config.session_timeout_secs;
        let Self {
            store,
            sessions,
            statistics,
            ..
        } = self;

        let mut expired = 0;
        for session in sessions.evict_expired(now, timeout) {
            expired += 1;
            match store::append_record(store, &session.to_record(now)) {
                Ok(Some(_)) => {}
                Ok(None) => statistics.records_lost += 1,
                Err(_e) => {
                    #[cfg(feature = "defmt")]
                    warn!("engine: persisting session of {} failed: {}", session.tag_id, _e);

                    statistics.store_failures += 1;
                }
            }
        }
        expired
    }

    /// Broadcasts a beacon on the current channel. It is sent twice since the first copy may go
    /// out before the radio has settled after power up.
    pub fn beacon(&mut self) -> Result<(), Error> {
        self.radio
            .set_power_level(self.config.tx_range.power_level());
        self.radio.power_up();

        let ping = Packet::ping(self.tag_id, self.config.tx_range.strong_required());
        self.transmit(&ping)?;
        self.board.delay_ms(BEACON_REPEAT_MS);
        self.transmit(&ping)
    }

    /// Answers a reader's discovery ping so it can pick this device.
    pub fn announce(&mut self) -> Result<(), Error> {
        let ping = Packet::ping(self.tag_id, true);
        for _ in 0..ANNOUNCE_PINGS {
            self.transmit(&ping)?;
            self.board.delay_ms(ANNOUNCE_GAP_MS);
        }
        Ok(())
    }

    pub fn switch_to_ping_channel(&mut self) {
        self.radio.set_channel(self.config.ping_channel);
        self.radio
            .set_power_level(self.config.tx_range.power_level());
        self.radio.power_up();
        self.radio.stop_listening();
        self.board.delay_ms(CHANNEL_SETTLE_MS);
    }

    pub fn switch_to_reader_channel(&mut self) {
        self.radio.set_channel(self.config.reader_channel);
        self.radio.set_power_level(READER_POWER_LEVEL);
        self.radio.start_listening();
        self.board.delay_ms(CHANNEL_SETTLE_MS);
    }

    pub fn switch_to_download_channel(&mut self) {
        self.radio.set_channel(self.config.download_channel);
        self.radio.set_power_level(PowerLevel::Max);
        self.radio.start_listening();
        self.board.delay_ms(CHANNEL_SETTLE_MS);
    }

    fn transmit(&mut self, packet: &Packet) -> Result<(), Error> {
        transmit(&mut self.radio, packet)
    }
}

fn transmit<R: Radio>(radio: &mut R, packet: &Packet) -> Result<(), Error> {
    radio.stop_listening();
    radio
        .send(packet.as_bytes())
        .map_err(|_| Error::RadioError)
}

fn send_record<R: Radio, B: Board>(
    radio: &mut R,
    board: &mut B,
    record: &SessionRecord,
    epoch: u32,
) -> Result<(), Error> {
    let data = DataRecord {
        tag_id: record.tag_id,
        first_seen: record.first_seen.wrapping_sub(epoch),
        last_seen: record.last_seen.wrapping_sub(epoch),
        now: (board.now_ms() / 1000).wrapping_sub(epoch),
    };
    transmit(radio, &Packet::data_record(&data))?;
    board.delay_ms(DATA_PACING_MS);
    Ok(())
}
