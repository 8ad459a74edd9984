//! The control loop. Beaconing, listening for peers and listening for readers share the single
//! radio, each on its own channel and period. Between activities the radio is powered down and
//! the board sleeps until the next one is due.

use crate::engine::{Engine, Role};
use crate::error::Error;
use crate::platform::{Board, Radio};
use crate::protocol::Opcode;
use crate::wait::{Deadline, elapsed};
#[cfg(feature = "defmt")]
use defmt::{debug, info, warn};
use embedded_storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    /// Subtracted from sleeps and beacon periods to account for wake up time.
    pub wake_margin_ms: u32,
    /// Added to the ping period to size a peer listen window.
    pub listen_extra_ms: u32,
    /// How long to listen for a reader on the reader channel.
    pub reader_window_ms: u32,
    /// How long to wait for a command on the download channel after answering a reader.
    pub download_window_ms: u32,
    /// Wearables stop on their own after running this long.
    pub auto_stop_secs: u32,
    /// A stopped device suspends after this long, if the board can be woken externally.
    pub shutdown_after_ms: Option<u32>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            wake_margin_ms: 10,
            listen_extra_ms: 10,
            reader_window_ms: 20,
            download_window_ms: 100,
            auto_stop_secs: 12 * 60 * 60,
            shutdown_after_ms: Some(30 * 60 * 1000),
        }
    }
}

pub struct Scheduler {
    timing: Timing,
    last_ping: Option<u32>,
    last_listen: Option<u32>,
    last_reader: Option<u32>,
    stopped_since: Option<u32>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Timing::default())
    }
}

impl Scheduler {
    /// All activities are due on the first iteration.
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            last_ping: None,
            last_listen: None,
            last_reader: None,
            stopped_since: None,
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn run<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) -> ! {
        loop {
            self.run_once(engine);
        }
    }

    /// One iteration of the control loop, ending with the sleep until the next activity.
    pub fn run_once<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) {
        self.check_auto_stop(engine);

        if self.beacon_if_due(engine) {
            engine.radio_mut().power_down();
        }

        if engine.role() == Role::Tag {
            engine.radio_mut().power_up();
            self.listen_for_pings(engine);
        }

        if engine.is_active() {
            let _expired = engine.tick();

            #[cfg(feature = "defmt")]
            if _expired > 0 {
                debug!("scheduler: {} sessions expired", _expired);
            }
        }

        self.listen_for_readers(engine);

        self.idle(engine);
        self.suspend_if_stopped(engine);
    }

    fn check_auto_stop<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) {
        if engine.is_active()
            && engine.role() == Role::Tag
            && engine.run_secs() > self.timing.auto_stop_secs
        {
            #[cfg(feature = "defmt")]
            info!("scheduler: auto stop after {}s", engine.run_secs());

            engine.stop();
        }
    }

    /// Sends a beacon when the ping period has passed. Returns whether one was sent.
    pub fn beacon_if_due<S: Storage, R: Radio, B: Board>(
        &mut self,
        engine: &mut Engine<S, R, B>,
    ) -> bool {
        if !engine.is_active() {
            return false;
        }

        let now = engine.now_ms();
        let period = engine
            .config()
            .ping_period_ms()
            .saturating_sub(self.timing.wake_margin_ms);
        if !is_due(self.last_ping, period, now) {
            return false;
        }

        self.last_ping = Some(now);
        report(engine.beacon());
        true
    }

    /// Opens a receive window on the ping channel, long enough to hear every peer beacon once.
    /// Beaconing continues during the window so peers see this device too.
    fn listen_for_pings<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) {
        if !engine.is_active() {
            return;
        }

        let now = engine.now_ms();
        if !is_due(self.last_listen, engine.config().listen_period_ms(), now) {
            return;
        }
        self.last_listen = Some(now);

        let window = engine.config().ping_period_ms() + self.timing.listen_extra_ms;
        engine.radio_mut().start_listening();
        let deadline = Deadline::after(engine.board(), window);
        while !deadline.expired(engine.board()) {
            if let Some(packet) = engine.receive() {
                report(engine.process(packet.as_bytes()));
                engine.radio_mut().start_listening();
            }

            if self.beacon_if_due(engine) {
                engine.radio_mut().start_listening();
            }
        }

        engine.radio_mut().stop_listening();
        engine.radio_mut().flush_rx();
    }

    /// Briefly listens on the reader channel. A reader announces itself with a PING; the device
    /// answers with a few pings of its own and then waits for an addressed command on the
    /// download channel.
    fn listen_for_readers<S: Storage, R: Radio, B: Board>(
        &mut self,
        engine: &mut Engine<S, R, B>,
    ) {
        let now = engine.now_ms();
        if !is_due(self.last_reader, engine.config().reader_period_ms(), now) {
            return;
        }
        self.last_reader = Some(now);

        engine.switch_to_reader_channel();
        let deadline = Deadline::after(engine.board(), self.timing.reader_window_ms);
        while !deadline.expired(engine.board()) {
            engine.radio_mut().power_up();
            let Some(packet) = engine.receive() else {
                continue;
            };
            if packet.as_bytes().first() != Some(&(Opcode::Ping as u8)) {
                continue;
            }

            #[cfg(feature = "defmt")]
            debug!("scheduler: reader nearby");

            // readers ping repeatedly
            while engine.receive().is_some() {}

            report(engine.announce());
            engine.radio_mut().flush_rx();
            engine.switch_to_download_channel();
            self.accept_commands(engine);
        }

        engine.switch_to_ping_channel();
    }

    fn accept_commands<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) {
        let deadline = Deadline::after(engine.board(), self.timing.download_window_ms);
        while !deadline.expired(engine.board()) {
            if let Some(packet) = engine.receive() {
                report(engine.process(packet.as_bytes()));
                engine.radio_mut().start_listening();
            }
        }
    }

    /// Milliseconds until the next activity of the running set is due, capped so that a single
    /// missed wake up costs at most one beacon.
    pub fn idle_budget<S: Storage, R: Radio, B: Board>(&self, engine: &Engine<S, R, B>) -> u32 {
        let now = engine.now_ms();
        let config = engine.config();
        let until = |last: Option<u32>, period: u32| {
            last.map_or(0, |last| period.saturating_sub(elapsed(now, last)))
        };

        let next_reader = until(self.last_reader, config.reader_period_ms());
        let next = match (engine.is_active(), engine.role()) {
            (false, _) => next_reader,
            (true, Role::Locator) => until(self.last_ping, config.ping_period_ms()).min(next_reader),
            (true, Role::Tag) => until(self.last_ping, config.ping_period_ms())
                .min(until(self.last_listen, config.listen_period_ms()))
                .min(next_reader),
        };

        next.min(
            config
                .ping_period_ms()
                .saturating_sub(self.timing.wake_margin_ms),
        )
    }

    fn idle<S: Storage, R: Radio, B: Board>(&mut self, engine: &mut Engine<S, R, B>) {
        let budget = self.idle_budget(engine);
        let sleep = if budget > self.timing.wake_margin_ms {
            budget - self.timing.wake_margin_ms
        } else {
            budget
        };

        engine.radio_mut().power_down();
        engine.board_mut().sleep_ms(sleep);
    }

    fn suspend_if_stopped<S: Storage, R: Radio, B: Board>(
        &mut self,
        engine: &mut Engine<S, R, B>,
    ) {
        if engine.is_active() {
            self.stopped_since = None;
            return;
        }
        let Some(limit) = self.timing.shutdown_after_ms else {
            return;
        };

        let now = engine.now_ms();
        let since = *self.stopped_since.get_or_insert(now);
        if elapsed(now, since) <= limit {
            return;
        }

        #[cfg(feature = "defmt")]
        info!("scheduler: stopped for {}ms, suspending", elapsed(now, since));

        engine.radio_mut().stop_listening();
        engine.radio_mut().power_down();
        let _woken = engine.board_mut().suspend_until_wake();

        #[cfg(feature = "defmt")]
        if _woken {
            info!("scheduler: woken up");
        }

        self.stopped_since = None;
    }
}

fn is_due(last: Option<u32>, period_ms: u32, now: u32) -> bool {
    last.is_none_or(|last| elapsed(now, last) >= period_ms)
}

fn report(result: Result<(), Error>) {
    if let Err(_e) = result {
        #[cfg(feature = "defmt")]
        warn!("scheduler: {}", _e);

        #[cfg(feature = "debug-logs")]
        println!("scheduler: {_e}");
    }
}
