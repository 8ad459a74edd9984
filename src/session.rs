//! Sessions that are still active, kept in RAM until they time out.
//!
//! Times are stored as the low 16 bits of seconds since boot to keep the table small. A single
//! session can therefore span at most ~18.2 hours before its times become ambiguous.

use crate::layout::SessionRecord;
#[cfg(feature = "defmt")]
use defmt::trace;

pub const CACHE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Session {
    pub tag_id: u16,
    pub first_seen: u16,
    pub last_seen: u16,
}

impl Session {
    fn new(tag_id: u16, now_secs: u32) -> Self {
        let now = now_secs as u16;
        Self {
            tag_id,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self, now_secs: u32) {
        self.last_seen = now_secs as u16;
    }

    /// Seconds since the last sighting.
    pub fn idle_secs(&self, now_secs: u32) -> u16 {
        (now_secs as u16).wrapping_sub(self.last_seen)
    }

    /// Converts to a persisted record, widening the 16-bit times against the current time.
    pub fn to_record(&self, now_secs: u32) -> SessionRecord {
        SessionRecord {
            tag_id: self.tag_id,
            first_seen: widen(self.first_seen, now_secs),
            last_seen: widen(self.last_seen, now_secs),
        }
    }
}

/// Reconstructs the full seconds value of a narrow timestamp that lies at most `u16::MAX` seconds
/// in the past.
fn widen(narrow: u16, now_secs: u32) -> u32 {
    let age = (now_secs as u16).wrapping_sub(narrow);
    now_secs.wrapping_sub(age as u32)
}

pub struct SessionCache {
    slots: [Option<Session>; CACHE_CAPACITY],
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub const fn new() -> Self {
        Self {
            slots: [None; CACHE_CAPACITY],
        }
    }

    /// Returns the session of `tag_id`, creating it in the first free slot if necessary. `None`
    /// means the cache is saturated and the sighting is dropped.
    pub fn lookup_or_create(&mut self, tag_id: u16, now_secs: u32) -> Option<&mut Session> {
        let index = match self.position(tag_id) {
            Some(index) => index,
            None => {
                let index = self.slots.iter().position(Option::is_none)?;

                #[cfg(feature = "defmt")]
                trace!("sessions: new {} in slot {}", tag_id, index);

                self.slots[index] = Some(Session::new(tag_id, now_secs));
                index
            }
        };
        self.slots[index].as_mut()
    }

    pub fn get(&self, tag_id: u16) -> Option<&Session> {
        self.iter().find(|session| session.tag_id == tag_id)
    }

    fn position(&self, tag_id: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_some_and(|session| session.tag_id == tag_id))
    }

    /// Removes every session idle for longer than `timeout_secs` and yields it. Slots are freed as
    /// the iterator advances; dropping it early leaves the remaining sessions in place.
    pub fn evict_expired(
        &mut self,
        now_secs: u32,
        timeout_secs: u16,
    ) -> impl Iterator<Item = Session> + '_ {
        self.slots.iter_mut().filter_map(move |slot| {
            if slot.is_some_and(|session| session.idle_secs(now_secs) > timeout_secs) {
                slot.take()
            } else {
                None
            }
        })
    }

    /// Active sessions in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == CACHE_CAPACITY
    }

    pub fn clear(&mut self) {
        self.slots = [None; CACHE_CAPACITY];
    }
}
