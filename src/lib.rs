#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod platform;
pub mod protocol;
pub mod reader;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod wait;

pub use config::{Configuration, TxRange};
pub use engine::{Engine, EngineStatistics, Role, RunState};
pub use error::Error;
pub use layout::SessionRecord;
pub use platform::{Board, Clock, EepromBus, PowerLevel, Radio};
pub use protocol::{DataRecord, Frame, Opcode, Packet, Setting, SettingId, SettingsReport};
pub use reader::Reader;
pub use scheduler::{Scheduler, Timing};
pub use session::{Session, SessionCache};
pub use store::Eeprom;
