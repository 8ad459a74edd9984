use thiserror::Error;

/// Errors that can occur while running the device engine or the reader client. Most of them are
/// reported for logging only: the radio link is lossy by design and the engine keeps running after
/// any of them.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The internal error value is returned from the provided storage implementation
    #[error("internal storage error")]
    StoreError,

    /// The write enable latch did not get set before programming a byte
    #[error("write enable failed")]
    WriteNotEnabled,

    /// The write enable latch did not clear after programming, either because the write did not
    /// complete within the poll window or because the device rejected it
    #[error("write not verified")]
    WriteNotVerified,

    /// Access beyond the capacity of the persistent store
    #[error("address out of range")]
    AddressOutOfRange,

    /// The check bytes guarding the device identity are missing
    #[error("device not provisioned")]
    Unprovisioned,

    /// The internal error value is returned from the provided radio implementation
    #[error("internal radio error")]
    RadioError,

    /// Frame is shorter than the minimum length for its opcode
    #[error("frame too short")]
    FrameTooShort,

    /// The opcode byte is not part of the protocol
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// The setting id of a WRITE_SETTING frame is not part of the protocol
    #[error("unknown setting: {0}")]
    UnknownSetting(u8),

    /// A bounded wait ran out of time
    #[error("timeout")]
    Timeout,

    /// No acknowledgment or data arrived from the addressed device in time
    #[error("target unreachable")]
    Unreachable,

    /// No device answered the discovery pings
    #[error("no device found")]
    NoDeviceFound,

    /// The remote answered with a frame that does not fit the request
    #[error("unexpected response: {0:#04x}")]
    UnexpectedResponse(u8),
}
