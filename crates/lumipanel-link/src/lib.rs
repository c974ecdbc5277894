//! Lumipanel Display Link Library
//!
//! Drives the serial-attached display controller of a lumipanel
//! touch panel: frame reconstruction from the interrupt-fed byte
//! stream, event dispatch, gated command writes, synchronous value
//! queries and the multi-stage firmware/GUI transfer protocol.

pub mod command;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
pub mod transport;
pub mod update;

pub use error::{Error, Result};
pub use event::{LinkEvent, LinkEventKind};
pub use frame::{Frame, FrameReader, SerialEvent};
pub use link::{DisplayLink, LinkState};
pub use transport::{LinkTransport, SerialTransport};
pub use update::{
    PayloadSource, ProtocolVariant, UpdateEngine, UpdateSession, UpdateStatus, UpdateTiming,
};

/// Terminator sequence ending every command and every framed response.
pub const FRAME_TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Link speed at bring-up. The display returns to this rate on reboot.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Largest payload chunk written per ready signal during a transfer.
pub const MAX_UPDATE_CHUNK: u32 = 4096;
