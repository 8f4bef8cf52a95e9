//! # sACN
//!
//! Streaming ACN (ANSI E1.31—2018) over IPv4 UDP: a wire codec for the
//! Data, Synchronization and Universe Discovery packet families, a
//! multicast-capable [`Receiver`] and a multi-universe [`Sender`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     Application                            │
//! ├───────────────────────────┬────────────────────────────────┤
//! │         Sender            │           Receiver             │
//! │  one send task/universe   │   one receive loop, callbacks  │
//! │  discovery task (10 s)    │   NDL detection (2500 ms)      │
//! ├───────────────────────────┴────────────────────────────────┤
//! │            Packet codec (Root / Framing / DMP / UDL)       │
//! ├────────────────────────────────────────────────────────────┤
//! │                UDP port 5568, 239.255.0.0/16               │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Universe data is carried one universe per stream. A source joins the
//! network by simply transmitting; receivers subscribe by joining the
//! universe's multicast group (section 9.3 of the standard maps universe
//! numbers onto `239.255.0.0/16`).

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Length fields are 12-bit by protocol
#![allow(clippy::cast_possible_wrap)] // Intentional for sequence arithmetic
#![allow(clippy::doc_markdown)]
#![allow(clippy::unreadable_literal)]

pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
mod socket;
pub mod types;
pub mod util;

pub use error::{Error, Result};
pub use packet::{DataPacket, DiscoveryPacket, SacnPacket, SacnPacketType, SyncPacket};
pub use receiver::{PacketInfo, PacketMode, Receiver};
pub use sender::{Sender, SenderOptions};
pub use types::ComponentId;
pub use util::{sequence_fresh, universe_to_multicast};

use std::time::Duration;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The well-known sACN port (ACN SDT multicast port).
pub const SACN_PORT: u16 = 5568;

/// Reserved universe number for Universe Discovery packets.
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// Interval between Universe Discovery transmissions (E1.31 §4.3).
pub const UNIVERSE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Time without packets after which a universe enters Network Data Loss
/// (E1.31 §6.7.1).
pub const NETWORK_DATA_LOSS_TIMEOUT: Duration = Duration::from_millis(2500);

/// Largest possible sACN datagram (a Universe Discovery packet with a full
/// 512-entry universe list).
pub const MAX_PACKET_SIZE: usize = 1144;
