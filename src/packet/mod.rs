//! Wire codec for the three sACN packet families.
//!
//! Every packet nests three layers. The outermost Root layer (38 bytes) is
//! common to all families; the Framing layer and the innermost layer (DMP
//! for Data, Universe Discovery for Discovery) are family-specific. All
//! integer fields are big-endian at fixed offsets, and every layer carries a
//! packed length field whose high nibble is the `0x7` flags marker and whose
//! low 12 bits count the octets from the field itself to the end of the
//! packet.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Root: preamble, postamble, "ASC-E1.17", length, vector,   │
//! │       CID (16)                                     0..38  │
//! ├───────────────────────────────────────────────────────────┤
//! │ Framing: length, vector, family-specific fields   38..    │
//! ├───────────────────────────────────────────────────────────┤
//! │ DMP (Data) / UDL (Discovery) / nothing (Sync)             │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod data;
mod discovery;
mod sync;

pub use data::DataPacket;
pub use discovery::DiscoveryPacket;
pub use sync::SyncPacket;

use byteorder::{BigEndian, ByteOrder};

use crate::error::PacketError;

// Vectors from ANSI E1.31—2018 Appendix A.
pub const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
pub const VECTOR_ROOT_E131_EXTENDED: u32 = 0x0000_0008;

pub const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
pub const VECTOR_E131_EXTENDED_SYNCHRONIZATION: u32 = 0x0000_0001;
pub const VECTOR_E131_EXTENDED_DISCOVERY: u32 = 0x0000_0002;

pub const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
pub const VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST: u32 = 0x0000_0001;

/// The ACN packet identifier present at offset 4 of every packet.
pub const ACN_PACKET_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";

/// Fixed preamble size field value.
pub const PREAMBLE_SIZE: u16 = 0x0010;
/// Fixed postamble size field value.
pub const POSTAMBLE_SIZE: u16 = 0x0000;

/// Size of the Root layer in bytes.
pub const ROOT_LAYER_SIZE: usize = 38;

/// sACN packet family discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SacnPacketType {
    /// DMX512-A universe data.
    Data,
    /// Universe synchronization command.
    Sync,
    /// Universe discovery page.
    Discovery,
}

/// Root layer shared by all packet families (E1.31 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootLayer {
    pub preamble_size: u16,
    pub postamble_size: u16,
    pub acn_identifier: [u8; 12],
    pub root_length: u16,
    pub root_vector: u32,
    pub cid: [u8; 16],
}

impl RootLayer {
    /// Root layer template with the given vector and an unset CID.
    pub(crate) fn with_vector(root_vector: u32, root_length: u16) -> Self {
        Self {
            preamble_size: PREAMBLE_SIZE,
            postamble_size: POSTAMBLE_SIZE,
            acn_identifier: ACN_PACKET_IDENTIFIER,
            root_length,
            root_vector,
            cid: [0; 16],
        }
    }

    /// Parse and validate the leading 38 bytes of a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < ROOT_LAYER_SIZE {
            return Err(PacketError::Truncated {
                layer: "root",
                len: buf.len(),
            });
        }

        let mut acn_identifier = [0u8; 12];
        acn_identifier.copy_from_slice(&buf[4..16]);
        let mut cid = [0u8; 16];
        cid.copy_from_slice(&buf[22..38]);

        let root = Self {
            preamble_size: BigEndian::read_u16(&buf[0..2]),
            postamble_size: BigEndian::read_u16(&buf[2..4]),
            acn_identifier,
            root_length: BigEndian::read_u16(&buf[16..18]),
            root_vector: BigEndian::read_u32(&buf[18..22]),
            cid,
        };
        root.validate()?;
        Ok(root)
    }

    /// Write the 38-byte root layer into the front of `buf`.
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], self.preamble_size);
        BigEndian::write_u16(&mut buf[2..4], self.postamble_size);
        buf[4..16].copy_from_slice(&self.acn_identifier);
        BigEndian::write_u16(&mut buf[16..18], self.root_length);
        BigEndian::write_u32(&mut buf[18..22], self.root_vector);
        buf[22..38].copy_from_slice(&self.cid);
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.preamble_size != PREAMBLE_SIZE {
            return Err(PacketError::InvalidPreamble);
        }
        if self.postamble_size != POSTAMBLE_SIZE {
            return Err(PacketError::InvalidPostamble);
        }
        if self.acn_identifier != ACN_PACKET_IDENTIFIER {
            return Err(PacketError::InvalidIdentifier);
        }
        Ok(())
    }
}

/// A decoded sACN packet of any family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SacnPacket {
    Data(DataPacket),
    Sync(SyncPacket),
    Discovery(DiscoveryPacket),
}

impl SacnPacket {
    /// Decode a datagram into the matching packet family.
    ///
    /// Dispatches on the root vector and, for the extended family, on the
    /// framing vector at offset 40. Datagrams with unknown vectors yield
    /// [`PacketError::Unhandled`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let root = RootLayer::decode(buf)?;

        if buf.len() < ROOT_LAYER_SIZE + 6 {
            return Err(PacketError::Truncated {
                layer: "framing",
                len: buf.len(),
            });
        }
        let frame_vector = BigEndian::read_u32(&buf[40..44]);

        match root.root_vector {
            VECTOR_ROOT_E131_DATA => Ok(Self::Data(DataPacket::decode(root, buf)?)),
            VECTOR_ROOT_E131_EXTENDED => match frame_vector {
                VECTOR_E131_EXTENDED_SYNCHRONIZATION => {
                    Ok(Self::Sync(SyncPacket::decode(root, buf)?))
                }
                VECTOR_E131_EXTENDED_DISCOVERY => {
                    Ok(Self::Discovery(DiscoveryPacket::decode(root, buf)?))
                }
                _ => Err(PacketError::Unhandled),
            },
            _ => Err(PacketError::Unhandled),
        }
    }

    /// Serialize the packet into a contiguous byte sequence.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(p) => p.encode(),
            Self::Sync(p) => p.encode(),
            Self::Discovery(p) => p.encode(),
        }
    }

    /// The packet family discriminant.
    pub fn packet_type(&self) -> SacnPacketType {
        match self {
            Self::Data(_) => SacnPacketType::Data,
            Self::Sync(_) => SacnPacketType::Sync,
            Self::Discovery(_) => SacnPacketType::Discovery,
        }
    }

    /// The source CID from the root layer.
    pub fn cid(&self) -> &[u8; 16] {
        match self {
            Self::Data(p) => &p.root.cid,
            Self::Sync(p) => &p.root.cid,
            Self::Discovery(p) => &p.root.cid,
        }
    }
}

impl From<DataPacket> for SacnPacket {
    fn from(p: DataPacket) -> Self {
        Self::Data(p)
    }
}

impl From<SyncPacket> for SacnPacket {
    fn from(p: SyncPacket) -> Self {
        Self::Sync(p)
    }
}

impl From<DiscoveryPacket> for SacnPacket {
    fn from(p: DiscoveryPacket) -> Self {
        Self::Discovery(p)
    }
}

/// Read a NUL-padded fixed-size name field as UTF-8, trimming padding.
pub(crate) fn name_from_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Copy `name` into a 64-byte NUL-padded field, rejecting oversized input.
pub(crate) fn name_to_field(name: &str) -> Result<[u8; 64], PacketError> {
    let bytes = name.as_bytes();
    if bytes.len() > 64 {
        return Err(PacketError::SourceNameTooLong);
    }
    let mut field = [0u8; 64];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}
