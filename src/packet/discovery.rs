//! The Universe Discovery packet (E1.31 §6.4, §8).

use byteorder::{BigEndian, ByteOrder};

use super::{
    name_from_field, name_to_field, PacketError, RootLayer, VECTOR_E131_EXTENDED_DISCOVERY,
    VECTOR_ROOT_E131_EXTENDED, VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST,
};

/// Maximum universes per page.
pub const UNIVERSES_PER_PAGE: usize = 512;

/// Offset of the universe list in the datagram.
const LIST_OFFSET: usize = 120;

/// Advertises the universes a source is actively transmitting, as one page
/// of up to 512 ascending universe numbers. Sources paginate when they
/// carry more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub root: RootLayer,

    // Framing layer
    pub frame_length: u16,
    pub frame_vector: u32,
    pub source_name: [u8; 64],
    reserved: [u8; 4],

    // Universe Discovery layer
    pub udl_length: u16,
    pub udl_vector: u32,
    /// 0-based index of this page.
    pub page: u8,
    /// 0-based index of the final page the source sends.
    pub last: u8,
    pub universes: [u16; UNIVERSES_PER_PAGE],
}

impl DiscoveryPacket {
    /// A packet with protocol-correct statics and an empty universe list.
    pub fn new() -> Self {
        Self {
            root: RootLayer::with_vector(VECTOR_ROOT_E131_EXTENDED, 0x7068),

            frame_length: 0x7052,
            frame_vector: VECTOR_E131_EXTENDED_DISCOVERY,
            source_name: [0; 64],
            reserved: [0; 4],

            udl_length: 0x7008,
            udl_vector: VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST,
            page: 0,
            last: 0,
            universes: [0; UNIVERSES_PER_PAGE],
        }
    }

    /// Number of universes on this page, derived from the UDL length field.
    pub fn num_universes(&self) -> usize {
        (((self.udl_length & 0x0FFF).saturating_sub(8)) / 2) as usize
    }

    /// The populated prefix of the universe list.
    pub fn universes(&self) -> &[u16] {
        &self.universes[..self.num_universes().min(UNIVERSES_PER_PAGE)]
    }

    /// Append one universe to the page. Fails once the page holds 512
    /// entries; the caller then allocates the next page.
    pub fn add_universe(&mut self, universe: u16) -> Result<(), PacketError> {
        let num = self.num_universes();
        if num >= UNIVERSES_PER_PAGE {
            return Err(PacketError::UniverseListFull);
        }
        self.universes[num] = universe;
        self.set_num_universes((num + 1) as u16);
        Ok(())
    }

    /// Replace the page's universe list. At most 512 entries.
    pub fn set_universes(&mut self, universes: &[u16]) -> Result<(), PacketError> {
        if universes.len() > UNIVERSES_PER_PAGE {
            return Err(PacketError::UniverseListFull);
        }
        self.universes[..universes.len()].copy_from_slice(universes);
        self.set_num_universes(universes.len() as u16);
        Ok(())
    }

    fn set_num_universes(&mut self, num: u16) {
        self.udl_length = 0x7000 | (num * 2 + 8);
        self.frame_length = self.udl_length + 74;
        self.root.root_length = self.frame_length + 38;
    }

    /// The user-assigned source name, NUL padding trimmed.
    pub fn source_name(&self) -> String {
        name_from_field(&self.source_name)
    }

    /// Set the source name. Must not exceed 64 bytes.
    pub fn set_source_name(&mut self, name: &str) -> Result<(), PacketError> {
        self.source_name = name_to_field(name)?;
        Ok(())
    }

    pub(crate) fn decode(root: RootLayer, buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < LIST_OFFSET {
            return Err(PacketError::Truncated {
                layer: "universe discovery",
                len: buf.len(),
            });
        }

        let frame_length = BigEndian::read_u16(&buf[38..40]);
        if (frame_length & 0x0FFF) as usize > buf.len() {
            return Err(PacketError::LengthMismatch {
                declared: frame_length & 0x0FFF,
                actual: buf.len(),
            });
        }

        let mut source_name = [0u8; 64];
        source_name.copy_from_slice(&buf[44..108]);

        let mut universes = [0u16; UNIVERSES_PER_PAGE];
        let count = ((buf.len() - LIST_OFFSET) / 2).min(UNIVERSES_PER_PAGE);
        for (i, slot) in universes.iter_mut().take(count).enumerate() {
            let at = LIST_OFFSET + i * 2;
            *slot = BigEndian::read_u16(&buf[at..at + 2]);
        }

        let packet = Self {
            root,
            frame_length,
            frame_vector: BigEndian::read_u32(&buf[40..44]),
            source_name,
            reserved: [0; 4],
            udl_length: BigEndian::read_u16(&buf[112..114]),
            udl_vector: BigEndian::read_u32(&buf[114..118]),
            page: buf[118],
            last: buf[119],
            universes,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Serialize, truncating the unused tail of the universe list.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LIST_OFFSET + 2 * UNIVERSES_PER_PAGE];
        self.root.encode(&mut buf);

        BigEndian::write_u16(&mut buf[38..40], self.frame_length);
        BigEndian::write_u32(&mut buf[40..44], self.frame_vector);
        buf[44..108].copy_from_slice(&self.source_name);
        // Bytes 108..112 stay zero (reserved).

        BigEndian::write_u16(&mut buf[112..114], self.udl_length);
        BigEndian::write_u32(&mut buf[114..118], self.udl_vector);
        buf[118] = self.page;
        buf[119] = self.last;
        for (i, universe) in self.universes.iter().enumerate() {
            let at = LIST_OFFSET + i * 2;
            BigEndian::write_u16(&mut buf[at..at + 2], *universe);
        }

        buf.truncate(LIST_OFFSET + 2 * self.num_universes());
        buf
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.root.root_vector != VECTOR_ROOT_E131_EXTENDED {
            return Err(PacketError::InvalidRootVector);
        }
        if self.frame_vector != VECTOR_E131_EXTENDED_DISCOVERY {
            return Err(PacketError::InvalidFrameVector);
        }
        if self.udl_vector != VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST {
            return Err(PacketError::InvalidDiscoveryVector);
        }
        if self.page > self.last {
            return Err(PacketError::PageOutOfRange);
        }
        Ok(())
    }
}

impl Default for DiscoveryPacket {
    fn default() -> Self {
        Self::new()
    }
}
