//! The Synchronization packet (E1.31 §6.3, §11).

use byteorder::{BigEndian, ByteOrder};

use super::{
    PacketError, RootLayer, VECTOR_E131_EXTENDED_SYNCHRONIZATION, VECTOR_ROOT_E131_EXTENDED,
};

/// Wire size, always fixed.
const ENCODED_SIZE: usize = 49;

/// Commands receivers to act on previously buffered data for every universe
/// bound to this packet's synchronization address.
///
/// The sync address shall equal the universe the packet is transmitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    pub root: RootLayer,

    // Framing layer
    pub frame_length: u16,
    pub frame_vector: u32,
    pub sequence: u8,
    pub sync_address: u16,
    reserved: [u8; 2],
}

impl SyncPacket {
    /// A packet with protocol-correct statics and an unset sync address.
    pub fn new() -> Self {
        Self {
            root: RootLayer::with_vector(VECTOR_ROOT_E131_EXTENDED, 0x7021),

            frame_length: 0x700B,
            frame_vector: VECTOR_E131_EXTENDED_SYNCHRONIZATION,
            sequence: 0,
            sync_address: 0,
            reserved: [0; 2],
        }
    }

    pub(crate) fn decode(root: RootLayer, buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 47 {
            return Err(PacketError::Truncated {
                layer: "sync framing",
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

        let packet = Self {
            root,
            frame_length,
            frame_vector: BigEndian::read_u32(&buf[40..44]),
            sequence: buf[44],
            sync_address: BigEndian::read_u16(&buf[45..47]),
            reserved: [0; 2],
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Serialize into the fixed 49-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENCODED_SIZE];
        self.root.encode(&mut buf);

        BigEndian::write_u16(&mut buf[38..40], self.frame_length);
        BigEndian::write_u32(&mut buf[40..44], self.frame_vector);
        buf[44] = self.sequence;
        BigEndian::write_u16(&mut buf[45..47], self.sync_address);
        // Bytes 47..49 stay zero (reserved).
        buf
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.root.root_vector != VECTOR_ROOT_E131_EXTENDED {
            return Err(PacketError::InvalidRootVector);
        }
        if self.frame_vector != VECTOR_E131_EXTENDED_SYNCHRONIZATION {
            return Err(PacketError::InvalidFrameVector);
        }
        Ok(())
    }
}

impl Default for SyncPacket {
    fn default() -> Self {
        Self::new()
    }
}
