//! The Data packet: one universe's DMX512-A slots (E1.31 §6.2, §7).

use byteorder::{BigEndian, ByteOrder};

use super::{
    name_from_field, name_to_field, RootLayer, PacketError, VECTOR_DMP_SET_PROPERTY,
    VECTOR_E131_DATA_PACKET, VECTOR_ROOT_E131_DATA,
};

/// Full wire size with all 512 slots populated.
const MAX_ENCODED_SIZE: usize = 638;

/// Offset of the DMP property values (start code byte) in the datagram.
const DATA_OFFSET: usize = 125;

const OPTION_PREVIEW_DATA: u8 = 1 << 7;
const OPTION_STREAM_TERMINATED: u8 = 1 << 6;
const OPTION_FORCE_SYNCHRONIZATION: u8 = 1 << 5;

/// Carries up to 512 DMX512-A slots for one universe. The most common
/// packet on an sACN network.
///
/// Field layout follows Appendix B of ANSI E1.31—2018: the Framing layer
/// holds source identity, priority, sequencing and options; the DMP layer
/// holds the property-value block whose first byte is the DMX Start Code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub root: RootLayer,

    // Framing layer
    pub frame_length: u16,
    pub frame_vector: u32,
    pub source_name: [u8; 64],
    pub priority: u8,
    pub sync_address: u16,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,

    // DMP layer
    pub dmp_length: u16,
    pub dmp_vector: u8,
    pub format: u8,
    pub property_address: u16,
    pub address_increment: u16,
    pub length: u16,
    pub data: [u8; 513],
}

impl DataPacket {
    /// A packet with protocol-correct statics and no DMX data. Use the
    /// setters to fill it before sending.
    pub fn new() -> Self {
        Self {
            root: RootLayer::with_vector(VECTOR_ROOT_E131_DATA, 0x707D),

            frame_length: 0x7057,
            frame_vector: VECTOR_E131_DATA_PACKET,
            source_name: [0; 64],
            priority: 100,
            sync_address: 0,
            sequence: 0,
            options: 0,
            universe: 0,

            dmp_length: 0x700A,
            dmp_vector: VECTOR_DMP_SET_PROPERTY,
            format: 0xA1,
            property_address: 0x0000,
            address_increment: 0x0001,
            length: 0,
            data: [0; 513],
        }
    }

    /// The DMX512-A slots (up to 512 bytes, Start Code excluded).
    pub fn get_data(&self) -> &[u8] {
        let len = (self.length as usize).saturating_sub(1).min(512);
        &self.data[1..=len]
    }

    /// Overwrite the DMX512-A slots (Start Code excluded). Input longer
    /// than 512 bytes is truncated; all length fields are recomputed.
    pub fn set_data(&mut self, data: &[u8]) {
        let len = data.len().min(512);
        self.data[1..=len].copy_from_slice(&data[..len]);
        self.compute_length(len as u16);
    }

    fn compute_length(&mut self, data_length: u16) {
        let length = 125 + data_length + 1; // +1 for the start code slot

        self.length = data_length + 1;
        self.root.root_length = 0x7000 | (length - 16);
        self.frame_length = 0x7000 | (length - 38);
        self.dmp_length = 0x7000 | (length - 115);
    }

    /// The DMX Start Code (byte 0 of the property values). 0x00 for
    /// standard dimmer data.
    pub fn start_code(&self) -> u8 {
        self.data[0]
    }

    /// Set the DMX Start Code.
    pub fn set_start_code(&mut self, code: u8) {
        self.data[0] = code;
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

    /// Preview_Data option (bit 7): data intended for visualisation only,
    /// not to be acted upon by live fixtures.
    pub fn is_preview_data(&self) -> bool {
        self.options & OPTION_PREVIEW_DATA != 0
    }

    /// Set the Preview_Data option (bit 7).
    pub fn set_preview_data(&mut self, value: bool) {
        if value {
            self.options |= OPTION_PREVIEW_DATA;
        }
    }

    /// Stream_Terminated option (bit 6): the source is ceasing
    /// transmission of this universe.
    pub fn is_stream_terminated(&self) -> bool {
        self.options & OPTION_STREAM_TERMINATED != 0
    }

    /// Set the Stream_Terminated option (bit 6).
    pub fn set_stream_terminated(&mut self, value: bool) {
        if value {
            self.options |= OPTION_STREAM_TERMINATED;
        }
    }

    /// Force_Synchronization option (bit 5): hold output on data loss of
    /// the synchronization universe.
    pub fn is_force_synchronization(&self) -> bool {
        self.options & OPTION_FORCE_SYNCHRONIZATION != 0
    }

    /// Set the Force_Synchronization option (bit 5).
    pub fn set_force_synchronization(&mut self, value: bool) {
        if value {
            self.options |= OPTION_FORCE_SYNCHRONIZATION;
        }
    }

    pub(crate) fn decode(root: RootLayer, buf: &[u8]) -> Result<Self, PacketError> {
        // A packet with an empty property-value block is 125 bytes; the
        // termination sequence is sent without slots.
        if buf.len() < DATA_OFFSET {
            return Err(PacketError::Truncated {
                layer: "DMP",
                len: buf.len(),
            });
        }

        let frame_length = BigEndian::read_u16(&buf[38..40]);
        if (frame_length & 0x0FFF) as usize > buf.len() - 38 {
            return Err(PacketError::LengthMismatch {
                declared: frame_length & 0x0FFF,
                actual: buf.len() - 38,
            });
        }

        let mut source_name = [0u8; 64];
        source_name.copy_from_slice(&buf[44..108]);

        let dmp_length = BigEndian::read_u16(&buf[115..117]);
        if (dmp_length & 0x0FFF) as usize > buf.len() - 115 {
            return Err(PacketError::LengthMismatch {
                declared: dmp_length & 0x0FFF,
                actual: buf.len() - 115,
            });
        }

        let length = BigEndian::read_u16(&buf[123..125]);
        if (length & 0x0FFF) as usize > buf.len() - DATA_OFFSET {
            return Err(PacketError::LengthMismatch {
                declared: length & 0x0FFF,
                actual: buf.len() - DATA_OFFSET,
            });
        }

        let mut data = [0u8; 513];
        let n = (buf.len() - DATA_OFFSET).min(513);
        data[..n].copy_from_slice(&buf[DATA_OFFSET..DATA_OFFSET + n]);

        let packet = Self {
            root,
            frame_length,
            frame_vector: BigEndian::read_u32(&buf[40..44]),
            source_name,
            priority: buf[108],
            sync_address: BigEndian::read_u16(&buf[109..111]),
            sequence: buf[111],
            options: buf[112],
            universe: BigEndian::read_u16(&buf[113..115]),
            dmp_length,
            dmp_vector: buf[117],
            format: buf[118],
            property_address: BigEndian::read_u16(&buf[119..121]),
            address_increment: BigEndian::read_u16(&buf[121..123]),
            length,
            data,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Serialize, truncating the unused tail of the slot array.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_ENCODED_SIZE];
        self.root.encode(&mut buf);

        BigEndian::write_u16(&mut buf[38..40], self.frame_length);
        BigEndian::write_u32(&mut buf[40..44], self.frame_vector);
        buf[44..108].copy_from_slice(&self.source_name);
        buf[108] = self.priority;
        BigEndian::write_u16(&mut buf[109..111], self.sync_address);
        buf[111] = self.sequence;
        buf[112] = self.options;
        BigEndian::write_u16(&mut buf[113..115], self.universe);

        BigEndian::write_u16(&mut buf[115..117], self.dmp_length);
        buf[117] = self.dmp_vector;
        buf[118] = self.format;
        BigEndian::write_u16(&mut buf[119..121], self.property_address);
        BigEndian::write_u16(&mut buf[121..123], self.address_increment);
        BigEndian::write_u16(&mut buf[123..125], self.length);
        buf[DATA_OFFSET..].copy_from_slice(&self.data);

        buf.truncate(DATA_OFFSET + self.length as usize);
        buf
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.root.root_vector != VECTOR_ROOT_E131_DATA {
            return Err(PacketError::InvalidRootVector);
        }
        if self.frame_vector != VECTOR_E131_DATA_PACKET {
            return Err(PacketError::InvalidFrameVector);
        }
        if self.dmp_vector != VECTOR_DMP_SET_PROPERTY {
            return Err(PacketError::InvalidDmpVector);
        }
        // Statics from Section 7.
        if self.format != 0xA1 || self.property_address != 0 || self.address_increment != 1 {
            return Err(PacketError::InvalidDmpFormat);
        }
        Ok(())
    }
}

impl Default for DataPacket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ACN_PACKET_IDENTIFIER, SacnPacket};

    #[test]
    fn length_fields_recompute_on_set_data() {
        let mut p = DataPacket::new();
        p.set_data(&[0xFF; 512]);

        // Full packet: 638 octets total.
        assert_eq!(p.length, 513);
        assert_eq!(p.root.root_length, 0x7000 | 622);
        assert_eq!(p.frame_length, 0x7000 | 600);
        assert_eq!(p.dmp_length, 0x7000 | 523);
        assert_eq!(p.encode().len(), 638);

        p.set_data(&[1, 2, 3, 4]);
        assert_eq!(p.length, 5);
        assert_eq!(p.encode().len(), 130);
    }

    #[test]
    fn set_data_truncates_to_512() {
        let oversized: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let mut p = DataPacket::new();
        p.set_data(&oversized);

        assert_eq!(p.get_data(), &oversized[..512]);
        assert_eq!(p.length, 513);
    }

    #[test]
    fn start_code_occupies_slot_zero() {
        let mut p = DataPacket::new();
        p.set_data(&[10, 20, 30]);
        p.set_start_code(0xCC);

        assert_eq!(p.start_code(), 0xCC);
        assert_eq!(p.get_data(), &[10, 20, 30]);

        let encoded = p.encode();
        assert_eq!(encoded[125], 0xCC);
        assert_eq!(&encoded[126..129], &[10, 20, 30]);
    }

    #[test]
    fn option_bits_are_independent() {
        let mut p = DataPacket::new();
        p.set_preview_data(true);
        assert!(p.is_preview_data());
        assert!(!p.is_stream_terminated());
        assert!(!p.is_force_synchronization());

        p.set_stream_terminated(true);
        assert_eq!(p.options, 0b1100_0000);
        assert!(p.is_stream_terminated());

        p.set_force_synchronization(true);
        assert_eq!(p.options, 0b1110_0000);
    }

    #[test]
    fn round_trip() {
        let mut p = DataPacket::new();
        p.root.cid = [7; 16];
        p.set_source_name("front of house").unwrap();
        p.priority = 150;
        p.sync_address = 7962;
        p.sequence = 42;
        p.universe = 12;
        p.set_data(&[0, 64, 128, 255]);

        let encoded = p.encode();
        assert_eq!(&encoded[0..4], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&encoded[4..16], &ACN_PACKET_IDENTIFIER);

        match SacnPacket::decode(&encoded).unwrap() {
            SacnPacket::Data(decoded) => assert_eq!(decoded, p),
            other => panic!("wrong family: {other:?}"),
        }
    }

    #[test]
    fn source_name_limit() {
        let mut p = DataPacket::new();
        assert!(p.set_source_name(&"a".repeat(64)).is_ok());
        assert!(p.set_source_name(&"a".repeat(65)).is_err());
        assert_eq!(p.source_name(), "a".repeat(64));
    }

    #[test]
    fn decode_rejects_lying_length_fields() {
        let mut p = DataPacket::new();
        p.set_data(&[1, 2, 3]);
        let mut encoded = p.encode();

        // Claim a DMP layer larger than the datagram.
        BigEndian::write_u16(&mut encoded[115..117], 0x7FFF);
        assert!(matches!(
            SacnPacket::decode(&encoded),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_dmp_statics() {
        let mut p = DataPacket::new();
        p.set_data(&[1]);
        let mut encoded = p.encode();
        encoded[118] = 0xA2; // format
        assert!(matches!(
            SacnPacket::decode(&encoded),
            Err(PacketError::InvalidDmpFormat)
        ));
    }
}
