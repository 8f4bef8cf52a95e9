//! Core types shared between the sender and receiver.

use std::fmt;

use uuid::Uuid;

/// Component Identifier: the 16-byte RFC 4122 UUID that identifies an sACN
/// source (E1.31 §5.6).
///
/// A source keeps the same CID for its whole lifetime, across all universes
/// it transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub [u8; 16]);

impl ComponentId {
    /// Generate a fresh CID (UUID version 7, as recommended for new sources).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl From<Uuid> for ComponentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

impl From<[u8; 16]> for ComponentId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}
