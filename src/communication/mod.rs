use std::fmt::{Debug, Display};

pub use channel::{Channel, ChannelAcceptor, ConnectionHandler, Psm};

pub mod channel;
pub mod discovery;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid16(pub u16);

impl From<u16> for Uuid16 {
    fn from(u: u16) -> Self {
        Self(u)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid32(pub u32);

impl From<u32> for Uuid32 {
    fn from(u: u32) -> Self {
        Self(u)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid128(pub u128);

impl From<u16> for Uuid128 {
    fn from(u: u16) -> Self {
        Self::from(Uuid16::from(u))
    }
}

impl From<u32> for Uuid128 {
    fn from(u: u32) -> Self {
        Self::from(Uuid32::from(u))
    }
}

impl From<u128> for Uuid128 {
    fn from(u: u128) -> Self {
        Self(u)
    }
}

pub const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// The 16- and 32-bit aliases occupy the top 32 bits of the base UUID.
const ALIAS_SHIFT: u32 = 96;
const BASE_UUID_MASK: u128 = (1 << ALIAS_SHIFT) - 1;

impl From<Uuid16> for Uuid32 {
    fn from(u: Uuid16) -> Self {
        Self(u.0 as u32)
    }
}

impl From<Uuid16> for Uuid128 {
    fn from(u: Uuid16) -> Self {
        Self(((u.0 as u128) << ALIAS_SHIFT) | BASE_UUID)
    }
}

impl From<Uuid32> for Uuid128 {
    fn from(u: Uuid32) -> Self {
        Self(((u.0 as u128) << ALIAS_SHIFT) | BASE_UUID)
    }
}

impl Debug for Uuid16 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl Debug for Uuid32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}-{:04x}", self.0 >> 16, self.0 & 0xffff)
    }
}

impl Debug for Uuid128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

/// A Bluetooth UUID of any width.
///
/// Always held as the full 128-bit value, so a 16-bit alias compares equal to
/// its expanded form. When serialized, the narrowest encoding that round-trips
/// is chosen (see [`Uuid::compact_size`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(u128);

impl Uuid {
    pub const fn from_u16(u: u16) -> Self {
        Self(((u as u128) << ALIAS_SHIFT) | BASE_UUID)
    }

    pub const fn from_u32(u: u32) -> Self {
        Self(((u as u128) << ALIAS_SHIFT) | BASE_UUID)
    }

    pub const fn from_u128(u: u128) -> Self {
        Self(u)
    }

    pub const fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    pub const fn to_be_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// A random (version 4) UUID.
    pub fn new_v4() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self::from_be_bytes(bytes)
    }

    /// The 32-bit alias of this UUID, if it is derived from the base UUID.
    pub fn as_u32(&self) -> Option<u32> {
        if self.0 & BASE_UUID_MASK == BASE_UUID {
            Some((self.0 >> ALIAS_SHIFT) as u32)
        } else {
            None
        }
    }

    /// The 16-bit alias of this UUID, if it has one.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|u| u16::try_from(u).ok())
    }

    /// Number of bytes needed to encode this UUID without losing information:
    /// 2, 4 or 16.
    pub fn compact_size(&self) -> usize {
        if self.as_u16().is_some() {
            2
        } else if self.as_u32().is_some() {
            4
        } else {
            16
        }
    }
}

impl From<Uuid16> for Uuid {
    fn from(u: Uuid16) -> Self {
        Self::from_u16(u.0)
    }
}

impl From<Uuid32> for Uuid {
    fn from(u: Uuid32) -> Self {
        Self::from_u32(u.0)
    }
}

impl From<Uuid128> for Uuid {
    fn from(u: Uuid128) -> Self {
        Self(u.0)
    }
}

impl From<Uuid> for Uuid128 {
    fn from(u: Uuid) -> Self {
        Self(u.0)
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "{:?}", Uuid16(short)),
            None => write!(f, "{:?}", Uuid128(self.0)),
        }
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", Uuid128(self.0))
    }
}
