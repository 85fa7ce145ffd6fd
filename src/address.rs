use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A Bluetooth device address. Bytes are stored in little-endian order, the
/// way they appear on the wire, and displayed most significant byte first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct Address {
    bytes: [u8; 6],
}

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Address {
        Address { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Address> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Address::new(arr))
    }
}

impl From<[u8; 6]> for Address {
    fn from(bytes: [u8; 6]) -> Self {
        Address { bytes }
    }
}

impl From<Address> for [u8; 6] {
    fn from(val: Address) -> Self {
        val.bytes
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid bluetooth address: {0:?}")]
pub struct ParseAddressError(String);

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');

        for byte in bytes.iter_mut().rev() {
            let part = parts.next().ok_or_else(|| ParseAddressError(s.to_owned()))?;
            if part.len() != 2 {
                return Err(ParseAddressError(s.to_owned()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_owned()))?;
        }

        if parts.next().is_some() {
            return Err(ParseAddressError(s.to_owned()));
        }

        Ok(Address::new(bytes))
    }
}
