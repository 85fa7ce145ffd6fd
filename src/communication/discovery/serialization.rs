use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;

use super::error::{Error, Result};
use crate::communication::Uuid;
use crate::util::BufExt;

pub trait ToBuf {
    fn to_buf<B: BufMut>(&self, buf: &mut B);
}

pub const PDU_HEADER_SIZE: usize = 5;

pub type TransactionId = u16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PduId {
    ErrorResponse = 0x01,
    ServiceSearchRequest,
    ServiceSearchResponse,
    ServiceAttributeRequest,
    ServiceAttributeResponse,
    ServiceSearchAttributeRequest,
    ServiceSearchAttributeResponse,
}

/// The fixed five byte header in front of every SDP PDU. The opcode is kept
/// raw so that unknown PDUs can still be answered with their transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub opcode: u8,
    pub tid: TransactionId,
    pub parameter_length: u16,
}

impl PduHeader {
    pub fn from_buf<B: Buf>(buf: &mut B) -> Option<Self> {
        Some(Self {
            opcode: buf.get_u8_checked()?,
            tid: buf.get_u16_checked()?,
            parameter_length: buf.get_u16_checked()?,
        })
    }

    pub fn pdu_id(&self) -> Option<PduId> {
        FromPrimitive::from_u8(self.opcode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub id: PduId,
    pub tid: TransactionId,
    pub parameter: Bytes,
}

impl Pdu {
    pub fn new(id: PduId, tid: TransactionId, parameter: Bytes) -> Self {
        Self { id, tid, parameter }
    }

    pub fn with_parameter<F: ToBuf>(id: PduId, tid: TransactionId, parameter: &F) -> Self {
        let mut buf = BytesMut::new();
        parameter.to_buf(&mut buf);
        Self::new(id, tid, buf.freeze())
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PDU_HEADER_SIZE + self.parameter.len());
        self.to_buf(&mut buf);
        buf.freeze()
    }
}

impl ToBuf for Pdu {
    fn to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.id as u8);
        buf.put_u16(self.tid);
        buf.put_u16(self.parameter.len() as u16);
        buf.put(&self.parameter[..]);
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DataElementType {
    Nil = 0,
    UnsignedInt,
    SignedInt,
    Uuid,
    String,
    Boolean,
    Sequence,
    Alternative,
    Url,
}

/// Nesting beyond this is rejected when reading, which bounds recursion on
/// hostile input.
const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    Nil,
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uuid(Uuid),
    Bool(bool),
    /// Raw bytes; SDP strings carry no guarantee of being valid UTF-8.
    String(Vec<u8>),
    Url(String),
    // Data element sequence, a data element whose data field is a sequence of
    // data elements
    Sequence(Vec<DataElement>),
    // Data element alternative, data element whose data field is a sequence of
    // data elements from which one data element is to be selected.
    Alternative(Vec<DataElement>),
}

impl DataElement {
    /// A URL element, or `None` if `url` contains characters a URI may not.
    pub fn url(url: &str) -> Option<Self> {
        if is_valid_url(url) {
            Some(Self::Url(url.to_owned()))
        } else {
            None
        }
    }

    pub fn element_type(&self) -> DataElementType {
        match self {
            DataElement::Nil => DataElementType::Nil,
            DataElement::Uint8(_)
            | DataElement::Uint16(_)
            | DataElement::Uint32(_)
            | DataElement::Uint64(_) => DataElementType::UnsignedInt,
            DataElement::Int8(_)
            | DataElement::Int16(_)
            | DataElement::Int32(_)
            | DataElement::Int64(_) => DataElementType::SignedInt,
            DataElement::Uuid(_) => DataElementType::Uuid,
            DataElement::Bool(_) => DataElementType::Boolean,
            DataElement::String(_) => DataElementType::String,
            DataElement::Url(_) => DataElementType::Url,
            DataElement::Sequence(_) => DataElementType::Sequence,
            DataElement::Alternative(_) => DataElementType::Alternative,
        }
    }

    /// Typed access; succeeds only when `T` matches the stored type and width
    /// exactly.
    pub fn get<T: FromDataElement>(&self) -> Option<T> {
        T::from_data_element(self)
    }

    /// The `idx`th member of a sequence or alternative.
    pub fn at(&self, idx: usize) -> Option<&DataElement> {
        match self {
            DataElement::Sequence(items) | DataElement::Alternative(items) => items.get(idx),
            _ => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[DataElement]> {
        match self {
            DataElement::Sequence(items) | DataElement::Alternative(items) => Some(&items[..]),
            _ => None,
        }
    }

    /// Calls `f` with every UUID in this element, searching nested sequences
    /// and alternatives.
    pub fn for_each_uuid<F: FnMut(Uuid)>(&self, f: &mut F) {
        match self {
            DataElement::Uuid(uuid) => f(*uuid),
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                for item in items {
                    item.for_each_uuid(f);
                }
            }
            _ => {}
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            DataElement::Nil => 0,
            DataElement::Uint8(_) | DataElement::Int8(_) | DataElement::Bool(_) => 1,
            DataElement::Uint16(_) | DataElement::Int16(_) => 2,
            DataElement::Uint32(_) | DataElement::Int32(_) => 4,
            DataElement::Uint64(_) | DataElement::Int64(_) => 8,
            DataElement::Uuid(uuid) => uuid.compact_size(),
            DataElement::String(s) => s.len(),
            DataElement::Url(s) => s.len(),
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                items.iter().map(DataElement::write_size).sum()
            }
        }
    }

    /// Size descriptor and the number of explicit length bytes that follow
    /// the header.
    fn size_descriptor(&self, payload_size: usize) -> (u8, usize) {
        match self {
            DataElement::Nil
            | DataElement::Uint8(_)
            | DataElement::Int8(_)
            | DataElement::Bool(_) => (0, 0),
            DataElement::Uint16(_) | DataElement::Int16(_) => (1, 0),
            DataElement::Uint32(_) | DataElement::Int32(_) => (2, 0),
            DataElement::Uint64(_) | DataElement::Int64(_) => (3, 0),
            DataElement::Uuid(_) => match payload_size {
                2 => (1, 0),
                4 => (2, 0),
                _ => (4, 0),
            },
            DataElement::String(_)
            | DataElement::Url(_)
            | DataElement::Sequence(_)
            | DataElement::Alternative(_) => {
                if payload_size <= u8::MAX as usize {
                    (5, 1)
                } else if payload_size <= u16::MAX as usize {
                    (6, 2)
                } else {
                    (7, 4)
                }
            }
        }
    }

    /// Number of bytes [`to_buf`](ToBuf::to_buf) will produce.
    pub fn write_size(&self) -> usize {
        let payload_size = self.payload_size();
        let (_, length_bytes) = self.size_descriptor(payload_size);
        1 + length_bytes + payload_size
    }

    /// Serializes into `out`, returning the number of bytes written, or 0 if
    /// `out` is too small.
    pub fn write(&self, out: &mut [u8]) -> usize {
        let size = self.write_size();
        if out.len() < size {
            return 0;
        }
        let mut cursor = &mut out[..size];
        self.to_buf(&mut cursor);
        size
    }

    /// Parses one element from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn read(buf: &[u8]) -> Result<(Self, usize)> {
        Self::read_nested(buf, 0)
    }

    fn read_nested(buf: &[u8], depth: usize) -> Result<(Self, usize)> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::PacketMalformed);
        }

        let mut cursor = buf;
        let desc = cursor.get_u8_checked().ok_or(Error::PacketMalformed)?;
        let type_desc: DataElementType =
            FromPrimitive::from_u8(desc >> 3).ok_or(Error::PacketMalformed)?;
        let size_desc = desc & 0b00000111;

        if type_desc == DataElementType::Nil {
            return match size_desc {
                0 => Ok((Self::Nil, 1)),
                _ => Err(Error::PacketMalformed),
            };
        }

        let payload_size = match size_desc {
            0..=4 => 1usize << size_desc,
            5 => cursor.get_u8_checked().ok_or(Error::PacketMalformed)? as usize,
            6 => cursor.get_u16_checked().ok_or(Error::PacketMalformed)? as usize,
            _ => cursor.get_u32_checked().ok_or(Error::PacketMalformed)? as usize,
        };

        if cursor.remaining() < payload_size {
            return Err(Error::PacketMalformed);
        }

        let header_size = buf.len() - cursor.len();
        let mut payload = &cursor[..payload_size];

        let element = match (type_desc, size_desc) {
            (DataElementType::UnsignedInt, 0) => Self::Uint8(payload.get_u8()),
            (DataElementType::UnsignedInt, 1) => Self::Uint16(payload.get_u16()),
            (DataElementType::UnsignedInt, 2) => Self::Uint32(payload.get_u32()),
            (DataElementType::UnsignedInt, 3) => Self::Uint64(payload.get_u64()),
            (DataElementType::SignedInt, 0) => Self::Int8(payload.get_i8()),
            (DataElementType::SignedInt, 1) => Self::Int16(payload.get_i16()),
            (DataElementType::SignedInt, 2) => Self::Int32(payload.get_i32()),
            (DataElementType::SignedInt, 3) => Self::Int64(payload.get_i64()),
            (DataElementType::Uuid, 1) => Self::Uuid(Uuid::from_u16(payload.get_u16())),
            (DataElementType::Uuid, 2) => Self::Uuid(Uuid::from_u32(payload.get_u32())),
            (DataElementType::Uuid, 4) => Self::Uuid(Uuid::from_u128(payload.get_u128())),
            (DataElementType::Boolean, 0) => Self::Bool(payload.get_u8() != 0),
            (DataElementType::String, 5..=7) => Self::String(payload.to_vec()),
            (DataElementType::Url, 5..=7) => {
                let url = std::str::from_utf8(payload).map_err(|_| Error::PacketMalformed)?;
                Self::url(url).ok_or(Error::PacketMalformed)?
            }
            (DataElementType::Sequence, 5..=7) => {
                Self::Sequence(Self::read_members(payload, depth)?)
            }
            (DataElementType::Alternative, 5..=7) => {
                Self::Alternative(Self::read_members(payload, depth)?)
            }
            _ => return Err(Error::PacketMalformed),
        };

        Ok((element, header_size + payload_size))
    }

    fn read_members(mut payload: &[u8], depth: usize) -> Result<Vec<DataElement>> {
        let mut members = vec![];
        while !payload.is_empty() {
            let (member, used) = Self::read_nested(payload, depth + 1)?;
            members.push(member);
            payload = &payload[used..];
        }
        Ok(members)
    }
}

impl ToBuf for DataElement {
    fn to_buf<B: BufMut>(&self, buf: &mut B) {
        let payload_size = self.payload_size();
        let (size_desc, length_bytes) = self.size_descriptor(payload_size);
        let type_desc = self.element_type() as u8;

        buf.put_u8((type_desc << 3) | size_desc);

        match length_bytes {
            1 => buf.put_u8(payload_size as u8),
            2 => buf.put_u16(payload_size as u16),
            4 => buf.put_u32(payload_size as u32),
            _ => {}
        };

        match self {
            DataElement::Nil => {}
            DataElement::Uint8(v) => buf.put_u8(*v),
            DataElement::Uint16(v) => buf.put_u16(*v),
            DataElement::Uint32(v) => buf.put_u32(*v),
            DataElement::Uint64(v) => buf.put_u64(*v),
            DataElement::Int8(v) => buf.put_i8(*v),
            DataElement::Int16(v) => buf.put_i16(*v),
            DataElement::Int32(v) => buf.put_i32(*v),
            DataElement::Int64(v) => buf.put_i64(*v),
            DataElement::Uuid(v) => match payload_size {
                2 => buf.put_u16((v.as_u128() >> 96) as u16),
                4 => buf.put_u32((v.as_u128() >> 96) as u32),
                _ => buf.put_u128(v.as_u128()),
            },
            DataElement::Bool(v) => buf.put_u8(*v as u8),
            DataElement::String(v) => buf.put_slice(v),
            DataElement::Url(v) => buf.put_slice(v.as_bytes()),
            DataElement::Sequence(v) | DataElement::Alternative(v) => {
                for vi in v {
                    vi.to_buf(buf);
                }
            }
        };
    }
}

/// Characters allowed in a URI reference: unreserved, reserved and `%`.
pub fn is_valid_url(url: &str) -> bool {
    url.bytes().all(|c| {
        c.is_ascii_alphanumeric() || b"-._~:/?#[]@!$&'()*+,;=%".contains(&c)
    })
}

/// Exact-type extraction out of a [`DataElement`].
pub trait FromDataElement: Sized {
    fn from_data_element(element: &DataElement) -> Option<Self>;
}

macro_rules! from_data_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromDataElement for $ty {
                fn from_data_element(element: &DataElement) -> Option<Self> {
                    match element {
                        DataElement::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for DataElement {
                fn from(v: $ty) -> Self {
                    DataElement::$variant(v)
                }
            }
        )*
    };
}

from_data_element! {
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    bool => Bool,
    Uuid => Uuid,
}

/// Strings come back as text only if they are valid UTF-8.
impl FromDataElement for String {
    fn from_data_element(element: &DataElement) -> Option<Self> {
        match element {
            DataElement::String(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }
}

impl FromDataElement for Vec<DataElement> {
    fn from_data_element(element: &DataElement) -> Option<Self> {
        match element {
            DataElement::Sequence(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl From<&str> for DataElement {
    fn from(s: &str) -> Self {
        DataElement::String(s.as_bytes().to_vec())
    }
}

impl From<String> for DataElement {
    fn from(s: String) -> Self {
        DataElement::String(s.into_bytes())
    }
}

impl From<Vec<DataElement>> for DataElement {
    fn from(items: Vec<DataElement>) -> Self {
        DataElement::Sequence(items)
    }
}

impl Display for DataElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DataElement::Nil => write!(f, "Null"),
            DataElement::Uint8(v) => write!(f, "UnsignedInt:1({})", v),
            DataElement::Uint16(v) => write!(f, "UnsignedInt:2({})", v),
            DataElement::Uint32(v) => write!(f, "UnsignedInt:4({})", v),
            DataElement::Uint64(v) => write!(f, "UnsignedInt:8({})", v),
            DataElement::Int8(v) => write!(f, "SignedInt:1({})", v),
            DataElement::Int16(v) => write!(f, "SignedInt:2({})", v),
            DataElement::Int32(v) => write!(f, "SignedInt:4({})", v),
            DataElement::Int64(v) => write!(f, "SignedInt:8({})", v),
            DataElement::Uuid(v) => write!(f, "UUID({})", v),
            DataElement::Bool(v) => write!(f, "Boolean({})", v),
            DataElement::String(v) => write!(f, "String({})", String::from_utf8_lossy(v)),
            DataElement::Url(v) => write!(f, "Url({})", v),
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                let name = match self {
                    DataElement::Sequence(_) => "Sequence",
                    _ => "Alternative",
                };
                write!(f, "{} {{ ", name)?;
                for item in items {
                    write!(f, "{} ", item)?;
                }
                write!(f, "}}")
            }
        }
    }
}
