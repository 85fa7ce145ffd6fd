//! Request and response parameter layouts for the SDP transactions.
//!
//! Requests are built by the client and parsed by the server; responses go
//! the other way. A response may be too large for one PDU, in which case the
//! server splits it using an opaque continuation state that the client hands
//! back in its next request.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{trace, warn};

use super::error::{Error, ErrorCode, Result};
use super::serialization::{DataElement, Pdu, PduId, ToBuf, TransactionId, PDU_HEADER_SIZE};
use super::{
    AttributeId, AttributeMap, ServiceHandle, MAX_CONTINUATION_STATE_SIZE,
    MAX_SERVICE_SEARCH_SIZE, MAX_SUPPORTED_ATTRIBUTE_LIST_BYTES, MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT,
};
use crate::communication::Uuid;
use crate::util::BufExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The response is complete.
    Complete,
    /// More fragments are needed; send the request again with the
    /// response's continuation state.
    Continuing,
}

/// How a received attribute list treats ids that are not in ascending order.
/// Duplicate ids are rejected either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeOrdering {
    #[default]
    Strict,
    Lenient,
}

pub trait Request {
    fn valid(&self) -> bool;

    /// The full PDU for this request, or `None` if the request is not valid.
    fn get_pdu(&self, tid: TransactionId) -> Option<Bytes>;

    fn continuation_state(&self) -> &[u8];

    /// Returns `false` if `state` is too long to be carried in a PDU.
    fn set_continuation_state(&mut self, state: &[u8]) -> bool;
}

pub trait Response {
    /// Whether every fragment has been received.
    fn complete(&self) -> bool;

    /// State to send back to the server to fetch the next fragment.
    fn continuation_state(&self) -> &[u8];

    /// Parses one fragment of the response parameters.
    fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus>;

    /// Builds the PDU carrying the fragment that starts at `cont_state`,
    /// limited by the request's own maximum `req_max` and the channel's
    /// `max_size`. Returns `None` if the continuation state is not one this
    /// response handed out.
    fn get_pdu(
        &self,
        req_max: u16,
        tid: TransactionId,
        max_size: u16,
        cont_state: &[u8],
    ) -> Option<Bytes>;
}

/// Reads a continuation state which must end exactly at the end of `buf`.
fn read_continuation_state(buf: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = buf;
    let len = cursor.get_u8_checked().ok_or(Error::PacketMalformed)? as usize;
    if len > MAX_CONTINUATION_STATE_SIZE || cursor.len() != len {
        return Err(Error::PacketMalformed);
    }
    Ok(cursor.to_vec())
}

fn put_continuation_state<B: BufMut>(buf: &mut B, state: &[u8]) {
    buf.put_u8(state.len() as u8);
    buf.put_slice(state);
}

fn read_search_pattern(buf: &[u8]) -> Result<(BTreeSet<Uuid>, usize)> {
    let (element, used) = DataElement::read(buf)?;
    let items = match element {
        DataElement::Sequence(items) => items,
        _ => return Err(Error::PacketMalformed),
    };

    if items.is_empty() || items.len() > MAX_SERVICE_SEARCH_SIZE {
        return Err(Error::PacketMalformed);
    }

    let mut pattern = BTreeSet::new();
    for item in items {
        pattern.insert(item.get::<Uuid>().ok_or(Error::PacketMalformed)?);
    }
    Ok((pattern, used))
}

fn search_pattern_element(pattern: &BTreeSet<Uuid>) -> DataElement {
    DataElement::Sequence(pattern.iter().copied().map(DataElement::Uuid).collect())
}

/// An inclusive range of attribute ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRange {
    pub start: AttributeId,
    pub end: AttributeId,
}

impl AttributeRange {
    pub const ALL: Self = Self {
        start: AttributeId(0x0000),
        end: AttributeId(0xFFFF),
    };

    pub fn new(start: AttributeId, end: AttributeId) -> Self {
        Self { start, end }
    }

    pub fn single(id: AttributeId) -> Self {
        Self::new(id, id)
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.start <= id && id <= self.end
    }

    fn to_data_element(self) -> DataElement {
        if self.start == self.end {
            DataElement::Uint16(self.start.0)
        } else {
            DataElement::Uint32(((self.start.0 as u32) << 16) | self.end.0 as u32)
        }
    }
}

/// A sorted set of disjoint attribute ranges. Overlapping and adjacent
/// ranges are merged as they are added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeRanges(Vec<AttributeRange>);

impl AttributeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(vec![AttributeRange::ALL])
    }

    pub fn add_attribute(&mut self, id: AttributeId) {
        self.add_range(id, id);
    }

    /// Adds `start..=end`. Does nothing if `start > end`.
    pub fn add_range(&mut self, start: AttributeId, end: AttributeId) {
        if start > end {
            return;
        }

        let mut merged = AttributeRange::new(start, end);
        let mut placed = false;
        let mut ranges = Vec::with_capacity(self.0.len() + 1);

        for range in self.0.drain(..) {
            if (range.end.0 as u32) + 1 < merged.start.0 as u32 {
                ranges.push(range);
            } else if (merged.end.0 as u32) + 1 < range.start.0 as u32 {
                if !placed {
                    ranges.push(merged);
                    placed = true;
                }
                ranges.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }

        if !placed {
            ranges.push(merged);
        }
        self.0 = ranges;
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.0.iter().any(|range| range.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeRange> {
        self.0.iter()
    }

    /// Reads an attribute id list: a non-empty sequence of 16-bit ids and
    /// 32-bit `start << 16 | end` ranges.
    fn read(buf: &[u8]) -> Result<(Self, usize)> {
        let (element, used) = DataElement::read(buf)?;
        let items = match element {
            DataElement::Sequence(items) if !items.is_empty() => items,
            _ => return Err(Error::PacketMalformed),
        };

        let mut ranges = Self::new();
        for item in items {
            match item {
                DataElement::Uint16(id) => ranges.add_attribute(AttributeId(id)),
                DataElement::Uint32(range) => {
                    let start = AttributeId((range >> 16) as u16);
                    let end = AttributeId(range as u16);
                    if start > end {
                        return Err(Error::PacketMalformed);
                    }
                    ranges.add_range(start, end);
                }
                _ => return Err(Error::PacketMalformed),
            }
        }
        Ok((ranges, used))
    }

    fn to_data_element(&self) -> DataElement {
        DataElement::Sequence(self.0.iter().map(|range| range.to_data_element()).collect())
    }
}

impl FromIterator<AttributeId> for AttributeRanges {
    fn from_iter<T: IntoIterator<Item = AttributeId>>(iter: T) -> Self {
        let mut ranges = Self::new();
        for id in iter {
            ranges.add_attribute(id);
        }
        ranges
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSearchRequest {
    service_search_pattern: BTreeSet<Uuid>,
    max_service_record_count: u16,
    continuation_state: Vec<u8>,
}

impl Default for ServiceSearchRequest {
    fn default() -> Self {
        Self {
            service_search_pattern: BTreeSet::new(),
            max_service_record_count: u16::MAX,
            continuation_state: vec![],
        }
    }
}

impl ServiceSearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(params: &[u8]) -> Result<Self> {
        let (service_search_pattern, used) = read_search_pattern(params)?;
        let mut cursor = &params[used..];

        let max_service_record_count = cursor.get_u16_checked().ok_or(Error::PacketMalformed)?;
        if max_service_record_count == 0 {
            return Err(Error::PacketMalformed);
        }

        Ok(Self {
            service_search_pattern,
            max_service_record_count,
            continuation_state: read_continuation_state(cursor)?,
        })
    }

    pub fn service_search_pattern(&self) -> &BTreeSet<Uuid> {
        &self.service_search_pattern
    }

    pub fn set_search_pattern<I: IntoIterator<Item = Uuid>>(&mut self, pattern: I) {
        self.service_search_pattern = pattern.into_iter().collect();
    }

    pub fn max_service_record_count(&self) -> u16 {
        self.max_service_record_count
    }

    pub fn set_max_service_record_count(&mut self, count: u16) {
        self.max_service_record_count = count;
    }
}

impl ToBuf for ServiceSearchRequest {
    fn to_buf<B: BufMut>(&self, buf: &mut B) {
        search_pattern_element(&self.service_search_pattern).to_buf(buf);
        buf.put_u16(self.max_service_record_count);
        put_continuation_state(buf, &self.continuation_state);
    }
}

impl Request for ServiceSearchRequest {
    fn valid(&self) -> bool {
        self.max_service_record_count > 0
            && !self.service_search_pattern.is_empty()
            && self.service_search_pattern.len() <= MAX_SERVICE_SEARCH_SIZE
    }

    fn get_pdu(&self, tid: TransactionId) -> Option<Bytes> {
        if !self.valid() {
            return None;
        }
        Some(Pdu::with_parameter(PduId::ServiceSearchRequest, tid, self).to_bytes())
    }

    fn continuation_state(&self) -> &[u8] {
        &self.continuation_state
    }

    fn set_continuation_state(&mut self, state: &[u8]) -> bool {
        if state.len() > MAX_CONTINUATION_STATE_SIZE {
            return false;
        }
        self.continuation_state = state.to_vec();
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributeRequest {
    service_record_handle: ServiceHandle,
    max_attribute_byte_count: u16,
    attribute_ranges: AttributeRanges,
    continuation_state: Vec<u8>,
}

impl Default for ServiceAttributeRequest {
    fn default() -> Self {
        Self {
            service_record_handle: 0,
            max_attribute_byte_count: u16::MAX,
            attribute_ranges: AttributeRanges::new(),
            continuation_state: vec![],
        }
    }
}

impl ServiceAttributeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(params: &[u8]) -> Result<Self> {
        let mut cursor = params;
        let service_record_handle = cursor.get_u32_checked().ok_or(Error::PacketMalformed)?;
        let max_attribute_byte_count = cursor.get_u16_checked().ok_or(Error::PacketMalformed)?;
        if max_attribute_byte_count < MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT {
            return Err(Error::PacketMalformed);
        }

        let (attribute_ranges, used) = AttributeRanges::read(cursor)?;

        Ok(Self {
            service_record_handle,
            max_attribute_byte_count,
            attribute_ranges,
            continuation_state: read_continuation_state(&cursor[used..])?,
        })
    }

    pub fn service_record_handle(&self) -> ServiceHandle {
        self.service_record_handle
    }

    pub fn set_service_record_handle(&mut self, handle: ServiceHandle) {
        self.service_record_handle = handle;
    }

    pub fn max_attribute_byte_count(&self) -> u16 {
        self.max_attribute_byte_count
    }

    pub fn set_max_attribute_byte_count(&mut self, count: u16) {
        self.max_attribute_byte_count = count;
    }

    pub fn attribute_ranges(&self) -> &AttributeRanges {
        &self.attribute_ranges
    }

    pub fn add_attribute(&mut self, id: AttributeId) {
        self.attribute_ranges.add_attribute(id);
    }

    pub fn add_attribute_range(&mut self, start: AttributeId, end: AttributeId) {
        self.attribute_ranges.add_range(start, end);
    }
}

impl ToBuf for ServiceAttributeRequest {
    fn to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.service_record_handle);
        buf.put_u16(self.max_attribute_byte_count);
        self.attribute_ranges.to_data_element().to_buf(buf);
        put_continuation_state(buf, &self.continuation_state);
    }
}

impl Request for ServiceAttributeRequest {
    fn valid(&self) -> bool {
        self.max_attribute_byte_count >= MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT
            && !self.attribute_ranges.is_empty()
    }

    fn get_pdu(&self, tid: TransactionId) -> Option<Bytes> {
        if !self.valid() {
            return None;
        }
        Some(Pdu::with_parameter(PduId::ServiceAttributeRequest, tid, self).to_bytes())
    }

    fn continuation_state(&self) -> &[u8] {
        &self.continuation_state
    }

    fn set_continuation_state(&mut self, state: &[u8]) -> bool {
        if state.len() > MAX_CONTINUATION_STATE_SIZE {
            return false;
        }
        self.continuation_state = state.to_vec();
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSearchAttributeRequest {
    service_search_pattern: BTreeSet<Uuid>,
    max_attribute_byte_count: u16,
    attribute_ranges: AttributeRanges,
    continuation_state: Vec<u8>,
}

impl Default for ServiceSearchAttributeRequest {
    fn default() -> Self {
        Self {
            service_search_pattern: BTreeSet::new(),
            max_attribute_byte_count: u16::MAX,
            attribute_ranges: AttributeRanges::new(),
            continuation_state: vec![],
        }
    }
}

impl ServiceSearchAttributeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(params: &[u8]) -> Result<Self> {
        let (service_search_pattern, used) = read_search_pattern(params)?;
        let mut cursor = &params[used..];

        let max_attribute_byte_count = cursor.get_u16_checked().ok_or(Error::PacketMalformed)?;
        if max_attribute_byte_count < MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT {
            return Err(Error::PacketMalformed);
        }

        let (attribute_ranges, used) = AttributeRanges::read(cursor)?;

        Ok(Self {
            service_search_pattern,
            max_attribute_byte_count,
            attribute_ranges,
            continuation_state: read_continuation_state(&cursor[used..])?,
        })
    }

    pub fn service_search_pattern(&self) -> &BTreeSet<Uuid> {
        &self.service_search_pattern
    }

    pub fn set_search_pattern<I: IntoIterator<Item = Uuid>>(&mut self, pattern: I) {
        self.service_search_pattern = pattern.into_iter().collect();
    }

    pub fn max_attribute_byte_count(&self) -> u16 {
        self.max_attribute_byte_count
    }

    pub fn set_max_attribute_byte_count(&mut self, count: u16) {
        self.max_attribute_byte_count = count;
    }

    pub fn attribute_ranges(&self) -> &AttributeRanges {
        &self.attribute_ranges
    }

    pub fn add_attribute(&mut self, id: AttributeId) {
        self.attribute_ranges.add_attribute(id);
    }

    pub fn add_attribute_range(&mut self, start: AttributeId, end: AttributeId) {
        self.attribute_ranges.add_range(start, end);
    }
}

impl ToBuf for ServiceSearchAttributeRequest {
    fn to_buf<B: BufMut>(&self, buf: &mut B) {
        search_pattern_element(&self.service_search_pattern).to_buf(buf);
        buf.put_u16(self.max_attribute_byte_count);
        self.attribute_ranges.to_data_element().to_buf(buf);
        put_continuation_state(buf, &self.continuation_state);
    }
}

impl Request for ServiceSearchAttributeRequest {
    fn valid(&self) -> bool {
        !self.service_search_pattern.is_empty()
            && self.service_search_pattern.len() <= MAX_SERVICE_SEARCH_SIZE
            && self.max_attribute_byte_count >= MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT
            && !self.attribute_ranges.is_empty()
    }

    fn get_pdu(&self, tid: TransactionId) -> Option<Bytes> {
        if !self.valid() {
            return None;
        }
        Some(Pdu::with_parameter(PduId::ServiceSearchAttributeRequest, tid, self).to_bytes())
    }

    fn continuation_state(&self) -> &[u8] {
        &self.continuation_state
    }

    fn set_continuation_state(&mut self, state: &[u8]) -> bool {
        if state.len() > MAX_CONTINUATION_STATE_SIZE {
            return false;
        }
        self.continuation_state = state.to_vec();
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSearchResponse {
    total_service_record_count: u16,
    service_record_handles: Vec<ServiceHandle>,
    continuation_state: Vec<u8>,
}

impl ServiceSearchResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_record_handles(&self) -> &[ServiceHandle] {
        &self.service_record_handles
    }

    pub fn set_service_record_handles(&mut self, mut handles: Vec<ServiceHandle>) {
        handles.truncate(u16::MAX as usize);
        self.total_service_record_count = handles.len() as u16;
        self.service_record_handles = handles;
    }
}

impl Response for ServiceSearchResponse {
    fn complete(&self) -> bool {
        self.total_service_record_count as usize == self.service_record_handles.len()
    }

    fn continuation_state(&self) -> &[u8] {
        &self.continuation_state
    }

    fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus> {
        if self.complete() && self.total_service_record_count != 0 {
            return Err(Error::NotReady);
        }

        let mut cursor = buf;
        let total = cursor.get_u16_checked().ok_or(Error::PacketMalformed)?;
        let current = cursor.get_u16_checked().ok_or(Error::PacketMalformed)? as usize;

        if self.total_service_record_count != 0 && total != self.total_service_record_count {
            trace!("total service record count changed between fragments");
            return Err(Error::PacketMalformed);
        }
        if self.service_record_handles.len() + current > total as usize {
            return Err(Error::PacketMalformed);
        }
        if cursor.len() < current * 4 + 1 {
            return Err(Error::PacketMalformed);
        }

        let handles: Vec<ServiceHandle> = (0..current).map(|_| cursor.get_u32()).collect();
        let state = read_continuation_state(cursor)?;
        if state.is_empty() && self.service_record_handles.len() + current != total as usize {
            trace!("search response ended before every handle was sent");
            return Err(Error::PacketMalformed);
        }

        self.total_service_record_count = total;
        self.service_record_handles.extend(handles);
        self.continuation_state = state;

        if self.continuation_state.is_empty() {
            Ok(ParseStatus::Complete)
        } else {
            Ok(ParseStatus::Continuing)
        }
    }

    fn get_pdu(
        &self,
        req_max: u16,
        tid: TransactionId,
        max_size: u16,
        cont_state: &[u8],
    ) -> Option<Bytes> {
        let start_idx = match *cont_state {
            [] => 0,
            [hi, lo] => u16::from_be_bytes([hi, lo]) as usize,
            _ => return None,
        };

        let response_count = (self.total_service_record_count.min(req_max) as usize)
            .min(self.service_record_handles.len());
        if !cont_state.is_empty() && response_count <= start_idx {
            return None;
        }

        // header, both counts, and the continuation length byte
        const MIN_SIZE: usize = PDU_HEADER_SIZE + 4 + 1;
        let available = (max_size as usize).checked_sub(MIN_SIZE)?;
        let remaining = response_count - start_idx;

        let mut max_records = available / 4;
        let mut info_len = 0;
        if remaining > max_records {
            max_records = available.saturating_sub(2) / 4;
            info_len = 2;
            if max_records == 0 {
                return None;
            }
        }
        let current = remaining.min(max_records);

        let mut params = BytesMut::with_capacity(4 + current * 4 + 1 + info_len);
        params.put_u16(response_count as u16);
        params.put_u16(current as u16);
        for handle in &self.service_record_handles[start_idx..start_idx + current] {
            params.put_u32(*handle);
        }
        params.put_u8(info_len as u8);
        if info_len > 0 {
            params.put_u16((start_idx + current) as u16);
        }

        Some(Pdu::new(PduId::ServiceSearchResponse, tid, params.freeze()).to_bytes())
    }
}

/// Collects attribute list fragments until the server stops sending a
/// continuation state.
#[derive(Debug, Clone, Default)]
struct Reassembly {
    partial: Option<BytesMut>,
    continuation_state: Vec<u8>,
}

impl Reassembly {
    fn is_pending(&self) -> bool {
        self.partial.is_some()
    }

    /// Takes one `byte count, bytes, continuation` fragment. Returns the
    /// assembled list once the last fragment arrives.
    fn feed(&mut self, buf: &[u8]) -> Result<Option<Bytes>> {
        let mut cursor = buf;
        let byte_count = cursor.get_u16_checked().ok_or(Error::PacketMalformed)? as usize;
        if cursor.len() < byte_count + 1 {
            return Err(Error::PacketMalformed);
        }

        let (list, rest) = cursor.split_at(byte_count);
        let state = read_continuation_state(rest)?;

        if self.partial.is_none() && state.is_empty() {
            self.continuation_state.clear();
            return Ok(Some(Bytes::copy_from_slice(list)));
        }

        let mut partial = self.partial.take().unwrap_or_default();
        if partial.len() + list.len() > MAX_SUPPORTED_ATTRIBUTE_LIST_BYTES {
            warn!(
                "attribute list exceeds {} bytes, dropping it",
                MAX_SUPPORTED_ATTRIBUTE_LIST_BYTES
            );
            self.continuation_state.clear();
            return Err(Error::NotSupported);
        }
        partial.extend_from_slice(list);

        if state.is_empty() {
            self.continuation_state.clear();
            Ok(Some(partial.freeze()))
        } else {
            self.continuation_state = state;
            self.partial = Some(partial);
            Ok(None)
        }
    }
}

/// Builds an attribute map out of alternating `Uint16` ids and values.
fn attribute_map_from_pairs(
    items: Vec<DataElement>,
    ordering: AttributeOrdering,
) -> Result<AttributeMap> {
    let mut attributes = AttributeMap::new();
    let mut last: Option<AttributeId> = None;
    let mut items = items.into_iter();

    while let Some(id) = items.next() {
        let id = AttributeId(id.get::<u16>().ok_or(Error::PacketMalformed)?);
        let value = items.next().ok_or(Error::PacketMalformed)?;

        if let Some(last) = last {
            if id < last {
                match ordering {
                    AttributeOrdering::Strict => {
                        warn!("attribute {:?} follows {:?}", id, last);
                        return Err(Error::PacketMalformed);
                    }
                    AttributeOrdering::Lenient => {
                        warn!("attribute {:?} follows {:?}, accepting anyway", id, last)
                    }
                }
            }
        }

        if attributes.insert(id, value).is_some() {
            warn!("attribute {:?} appears twice", id);
            return Err(Error::PacketMalformed);
        }
        last = Some(id);
    }

    Ok(attributes)
}

fn read_attribute_list(bytes: &[u8], ordering: AttributeOrdering) -> Result<AttributeMap> {
    let (element, used) = DataElement::read(bytes)?;
    if used != bytes.len() {
        return Err(Error::PacketMalformed);
    }
    match element {
        DataElement::Sequence(items) => attribute_map_from_pairs(items, ordering),
        _ => Err(Error::PacketMalformed),
    }
}

fn attribute_list_element(attributes: &AttributeMap) -> DataElement {
    DataElement::Sequence(
        attributes
            .iter()
            .flat_map(|(id, value)| [DataElement::Uint16(id.0), value.clone()])
            .collect(),
    )
}

/// Shared fragmenting for both attribute responses. The continuation state is
/// the absolute byte offset of the fragment within the serialized list.
fn attribute_list_pdu(
    id: PduId,
    list: &DataElement,
    req_max: u16,
    tid: TransactionId,
    max_size: u16,
    cont_state: &[u8],
) -> Option<Bytes> {
    let bytes_skipped = match *cont_state {
        [] => 0,
        [a, b, c, d] => u32::from_be_bytes([a, b, c, d]) as usize,
        _ => return None,
    };

    let write_size = list.write_size();
    if bytes_skipped > write_size {
        trace!("continuation offset {} past end of {} byte list", bytes_skipped, write_size);
        return None;
    }

    // header, byte count, and the continuation length byte
    const OVERHEAD: usize = PDU_HEADER_SIZE + 2 + 1;
    let max_byte_count = (max_size as usize)
        .checked_sub(OVERHEAD)?
        .min(req_max as usize);

    let mut byte_count = write_size - bytes_skipped;
    let mut info_len = 0;
    if byte_count > max_byte_count {
        info_len = 4;
        if max_byte_count <= info_len {
            return None;
        }
        byte_count = max_byte_count - info_len;
    }

    let mut serialized = BytesMut::with_capacity(write_size);
    list.to_buf(&mut serialized);

    let mut params = BytesMut::with_capacity(2 + byte_count + 1 + info_len);
    params.put_u16(byte_count as u16);
    params.put_slice(&serialized[bytes_skipped..bytes_skipped + byte_count]);
    params.put_u8(info_len as u8);
    if info_len > 0 {
        params.put_u32((bytes_skipped + byte_count) as u32);
    }

    Some(Pdu::new(id, tid, params.freeze()).to_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct ServiceAttributeResponse {
    attributes: AttributeMap,
    reassembly: Reassembly,
    ordering: AttributeOrdering,
}

impl ServiceAttributeResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ordering(ordering: AttributeOrdering) -> Self {
        Self {
            ordering,
            ..Self::default()
        }
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn into_attributes(self) -> AttributeMap {
        self.attributes
    }

    pub fn set_attribute(&mut self, id: AttributeId, value: DataElement) {
        self.attributes.insert(id, value);
    }
}

impl Response for ServiceAttributeResponse {
    fn complete(&self) -> bool {
        !self.reassembly.is_pending()
    }

    fn continuation_state(&self) -> &[u8] {
        &self.reassembly.continuation_state
    }

    fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus> {
        if self.complete() && !self.attributes.is_empty() {
            return Err(Error::NotReady);
        }

        match self.reassembly.feed(buf)? {
            None => Ok(ParseStatus::Continuing),
            Some(list) => {
                self.attributes = read_attribute_list(&list, self.ordering)?;
                Ok(ParseStatus::Complete)
            }
        }
    }

    fn get_pdu(
        &self,
        req_max: u16,
        tid: TransactionId,
        max_size: u16,
        cont_state: &[u8],
    ) -> Option<Bytes> {
        attribute_list_pdu(
            PduId::ServiceAttributeResponse,
            &attribute_list_element(&self.attributes),
            req_max,
            tid,
            max_size,
            cont_state,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSearchAttributeResponse {
    attribute_lists: Vec<AttributeMap>,
    reassembly: Reassembly,
    ordering: AttributeOrdering,
}

impl ServiceSearchAttributeResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ordering(ordering: AttributeOrdering) -> Self {
        Self {
            ordering,
            ..Self::default()
        }
    }

    pub fn num_attribute_lists(&self) -> usize {
        self.attribute_lists.len()
    }

    pub fn attributes(&self, idx: usize) -> Option<&AttributeMap> {
        self.attribute_lists.get(idx)
    }

    pub fn attribute_lists(&self) -> &[AttributeMap] {
        &self.attribute_lists
    }

    pub fn into_attribute_lists(self) -> Vec<AttributeMap> {
        self.attribute_lists
    }

    /// Sets an attribute in the `idx`th list, adding empty lists as needed.
    pub fn set_attribute(&mut self, idx: usize, id: AttributeId, value: DataElement) {
        if self.attribute_lists.len() <= idx {
            self.attribute_lists.resize_with(idx + 1, AttributeMap::new);
        }
        self.attribute_lists[idx].insert(id, value);
    }

    pub fn push_attribute_list(&mut self, attributes: AttributeMap) {
        self.attribute_lists.push(attributes);
    }
}

impl Response for ServiceSearchAttributeResponse {
    fn complete(&self) -> bool {
        !self.reassembly.is_pending()
    }

    fn continuation_state(&self) -> &[u8] {
        &self.reassembly.continuation_state
    }

    fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus> {
        if self.complete() && !self.attribute_lists.is_empty() {
            return Err(Error::NotReady);
        }

        let list = match self.reassembly.feed(buf)? {
            None => return Ok(ParseStatus::Continuing),
            Some(list) => list,
        };

        let (element, used) = DataElement::read(&list)?;
        if used != list.len() {
            return Err(Error::PacketMalformed);
        }
        let lists = match element {
            DataElement::Sequence(lists) => lists,
            _ => return Err(Error::PacketMalformed),
        };

        let mut attribute_lists = Vec::with_capacity(lists.len());
        for list in lists {
            match list {
                DataElement::Sequence(items) => {
                    attribute_lists.push(attribute_map_from_pairs(items, self.ordering)?)
                }
                _ => return Err(Error::PacketMalformed),
            }
        }

        self.attribute_lists = attribute_lists;
        Ok(ParseStatus::Complete)
    }

    fn get_pdu(
        &self,
        req_max: u16,
        tid: TransactionId,
        max_size: u16,
        cont_state: &[u8],
    ) -> Option<Bytes> {
        let list = DataElement::Sequence(
            self.attribute_lists
                .iter()
                .map(attribute_list_element)
                .collect(),
        );
        attribute_list_pdu(
            PduId::ServiceSearchAttributeResponse,
            &list,
            req_max,
            tid,
            max_size,
            cont_state,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    error_code: Option<ErrorCode>,
}

impl ErrorResponse {
    pub fn new(error_code: ErrorCode) -> Self {
        Self {
            error_code: Some(error_code),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }
}

impl Response for ErrorResponse {
    fn complete(&self) -> bool {
        self.error_code.is_some()
    }

    fn continuation_state(&self) -> &[u8] {
        &[]
    }

    fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus> {
        if self.complete() {
            return Err(Error::NotReady);
        }
        if buf.len() != 2 {
            return Err(Error::PacketMalformed);
        }

        let mut cursor = buf;
        self.error_code = Some(ErrorCode::from_buf(&mut cursor).ok_or(Error::PacketMalformed)?);
        Ok(ParseStatus::Complete)
    }

    fn get_pdu(
        &self,
        _req_max: u16,
        tid: TransactionId,
        _max_size: u16,
        _cont_state: &[u8],
    ) -> Option<Bytes> {
        let code = self.error_code?;
        let mut params = BytesMut::with_capacity(2);
        params.put_u16(code as u16);
        Some(Pdu::new(PduId::ErrorResponse, tid, params.freeze()).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::discovery::serialization::PduHeader;

    fn ids(ranges: &AttributeRanges) -> Vec<(u16, u16)> {
        ranges.iter().map(|r| (r.start.0, r.end.0)).collect()
    }

    /// Strips the header off a PDU, checking its id and length.
    fn params(pdu: &Bytes, id: PduId) -> &[u8] {
        let mut buf = &pdu[..];
        let header = PduHeader::from_buf(&mut buf).unwrap();
        assert_eq!(header.pdu_id(), Some(id));
        assert_eq!(header.parameter_length as usize, buf.len());
        buf
    }

    /// Drives a response through its continuations as a client would.
    fn transfer<R: Response>(
        sent: &R,
        received: &mut R,
        id: PduId,
        max_size: u16,
    ) -> usize {
        let mut cont = vec![];
        let mut fragments = 0;
        loop {
            let pdu = sent.get_pdu(u16::MAX, 1, max_size, &cont).unwrap();
            assert!(pdu.len() <= max_size as usize);
            fragments += 1;
            match received.parse(params(&pdu, id)).unwrap() {
                ParseStatus::Complete => {
                    assert!(received.complete());
                    assert!(received.continuation_state().is_empty());
                    return fragments;
                }
                ParseStatus::Continuing => {
                    assert!(!received.complete());
                    cont = received.continuation_state().to_vec();
                    assert!(!cont.is_empty());
                }
            }
        }
    }

    #[test]
    pub fn ranges_merge_overlapping_and_adjacent() {
        let mut ranges = AttributeRanges::new();
        ranges.add_attribute(AttributeId(1));
        ranges.add_attribute(AttributeId(2));
        ranges.add_attribute(AttributeId(0));
        assert_eq!(ids(&ranges), vec![(0, 2)]);

        ranges.add_range(AttributeId(5), AttributeId(7));
        ranges.add_attribute(AttributeId(9));
        assert_eq!(ids(&ranges), vec![(0, 2), (5, 7), (9, 9)]);

        ranges.add_attribute(AttributeId(8));
        assert_eq!(ids(&ranges), vec![(0, 2), (5, 9)]);

        ranges.add_range(AttributeId(3), AttributeId(4));
        assert_eq!(ids(&ranges), vec![(0, 9)]);

        ranges.add_range(AttributeId(0xFFF0), AttributeId(0xFFFF));
        ranges.add_range(AttributeId(9), AttributeId(3));
        assert_eq!(ids(&ranges), vec![(0, 9), (0xFFF0, 0xFFFF)]);
        assert!(ranges.contains(AttributeId(0xFFFF)));
        assert!(!ranges.contains(AttributeId(10)));
    }

    #[test]
    pub fn search_request_parses_known_bytes() {
        let bytes = [
            0x35, 0x03, 0x19, 0x01, 0x00, // pattern: L2CAP
            0x00, 0x10, // max 16 records
            0x02, 0xab, 0xcd, // continuation
        ];
        let request = ServiceSearchRequest::parse(&bytes).unwrap();
        assert!(request.valid());
        assert_eq!(request.max_service_record_count(), 16);
        assert!(request
            .service_search_pattern()
            .contains(&Uuid::from_u16(0x0100)));
        assert_eq!(request.continuation_state(), &[0xab, 0xcd]);

        let pdu = request.get_pdu(0x4142).unwrap();
        assert_eq!(params(&pdu, PduId::ServiceSearchRequest), &bytes[..]);
    }

    #[test]
    pub fn search_request_rejects_bad_fields() {
        // no records wanted
        assert!(
            ServiceSearchRequest::parse(&[0x35, 0x03, 0x19, 0x01, 0x00, 0x00, 0x00, 0x00]).is_err()
        );
        // empty pattern
        assert!(ServiceSearchRequest::parse(&[0x35, 0x00, 0x00, 0x01, 0x00]).is_err());
        // pattern entry is not a uuid
        assert!(ServiceSearchRequest::parse(&[0x35, 0x02, 0x08, 0x01, 0x00, 0x01, 0x00]).is_err());
        // continuation length runs past the end
        let trailing = [0x35, 0x03, 0x19, 0x01, 0x00, 0x00, 0x01, 0x02, 0xff];
        assert!(ServiceSearchRequest::parse(&trailing).is_err());
        // continuation longer than sixteen bytes
        let mut bytes = vec![0x35, 0x03, 0x19, 0x01, 0x00, 0x00, 0x01, 17];
        bytes.extend_from_slice(&[0u8; 17]);
        assert!(ServiceSearchRequest::parse(&bytes).is_err());
    }

    #[test]
    pub fn search_pattern_size_limit() {
        let uuids = |n: u16| (0..n).map(|i| Uuid::from_u16(0x1100 + i)).collect::<Vec<_>>();

        let mut request = ServiceSearchRequest::new();
        request.set_search_pattern(uuids(12));
        assert!(request.valid());
        let pdu = request.get_pdu(1).unwrap();
        let parsed =
            ServiceSearchRequest::parse(params(&pdu, PduId::ServiceSearchRequest)).unwrap();
        assert_eq!(parsed.service_search_pattern().len(), 12);

        request.set_search_pattern(uuids(13));
        assert!(!request.valid());
        assert!(request.get_pdu(1).is_none());

        // thirteen on the wire is refused too
        let element = DataElement::Sequence(uuids(13).into_iter().map(DataElement::Uuid).collect());
        let mut bytes = BytesMut::new();
        element.to_buf(&mut bytes);
        bytes.put_u16(1);
        bytes.put_u8(0);
        assert!(ServiceSearchRequest::parse(&bytes).is_err());

        request.set_search_pattern(vec![]);
        assert!(!request.valid());
    }

    #[test]
    pub fn attribute_request_fields() {
        let mut request = ServiceAttributeRequest::new();
        assert_eq!(request.max_attribute_byte_count(), 0xFFFF);
        assert!(!request.valid());

        request.set_service_record_handle(0xEEEE_0000);
        request.add_attribute(AttributeId(0xF00D));
        request.add_attribute_range(AttributeId(0x0000), AttributeId(0x0002));
        assert!(request.valid());

        let pdu = request.get_pdu(7).unwrap();
        let parsed =
            ServiceAttributeRequest::parse(params(&pdu, PduId::ServiceAttributeRequest)).unwrap();
        assert_eq!(parsed, request);

        request.set_max_attribute_byte_count(6);
        assert!(!request.valid());
        request.set_max_attribute_byte_count(MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT);
        assert!(request.valid());
    }

    #[test]
    pub fn attribute_request_rejects_bad_id_lists() {
        let head = [0x00u8, 0x01, 0x00, 0x00, 0x00, 0x10];
        let parse = |list: &[u8]| {
            let mut bytes = head.to_vec();
            bytes.extend_from_slice(list);
            bytes.push(0x00);
            ServiceAttributeRequest::parse(&bytes)
        };

        assert!(parse(&[0x35, 0x03, 0x09, 0x00, 0x01]).is_ok());
        // empty list
        assert!(parse(&[0x35, 0x00]).is_err());
        // 8-bit id
        assert!(parse(&[0x35, 0x02, 0x08, 0x01]).is_err());
        // backwards range
        assert!(parse(&[0x35, 0x05, 0x0a, 0x00, 0x02, 0x00, 0x01]).is_err());

        // byte count below the minimum
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x35, 0x03, 0x09, 0x00, 0x01, 0x00];
        assert!(ServiceAttributeRequest::parse(&bytes).is_err());
    }

    #[test]
    pub fn search_attribute_request_round_trip() {
        let mut request = ServiceSearchAttributeRequest::new();
        request.set_search_pattern(vec![Uuid::from_u16(0x110B)]);
        request.add_attribute_range(AttributeId(0x0000), AttributeId(0xFFFF));
        request.set_max_attribute_byte_count(0x00F0);
        assert!(request.set_continuation_state(&[1, 2, 3, 4]));
        assert!(!request.set_continuation_state(&[0u8; 17]));

        let pdu = request.get_pdu(0x0102).unwrap();
        let body = params(&pdu, PduId::ServiceSearchAttributeRequest);
        let parsed = ServiceSearchAttributeRequest::parse(body).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.continuation_state(), &[1, 2, 3, 4]);
    }

    #[test]
    pub fn search_response_splits_across_pdus() {
        let handles: Vec<ServiceHandle> = (0x10000..0x10020).collect();
        let mut sent = ServiceSearchResponse::new();
        sent.set_service_record_handles(handles.clone());
        assert!(sent.complete());

        let mut received = ServiceSearchResponse::new();
        // room for four handles per PDU with a continuation
        let fragments = transfer(&sent, &mut received, PduId::ServiceSearchResponse, 28);
        assert_eq!(fragments, 8);
        assert!(received.complete());
        assert_eq!(received.service_record_handles(), &handles[..]);

        assert_eq!(received.parse(&[0, 0, 0, 0, 0]), Err(Error::NotReady));
    }

    #[test]
    pub fn search_response_limits() {
        let mut sent = ServiceSearchResponse::new();
        sent.set_service_record_handles(vec![1, 2, 3]);

        // limited by the request
        let pdu = sent.get_pdu(2, 1, 672, &[]).unwrap();
        assert_eq!(
            params(&pdu, PduId::ServiceSearchResponse),
            &[0, 2, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2, 0]
        );

        // continuation must be two bytes and inside the results
        assert!(sent.get_pdu(10, 1, 672, &[0]).is_none());
        assert!(sent.get_pdu(10, 1, 672, &[0, 3]).is_none());
        assert!(sent.get_pdu(10, 1, 672, &[0, 2]).is_some());
        // no room for a single handle
        assert!(sent.get_pdu(10, 1, 11, &[]).is_none());
    }

    #[test]
    pub fn search_response_rejects_malformed() {
        let mut response = ServiceSearchResponse::new();
        assert_eq!(response.parse(&[0, 1, 0]), Err(Error::PacketMalformed));
        // says one handle, carries none
        assert_eq!(response.parse(&[0, 1, 0, 1, 0]), Err(Error::PacketMalformed));
        // trailing bytes after continuation
        assert_eq!(
            response.parse(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0xff]),
            Err(Error::PacketMalformed)
        );
        // ends without a continuation while a handle is still owed
        assert_eq!(
            response.parse(&[0, 2, 0, 1, 0, 0, 0, 1, 0]),
            Err(Error::PacketMalformed)
        );
        assert_eq!(response.parse(&[0, 1, 0, 1, 0, 0, 0, 1, 0]), Ok(ParseStatus::Complete));
        assert_eq!(response.service_record_handles(), &[1]);
    }

    #[test]
    pub fn attribute_response_splits_across_pdus() {
        let mut sent = ServiceAttributeResponse::new();
        sent.set_attribute(AttributeId(0x0000), DataElement::Uint32(0x0001_0000));
        sent.set_attribute(AttributeId(0x0100), DataElement::from("x".repeat(300)));
        sent.set_attribute(
            AttributeId(0x0001),
            DataElement::Sequence(vec![DataElement::Uuid(Uuid::from_u16(0x110B))]),
        );

        let mut received = ServiceAttributeResponse::new();
        let fragments = transfer(&sent, &mut received, PduId::ServiceAttributeResponse, 48);
        assert!(fragments > 1);
        assert!(received.complete());
        assert_eq!(received.attributes(), sent.attributes());
        assert_eq!(received.continuation_state(), &[] as &[u8]);
    }

    #[test]
    pub fn attribute_response_rejects_foreign_continuation() {
        let mut sent = ServiceAttributeResponse::new();
        sent.set_attribute(AttributeId(0x0000), DataElement::Uint32(1));
        assert!(sent.get_pdu(0xFFFF, 1, 672, &[0, 0, 0, 1]).is_some());
        assert!(sent.get_pdu(0xFFFF, 1, 672, &[0, 0, 1, 0]).is_none());
        assert!(sent.get_pdu(0xFFFF, 1, 672, &[0, 0]).is_none());
        assert!(sent.get_pdu(0xFFFF, 1, 8, &[]).is_none());
    }

    #[test]
    pub fn attribute_response_respects_request_maximum() {
        let mut sent = ServiceAttributeResponse::new();
        sent.set_attribute(AttributeId(0x0100), DataElement::from("y".repeat(40)));

        let pdu = sent.get_pdu(MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT, 1, 672, &[]).unwrap();
        let params = params(&pdu, PduId::ServiceAttributeResponse);
        assert_eq!(&params[..2], &[0, 3]);
        assert_eq!(params[5], 4);
    }

    fn attribute_list_params(items: Vec<DataElement>) -> Vec<u8> {
        let mut list = BytesMut::new();
        DataElement::Sequence(items).to_buf(&mut list);
        let mut params: Vec<u8> = vec![];
        params.put_u16(list.len() as u16);
        params.extend_from_slice(&list);
        params.push(0);
        params
    }

    #[test]
    pub fn attribute_response_ordering() {
        let out_of_order = attribute_list_params(vec![
            DataElement::Uint16(0x0002),
            DataElement::Bool(true),
            DataElement::Uint16(0x0001),
            DataElement::Bool(false),
        ]);

        let mut strict = ServiceAttributeResponse::new();
        assert_eq!(strict.parse(&out_of_order), Err(Error::PacketMalformed));

        let mut lenient = ServiceAttributeResponse::with_ordering(AttributeOrdering::Lenient);
        assert_eq!(lenient.parse(&out_of_order), Ok(ParseStatus::Complete));
        assert_eq!(lenient.attributes().len(), 2);

        let duplicate = attribute_list_params(vec![
            DataElement::Uint16(0x0001),
            DataElement::Bool(true),
            DataElement::Uint16(0x0001),
            DataElement::Bool(false),
        ]);
        let mut lenient = ServiceAttributeResponse::with_ordering(AttributeOrdering::Lenient);
        assert_eq!(lenient.parse(&duplicate), Err(Error::PacketMalformed));
    }

    #[test]
    pub fn attribute_response_rejects_bad_pairs() {
        let missing_value = attribute_list_params(vec![DataElement::Uint16(0x0001)]);
        assert_eq!(
            ServiceAttributeResponse::new().parse(&missing_value),
            Err(Error::PacketMalformed)
        );

        let bad_id = attribute_list_params(vec![DataElement::Uint32(1), DataElement::Nil]);
        assert_eq!(
            ServiceAttributeResponse::new().parse(&bad_id),
            Err(Error::PacketMalformed)
        );

        let mut complete = ServiceAttributeResponse::new();
        let good = attribute_list_params(vec![DataElement::Uint16(1), DataElement::Nil]);
        assert_eq!(complete.parse(&good), Ok(ParseStatus::Complete));
        assert_eq!(complete.parse(&good), Err(Error::NotReady));
    }

    #[test]
    pub fn attribute_response_reassembly_is_bounded() {
        let mut fragment: Vec<u8> = vec![];
        fragment.put_u16(65_000);
        fragment.extend_from_slice(&vec![0u8; 65_000]);
        fragment.extend_from_slice(&[4, 0, 0, 0, 1]);

        let mut response = ServiceAttributeResponse::new();
        for _ in 0..10 {
            assert_eq!(response.parse(&fragment), Ok(ParseStatus::Continuing));
            assert!(!response.complete());
        }
        assert_eq!(response.parse(&fragment), Err(Error::NotSupported));
    }

    #[test]
    pub fn search_attribute_response_round_trip() {
        let mut sent = ServiceSearchAttributeResponse::new();
        sent.set_attribute(0, AttributeId(0x0000), DataElement::Uint32(0x10000));
        sent.set_attribute(1, AttributeId(0x0000), DataElement::Uint32(0x10001));
        sent.set_attribute(1, AttributeId(0x0003), DataElement::Uuid(Uuid::from_u128(42)));
        assert_eq!(sent.num_attribute_lists(), 2);

        let mut received = ServiceSearchAttributeResponse::new();
        transfer(&sent, &mut received, PduId::ServiceSearchAttributeResponse, 20);
        assert_eq!(received.num_attribute_lists(), 2);
        assert_eq!(received.attributes(1), sent.attributes(1));
        assert_eq!(received.attributes(2), None);
    }

    #[test]
    pub fn error_response() {
        let sent = ErrorResponse::new(ErrorCode::InvalidRequestSyntax);
        let pdu = sent.get_pdu(0, 0x0d0d, 0, &[]).unwrap();
        assert_eq!(&pdu[..], &[0x01, 0x0d, 0x0d, 0x00, 0x02, 0x00, 0x03]);

        let mut received = ErrorResponse::default();
        assert!(!received.complete());
        assert_eq!(received.parse(&[0x00]), Err(Error::PacketMalformed));
        assert_eq!(received.parse(&[0x00, 0x09]), Err(Error::PacketMalformed));
        assert_eq!(received.parse(&pdu[5..]), Ok(ParseStatus::Complete));
        assert_eq!(received.error_code(), Some(ErrorCode::InvalidRequestSyntax));
        assert_eq!(received.parse(&pdu[5..]), Err(Error::NotReady));
    }
}
