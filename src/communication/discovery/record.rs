use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{trace, warn};

use super::serialization::DataElement;
use super::{AttributeId, AttributeMap, ServiceHandle};
use crate::communication::Uuid;

/// Selects which protocol descriptor list
/// [`add_protocol_descriptor`](ServiceRecord::add_protocol_descriptor)
/// appends to.
pub type ProtocolListId = u32;

/// The ProtocolDescriptorList attribute itself. Any other id names an entry
/// of the AdditionalProtocolDescriptorLists attribute.
pub const PRIMARY_PROTOCOL_LIST: ProtocolListId = ProtocolListId::MAX;

/// MIBenum of UTF-8, the only encoding records are published in.
const UTF8_ENCODING: u16 = 106;

/// Base used for language attributes once the primary base is taken.
const SECONDARY_LANGUAGE_BASE: u16 = 0x9000;

/// Minimum link security required of connections to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    Encrypted,
    Authenticated,
    SecureAuthenticated,
}

/// A service record: a handle and a set of attributes describing a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    handle: ServiceHandle,
    attributes: AttributeMap,
    additional_protocols: BTreeMap<ProtocolListId, Vec<DataElement>>,
    security_level: SecurityLevel,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRecord {
    /// An empty record with a random ServiceId.
    pub fn new() -> Self {
        let mut record = Self {
            handle: 0,
            attributes: AttributeMap::new(),
            additional_protocols: BTreeMap::new(),
            security_level: SecurityLevel::None,
        };
        record.set_attribute(AttributeId::SERVICE_ID, DataElement::Uuid(Uuid::new_v4()));
        record
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle
    }

    /// Sets the handle and the ServiceRecordHandle attribute with it.
    pub fn set_handle(&mut self, handle: ServiceHandle) {
        self.handle = handle;
        self.attributes
            .insert(AttributeId::SERVICE_RECORD_HANDLE, DataElement::Uint32(handle));
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn set_security_level(&mut self, level: SecurityLevel) {
        self.security_level = level;
    }

    pub fn set_attribute(&mut self, id: AttributeId, value: DataElement) {
        self.attributes.insert(id, value);
    }

    pub fn get_attribute(&self, id: AttributeId) -> Option<&DataElement> {
        self.attributes.get(&id)
    }

    pub fn has_attribute(&self, id: AttributeId) -> bool {
        self.attributes.contains_key(&id)
    }

    pub fn remove_attribute(&mut self, id: AttributeId) -> Option<DataElement> {
        self.attributes.remove(&id)
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Ids of the attributes present in `start..=end`.
    pub fn attributes_in_range(
        &self,
        start: AttributeId,
        end: AttributeId,
    ) -> BTreeSet<AttributeId> {
        if start > end {
            return BTreeSet::new();
        }
        self.attributes.range(start..=end).map(|(id, _)| *id).collect()
    }

    /// Whether every UUID in `uuids` appears somewhere in this record.
    pub fn find_uuid(&self, uuids: &BTreeSet<Uuid>) -> bool {
        if uuids.is_empty() {
            return true;
        }

        let mut found = HashSet::new();
        for value in self.attributes.values() {
            value.for_each_uuid(&mut |uuid| {
                if uuids.contains(&uuid) {
                    found.insert(uuid);
                }
            });
        }
        found.len() == uuids.len()
    }

    /// Records are only accepted by a server if they name at least one
    /// service class.
    pub fn is_registerable(&self) -> bool {
        self.has_attribute(AttributeId::SERVICE_CLASS_ID_LIST)
    }

    pub fn set_service_class_uuids(&mut self, classes: &[Uuid]) {
        let classes = classes.iter().copied().map(DataElement::Uuid).collect();
        self.set_attribute(AttributeId::SERVICE_CLASS_ID_LIST, DataElement::Sequence(classes));
    }

    /// Appends a protocol descriptor, `uuid` followed by `params`, to the
    /// list chosen by `list_id`. A sequence in `params` is flattened into the
    /// descriptor and `Nil` adds nothing.
    pub fn add_protocol_descriptor(
        &mut self,
        list_id: ProtocolListId,
        uuid: Uuid,
        params: DataElement,
    ) {
        let mut descriptor = vec![DataElement::Uuid(uuid)];
        match params {
            DataElement::Nil => {}
            DataElement::Sequence(items) => descriptor.extend(items),
            other => descriptor.push(other),
        }
        let descriptor = DataElement::Sequence(descriptor);

        if list_id == PRIMARY_PROTOCOL_LIST {
            let mut list = self.take_sequence(AttributeId::PROTOCOL_DESCRIPTOR_LIST);
            list.push(descriptor);
            self.set_attribute(AttributeId::PROTOCOL_DESCRIPTOR_LIST, DataElement::Sequence(list));
        } else {
            self.additional_protocols
                .entry(list_id)
                .or_default()
                .push(descriptor);

            let lists = self
                .additional_protocols
                .values()
                .map(|list| DataElement::Sequence(list.clone()))
                .collect();
            self.set_attribute(
                AttributeId::ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS,
                DataElement::Sequence(lists),
            );
        }
    }

    /// Appends a profile and its `major.minor` version to the
    /// BluetoothProfileDescriptorList.
    pub fn add_profile(&mut self, uuid: Uuid, major: u8, minor: u8) {
        let mut profiles = self.take_sequence(AttributeId::BLUETOOTH_PROFILE_DESCRIPTOR_LIST);
        profiles.push(DataElement::Sequence(vec![
            DataElement::Uuid(uuid),
            DataElement::Uint16(((major as u16) << 8) | minor as u16),
        ]));
        self.set_attribute(
            AttributeId::BLUETOOTH_PROFILE_DESCRIPTOR_LIST,
            DataElement::Sequence(profiles),
        );
    }

    /// Adds a name, description and provider in the language given by the
    /// two-letter ISO 639 `language_code`. Empty strings are left out.
    /// Returns `false` if all three are empty, the code is not two
    /// characters, or no free block of attribute ids is left.
    pub fn add_info(
        &mut self,
        language_code: &str,
        name: &str,
        description: &str,
        provider: &str,
    ) -> bool {
        if name.is_empty() && description.is_empty() && provider.is_empty() {
            warn!("refusing to add empty service info");
            return false;
        }

        let code: [u8; 2] = match language_code.as_bytes().try_into() {
            Ok(code) => code,
            Err(_) => {
                warn!("language code {:?} is not two characters", language_code);
                return false;
            }
        };

        let mut base = if self.has_attribute(AttributeId::LANGUAGE_BASE_ATTRIBUTE_ID_LIST) {
            AttributeId(SECONDARY_LANGUAGE_BASE)
        } else {
            AttributeId::PRIMARY_LANGUAGE_BASE
        };

        let (name_id, description_id, provider_id) = loop {
            let ids = (
                base.offset(AttributeId::SERVICE_NAME_OFFSET),
                base.offset(AttributeId::SERVICE_DESCRIPTION_OFFSET),
                base.offset(AttributeId::PROVIDER_NAME_OFFSET),
            );
            let (name_id, description_id, provider_id) = match ids {
                (Some(a), Some(b), Some(c)) => (a, b, c),
                _ => {
                    warn!("no free language base attribute ids");
                    return false;
                }
            };

            if !self.has_attribute(name_id)
                && !self.has_attribute(description_id)
                && !self.has_attribute(provider_id)
            {
                break (name_id, description_id, provider_id);
            }

            base = match base.offset(1) {
                Some(next) => next,
                None => return false,
            };
        };

        trace!("language {} uses attribute base {:?}", language_code, base);

        let mut bases = self.take_sequence(AttributeId::LANGUAGE_BASE_ATTRIBUTE_ID_LIST);
        bases.push(DataElement::Uint16(u16::from_be_bytes(code)));
        bases.push(DataElement::Uint16(UTF8_ENCODING));
        bases.push(DataElement::Uint16(base.0));
        self.set_attribute(
            AttributeId::LANGUAGE_BASE_ATTRIBUTE_ID_LIST,
            DataElement::Sequence(bases),
        );

        for (id, text) in [
            (name_id, name),
            (description_id, description),
            (provider_id, provider),
        ] {
            if !text.is_empty() {
                self.set_attribute(id, DataElement::from(text));
            }
        }

        true
    }

    /// Removes a sequence attribute so it can be extended; anything else
    /// stored under `id` is discarded.
    fn take_sequence(&mut self, id: AttributeId) -> Vec<DataElement> {
        match self.attributes.remove(&id) {
            Some(DataElement::Sequence(items)) => items,
            _ => vec![],
        }
    }
}
