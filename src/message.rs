use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::dictionary::GroupSpec;
use crate::error::{DecodeError, RejectError};
use crate::protocol::{self, msg_type, tags};

/// An ordered collection of `tag=value` fields.
///
/// Insertion order is preserved; setting an existing tag replaces its value
/// in place. Values are raw bytes — FIX values are opaque except that they
/// never contain SOH.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: Vec<(u32, Vec<u8>)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing in place if the tag is already present.
    pub fn set_field(&mut self, tag: u32, value: impl Into<Vec<u8>>) -> &mut Self {
        let value = value.into();
        match self.fields.iter_mut().find(|(t, _)| *t == tag) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((tag, value)),
        }
        self
    }

    /// Append a field even when the tag is already present. Repeating
    /// groups rely on duplicate tags within one partition.
    pub fn append_field(&mut self, tag: u32, value: impl Into<Vec<u8>>) -> &mut Self {
        self.fields.push((tag, value.into()));
        self
    }

    pub fn set_string(&mut self, tag: u32, value: &str) -> &mut Self {
        self.set_field(tag, value.as_bytes().to_vec())
    }

    pub fn set_int(&mut self, tag: u32, value: u64) -> &mut Self {
        self.set_field(tag, value.to_string().into_bytes())
    }

    /// Set a boolean field as `Y` or `N`.
    pub fn set_bool(&mut self, tag: u32, value: bool) -> &mut Self {
        self.set_field(tag, if value { b"Y".to_vec() } else { b"N".to_vec() })
    }

    pub fn get_raw(&self, tag: u32) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn has(&self, tag: u32) -> bool {
        self.fields.iter().any(|(t, _)| *t == tag)
    }

    pub fn remove(&mut self, tag: u32) {
        self.fields.retain(|(t, _)| *t != tag);
    }

    pub fn get_string(&self, tag: u32) -> Result<String, RejectError> {
        let raw = self
            .get_raw(tag)
            .ok_or_else(|| RejectError::required_tag_missing(tag))?;
        String::from_utf8(raw.to_vec()).map_err(|_| RejectError::incorrect_data_format(tag))
    }

    pub fn get_int(&self, tag: u32) -> Result<u64, RejectError> {
        let s = self.get_string(tag)?;
        s.parse()
            .map_err(|_| RejectError::incorrect_data_format(tag))
    }

    /// Sequence numbers are bounded to `u32` in this engine.
    pub fn get_seq_num(&self, tag: u32) -> Result<u32, RejectError> {
        let s = self.get_string(tag)?;
        s.parse()
            .map_err(|_| RejectError::incorrect_data_format(tag))
    }

    pub fn get_bool(&self, tag: u32) -> Result<bool, RejectError> {
        match self.get_raw(tag) {
            Some(b"Y") => Ok(true),
            Some(b"N") => Ok(false),
            Some(_) => Err(RejectError::incorrect_data_format(tag)),
            None => Err(RejectError::required_tag_missing(tag)),
        }
    }

    /// Parse a UTCTimestamp value (`YYYYMMDD-HH:MM:SS` with optional
    /// fractional seconds up to nanoseconds).
    pub fn get_utc_timestamp(&self, tag: u32) -> Result<DateTime<Utc>, RejectError> {
        let s = self.get_string(tag)?;
        NaiveDateTime::parse_from_str(&s, "%Y%m%d-%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| RejectError::incorrect_data_format(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.fields.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// A FIX message as three ordered field partitions plus the raw wire bytes
/// it was decoded from, when it came off the wire.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: FieldMap,
    pub body: FieldMap,
    pub trailer: FieldMap,
    raw: Option<Bytes>,
}

impl Message {
    pub fn new(msg_type: &str) -> Self {
        let mut msg = Self::default();
        msg.header.set_string(tags::MSG_TYPE, msg_type);
        msg
    }

    pub fn msg_type(&self) -> Result<String, RejectError> {
        self.header.get_string(tags::MSG_TYPE)
    }

    /// True for the seven session-level administrative message types.
    pub fn is_admin(&self) -> bool {
        match self.header.get_raw(tags::MSG_TYPE) {
            Some(mt) => msg_type::is_admin(mt),
            None => false,
        }
    }

    /// Original wire bytes, present only on decoded inbound messages.
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    pub(crate) fn set_raw(&mut self, raw: Bytes) {
        self.raw = Some(raw);
    }

    /// Serialize with freshly computed BodyLength and CheckSum.
    pub fn to_bytes(&self) -> Result<BytesMut, DecodeError> {
        protocol::encode(self)
    }

    /// Materialize the elements of a repeating group out of the body.
    ///
    /// Returns one [`FieldMap`] per element, or an error when the declared
    /// count disagrees with the fields actually present.
    pub fn read_group(&self, spec: &GroupSpec) -> Result<Vec<FieldMap>, DecodeError> {
        let declared = match self.body.get_raw(spec.count_tag) {
            Some(v) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| {
                    DecodeError::Invalid(format!("group count tag {} not numeric", spec.count_tag))
                })?,
            None => return Ok(Vec::new()),
        };

        let mut elements: Vec<FieldMap> = Vec::with_capacity(declared);
        let mut in_group = false;
        for (tag, value) in self.body.iter() {
            if tag == spec.count_tag {
                in_group = true;
                continue;
            }
            if !in_group {
                continue;
            }
            if tag == spec.delimiter {
                elements.push(FieldMap::new());
            } else if !spec.contains(tag) {
                break;
            }
            match elements.last_mut() {
                Some(element) => {
                    element.set_field(tag, value.to_vec());
                }
                None => {
                    return Err(DecodeError::Invalid(format!(
                        "group {} does not start with delimiter {}",
                        spec.count_tag, spec.delimiter
                    )))
                }
            }
        }

        if elements.len() != declared {
            return Err(DecodeError::Invalid(format!(
                "group {} declares {} elements, found {}",
                spec.count_tag,
                declared,
                elements.len()
            )));
        }
        Ok(elements)
    }

    /// Append a repeating group to the body: count tag, then each element's
    /// fields with the delimiter leading.
    pub fn set_group(&mut self, spec: &GroupSpec, elements: &[FieldMap]) {
        self.body.set_int(spec.count_tag, elements.len() as u64);
        for element in elements {
            for (tag, value) in element.iter() {
                // within an element insertion order is kept as given
                self.body.append_field(tag, value.to_vec());
            }
        }
    }
}

impl PartialEq for Message {
    /// Raw bytes are excluded: a decoded message equals the message that
    /// produced it even though only one side carries the original frame.
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body && self.trailer == other.trailer
    }
}
