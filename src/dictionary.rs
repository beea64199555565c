//! Read-only dictionary view the codec and session depend on.
//!
//! A full engine generates these tables from the FIX data-dictionary XML;
//! the core only needs to know which tags live in the header and trailer,
//! which are mandatory, and how repeating groups are shaped.

use std::collections::{HashMap, HashSet};

/// Shape of one repeating group within a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// NumInGroup tag whose value is the element count.
    pub count_tag: u32,
    /// First tag of every element.
    pub delimiter: u32,
    /// All tags an element may carry, delimiter included.
    pub members: Vec<u32>,
}

impl GroupSpec {
    pub fn new(count_tag: u32, delimiter: u32, members: impl Into<Vec<u32>>) -> Self {
        let mut members = members.into();
        if !members.contains(&delimiter) {
            members.push(delimiter);
        }
        Self { count_tag, delimiter, members }
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.members.contains(&tag)
    }
}

/// What the session needs to know about the wire dialect.
pub trait Dictionary: Send + Sync {
    fn is_header_field(&self, tag: u32) -> bool;
    fn is_trailer_field(&self, tag: u32) -> bool;
    /// Tags every inbound message must carry in its header.
    fn required_header_tags(&self) -> &[u32];
    /// Tags every inbound message must carry in its trailer.
    fn required_trailer_tags(&self) -> &[u32];
    fn group(&self, msg_type: &str, count_tag: u32) -> Option<&GroupSpec>;
}

/// Session-layer dictionary for the FIX 4.x / FIXT.1.1 standard header and
/// trailer, with registerable repeating groups.
#[derive(Debug, Clone)]
pub struct StandardDictionary {
    header_tags: HashSet<u32>,
    trailer_tags: HashSet<u32>,
    required_header: Vec<u32>,
    required_trailer: Vec<u32>,
    groups: HashMap<(String, u32), GroupSpec>,
}

/// Standard header tags shared by FIX 4.0 through FIXT.1.1.
const HEADER_TAGS: &[u32] = &[
    8, 9, 35, 34, 43, 49, 50, 52, 56, 57, 90, 91, 97, 115, 116, 122, 128, 129, 142, 143, 144, 145,
    212, 213, 347, 369, 370, 627, 1128, 1129, 1137,
];

const TRAILER_TAGS: &[u32] = &[93, 89, 10];

impl StandardDictionary {
    pub fn new() -> Self {
        Self {
            header_tags: HEADER_TAGS.iter().copied().collect(),
            trailer_tags: TRAILER_TAGS.iter().copied().collect(),
            required_header: vec![8, 9, 35, 49, 56, 34, 52],
            required_trailer: vec![10],
            groups: HashMap::new(),
        }
    }

    /// Register a repeating group for a message type.
    pub fn add_group(&mut self, msg_type: &str, spec: GroupSpec) {
        self.groups.insert((msg_type.to_string(), spec.count_tag), spec);
    }
}

impl Default for StandardDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary for StandardDictionary {
    fn is_header_field(&self, tag: u32) -> bool {
        self.header_tags.contains(&tag)
    }

    fn is_trailer_field(&self, tag: u32) -> bool {
        self.trailer_tags.contains(&tag)
    }

    fn required_header_tags(&self) -> &[u32] {
        &self.required_header
    }

    fn required_trailer_tags(&self) -> &[u32] {
        &self.required_trailer
    }

    fn group(&self, msg_type: &str, count_tag: u32) -> Option<&GroupSpec> {
        self.groups.get(&(msg_type.to_string(), count_tag))
    }
}
