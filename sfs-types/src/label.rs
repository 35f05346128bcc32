//! Interned media labels.
//!
//! Storage nodes carry a textual label (`ssd`, `hdd`, a rack name). Goals
//! reference labels by name and the master compares them constantly while
//! balancing chunks, so labels are interned into `u16` handles. The
//! wildcard label `_` gets the highest possible handle, which makes it sort
//! after every concrete label; the matching code in the copies calculator
//! relies on that ordering.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

pub const WILDCARD_LABEL: &str = "_";
const WILDCARD_HANDLE: u16 = u16::MAX;
const MAX_LABEL_LENGTH: usize = 32;

struct LabelRegistry {
    handles: HashMap<String, u16>,
    names: HashMap<u16, String>,
    next_handle: u16,
}

impl LabelRegistry {
    fn new() -> Self {
        let mut registry = LabelRegistry {
            handles: HashMap::new(),
            names: HashMap::new(),
            next_handle: 1,
        };
        registry.handles.insert(WILDCARD_LABEL.to_string(), WILDCARD_HANDLE);
        registry.names.insert(WILDCARD_HANDLE, WILDCARD_LABEL.to_string());
        registry
    }

    fn intern(&mut self, label: &str) -> u16 {
        if let Some(&handle) = self.handles.get(label) {
            return handle;
        }
        let handle = self.next_handle;
        assert!(handle < WILDCARD_HANDLE, "media label space exhausted");
        self.next_handle += 1;
        self.handles.insert(label.to_string(), handle);
        self.names.insert(handle, label.to_string());
        handle
    }

    fn name(&self, handle: u16) -> Option<&str> {
        self.names.get(&handle).map(String::as_str)
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<LabelRegistry> = Mutex::new(LabelRegistry::new());
}

/// True if the string may be used as a media label.
pub fn is_label_valid(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LENGTH
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Interned handle of a storage node label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaLabel(u16);

impl MediaLabel {
    pub const WILDCARD: MediaLabel = MediaLabel(WILDCARD_HANDLE);

    pub fn new(label: &str) -> Result<Self, Error> {
        if !is_label_valid(label) {
            bail!("invalid media label '{}'", label);
        }
        Ok(MediaLabel(REGISTRY.lock().unwrap().intern(label)))
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_HANDLE
    }

    /// True if a part on a `self` labelled server satisfies a `target`
    /// label requirement.
    pub fn matches(&self, target: &MediaLabel) -> bool {
        target.is_wildcard() || self == target
    }
}

impl fmt::Display for MediaLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match REGISTRY.lock().unwrap().name(self.0) {
            Some(name) => f.write_str(name),
            None => write!(f, "label#{}", self.0),
        }
    }
}

impl std::str::FromStr for MediaLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        MediaLabel::new(s)
    }
}

impl Serialize for MediaLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MediaLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        MediaLabel::new(&name).map_err(serde::de::Error::custom)
    }
}
