//! Ownership translation for rootless operation.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A contiguous range of ids: `container_id..container_id+size` on disk
/// corresponds to `host_id..host_id+size` in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    fn to_host(self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset >= self.size {
            return None;
        }
        self.host_id.checked_add(offset)
    }
}

/// Parses `container:host:size`, the form used on the command line.
impl FromStr for IdMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        let [container_id, host_id, size] = fields.as_slice() else {
            return Err(Error::Invalid(format!(
                "id mapping '{s}' is not of the form container:host:size"
            )));
        };
        let parse = |field: &str| {
            field
                .parse::<u32>()
                .map_err(|e| Error::Invalid(format!("id mapping '{s}': {e}")))
        };
        Ok(Self {
            container_id: parse(*container_id)?,
            host_id: parse(*host_id)?,
            size: parse(*size)?,
        })
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

/// Translates `id` through `mappings`. An empty table is the identity.
pub fn map_id(mappings: &[IdMapping], id: u32) -> Result<u32> {
    if mappings.is_empty() {
        return Ok(id);
    }
    mappings
        .iter()
        .find_map(|m| m.to_host(id))
        .ok_or_else(|| Error::Invalid(format!("id {id} is not covered by any mapping")))
}

/// How ownership on disk relates to ownership in generated layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Running without privileges: unreadable metadata is skipped, not fatal.
    pub rootless: bool,
}

impl MapOptions {
    pub fn host_uid(&self, uid: u32) -> Result<u32> {
        map_id(&self.uid_mappings, uid)
    }

    pub fn host_gid(&self, gid: u32) -> Result<u32> {
        map_id(&self.gid_mappings, gid)
    }
}
