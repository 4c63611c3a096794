//! Sub-protocol version lists, as in `proto` and `pr` lines

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{DocumentParseError, ErrorContext};

//
// External dependencies
//
use strum::{EnumString, IntoStaticStr};

/// A Tor sub-protocol
#[derive(Debug, Clone, Copy, EnumString, IntoStaticStr, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub enum Protocol {
    Conflux,
    Cons,
    Desc,
    DirCache,
    FlowCtrl,
    HSDir,
    HSIntro,
    HSRend,
    Link,
    LinkAuth,
    Microdesc,
    Padding,
    Relay,
}

/// The set of versions of one sub-protocol that a relay supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedProtocolVersion {
    versions: Vec<u8>,
}

impl SupportedProtocolVersion {
    pub fn supports(&self, v: u8) -> bool {
        self.versions.contains(&v)
    }

    pub fn versions(&self) -> &[u8] {
        &self.versions
    }
}

impl fmt::Display for SupportedProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ranges: Vec<(u8, u8)> = Vec::new();
        for v in self.versions.iter().copied() {
            match ranges.last_mut() {
                Some((_, end)) if *end as u16 + 1 == v as u16 => *end = v,
                _ => ranges.push((v, v)),
            }
        }
        let rendered: Vec<String> = ranges
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

impl FromStr for SupportedProtocolVersion {
    type Err = DocumentParseError;

    /// Parse from "3", "2-5" or "1,3-4".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut versions = Vec::new();
        for component in s.split(',').filter(|c| !c.is_empty()) {
            match component.split_once('-') {
                Some((min, max)) => {
                    let min = min.parse::<u8>().context("protocol version (from)")?;
                    let max = max.parse::<u8>().context("protocol version (to)")?;
                    if min > max {
                        return Err(DocumentParseError::InvalidProtocolVersion { raw: s.to_string() });
                    }
                    versions.extend(min..=max);
                }
                None => versions.push(component.parse::<u8>().context("protocol version")?),
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(SupportedProtocolVersion { versions })
    }
}

/// Parsed `Name=versions` entries.
///
/// Names this crate doesn't know are kept apart, as `Name=versions`, so
/// they can be reported as unrecognized values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolList {
    pub known: BTreeMap<Protocol, SupportedProtocolVersion>,
    pub unknown: Vec<String>,
}

impl ProtocolList {
    pub fn get(&self, protocol: Protocol) -> Option<&SupportedProtocolVersion> {
        self.known.get(&protocol)
    }

    pub fn supports(&self, protocol: Protocol, version: u8) -> bool {
        self.get(protocol).map_or(false, |v| v.supports(version))
    }
}

impl FromStr for ProtocolList {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut list = ProtocolList::default();
        for entry in s.split_whitespace() {
            let (name, versions) = entry
                .split_once('=')
                .ok_or_else(|| DocumentParseError::InvalidArgumentDict { raw: entry.to_string() })?;
            let versions = versions
                .parse::<SupportedProtocolVersion>()
                .map_err(|_| DocumentParseError::InvalidProtocolVersion {
                    raw: entry.to_string(),
                })?;
            match name.parse::<Protocol>() {
                Ok(protocol) => {
                    list.known.insert(protocol, versions);
                }
                Err(_) => list.unknown.push(entry.to_string()),
            }
        }
        Ok(list)
    }
}
