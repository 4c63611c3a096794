//! Microdescriptors, the compact relay descriptors clients download.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::crypto::{DigestAlgorithm, RsaPublicKey};
use crate::descriptor::{FamilyMember, PortSummary};
use crate::error::DocumentParseError;
use crate::meta::{DescriptorLine, Document, Item};
use crate::protocol::ProtocolList;
use crate::schema::MICRODESCRIPTOR;
use crate::unrecognized::{Unrecognized, UnrecognizedKind};

//
// External dependencies
//
use log::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Microdescriptor {
    pub onion_key: Option<RsaPublicKey>,
    /// Base64 curve25519 key
    pub ntor_onion_key: Option<String>,
    pub or_addresses: Vec<SocketAddr>,
    pub family: Vec<FamilyMember>,
    pub exit_policy: PortSummary,
    pub exit_policy_v6: Option<PortSummary>,
    pub protocols: ProtocolList,
    /// Relay identities by key type, such as `ed25519` or `rsa1024`
    pub identifiers: BTreeMap<String, String>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
}

fn parse_or_address(item: &Item) -> Result<SocketAddr, DocumentParseError> {
    let arg = item.arguments_or_empty();
    arg.parse::<SocketAddr>()
        .map_err(|_| DocumentParseError::InvalidIpAddress(arg.to_string()))
}

impl Microdescriptor {
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&MICRODESCRIPTOR, strictness);
        asm.note_skipped(&doc.skipped);
        let mut micro = Microdescriptor {
            onion_key: None,
            ntor_onion_key: None,
            or_addresses: Vec::new(),
            family: Vec::new(),
            exit_policy: PortSummary::reject_all(),
            exit_policy_v6: None,
            protocols: ProtocolList::default(),
            identifiers: BTreeMap::new(),
            raw: doc.raw.to_string(),
            lines: doc.lines(),
            unrecognized: Unrecognized::new(),
        };

        let total = doc.items.len();
        for (index, item) in doc.items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "onion-key" => {
                    micro.onion_key = asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?
                }
                "ntor-onion-key" => micro.ntor_onion_key = item.arguments.map(String::from),
                "a" => {
                    if let Some(address) = asm.defer(parse_or_address(item))? {
                        micro.or_addresses.push(address);
                    }
                }
                "family" => {
                    let family = item
                        .arguments_or_empty()
                        .split_whitespace()
                        .map(FamilyMember::from_str)
                        .collect::<Result<Vec<_>, _>>();
                    if let Some(family) = asm.defer(family)? {
                        micro.family = family;
                    }
                }
                "p" => {
                    if let Some(policy) = asm.defer(item.arguments_or_empty().parse::<PortSummary>())? {
                        micro.exit_policy = policy;
                    }
                }
                "p6" => micro.exit_policy_v6 = asm.defer(item.arguments_or_empty().parse::<PortSummary>())?,
                "pr" => {
                    if let Some(protocols) = asm.defer(item.arguments_or_empty().parse::<ProtocolList>())? {
                        for unknown in &protocols.unknown {
                            asm.record(UnrecognizedKind::Value, format!("pr {}", unknown));
                        }
                        micro.protocols = protocols;
                    }
                }
                "id" => {
                    if let Some((key_type, identity)) = item.arguments_or_empty().split_once(' ') {
                        micro.identifiers.insert(key_type.to_string(), identity.trim().to_string());
                    }
                }
                _ => {}
            }
        }

        micro.unrecognized = asm.finish()?;
        debug!("assembled microdescriptor with {} lines", micro.lines.len());
        Ok(micro)
    }

    /// Unpadded base64 SHA-256 of the descriptor, as referenced by `m` lines
    /// of microdescriptor consensuses
    pub fn digest(&self) -> String {
        let content = match self.raw.find("onion-key") {
            Some(start) => &self.raw[start..],
            None => &self.raw,
        };
        base64::encode_config(
            DigestAlgorithm::Sha256.digest(content.as_bytes()),
            base64::STANDARD_NO_PAD,
        )
    }
}
