//! Version 2 hidden service descriptors.
//!
//! Unlike the other documents these describe an onion service rather than a
//! relay. The service signs them with its permanent key and publishes them
//! to relays with the HSDir flag, under an identifier derived from that key.

use std::net::IpAddr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::crypto::{sha1_fingerprint, DigestAlgorithm, RsaPublicKey};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SignatureError};
use crate::meta::{content_between, parse_timestamp, DescriptorLine, Document, Item, Object};
use crate::schema::{HIDDEN_SERVICE_DESCRIPTOR, INTRODUCTION_POINT};
use crate::unrecognized::Unrecognized;

//
// External dependencies
//
use chrono::{DateTime, Utc};
use log::debug;

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// RFC 4648 base32, lowercase and unpadded
fn base32_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for &byte in data {
        buffer = (buffer << 8) | byte as u64;
        bits_in_buffer += 8;
        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let index = ((buffer >> bits_in_buffer) & 0x1f) as usize;
            result.push(BASE32_ALPHABET[index] as char);
        }
    }
    if bits_in_buffer > 0 {
        let index = ((buffer << (5 - bits_in_buffer)) & 0x1f) as usize;
        result.push(BASE32_ALPHABET[index] as char);
    }
    result
}

/// Decode unpadded base32 of either case, dropping trailing partial bits
fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for c in text.bytes() {
        let value = match c.to_ascii_lowercase() {
            c @ b'a'..=b'z' => c - b'a',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value as u64;
        bits_in_buffer += 5;
        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            result.push((buffer >> bits_in_buffer) as u8);
        }
    }
    Some(result)
}

/// Base32 of a 20 byte digest, such as a descriptor id or secret id part
fn parse_digest32(item: &Item) -> Result<String, DocumentParseError> {
    let arg = item.arguments_or_empty();
    match base32_decode(arg) {
        Some(bytes) if bytes.len() == 20 && arg.len() == 32 => Ok(arg.to_ascii_lowercase()),
        _ => Err(DocumentParseError::shape(item.keyword, "32 base32 characters", item.arguments)),
    }
}

fn parse_protocol_versions(item: &Item) -> Result<Vec<u32>, DocumentParseError> {
    item.arguments_or_empty()
        .split(',')
        .map(|v| v.trim().parse::<u32>().context("protocol-versions"))
        .collect()
}

/// A relay that forwards introduction requests to the service
#[derive(Debug, Clone, PartialEq)]
pub struct IntroductionPoint {
    /// Base32 digest of the relay's identity key
    pub identifier: String,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub onion_key: Option<RsaPublicKey>,
    /// The service's key for this introduction point
    pub service_key: Option<RsaPublicKey>,
    /// `intro-authentication` type and data pairs
    pub authentication: Vec<(String, String)>,
    pub unrecognized: Unrecognized,
}

impl IntroductionPoint {
    fn from_items(items: &[Item], strictness: Strictness, skipped: &[String]) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&INTRODUCTION_POINT, strictness);
        asm.note_skipped(skipped);
        let mut point = IntroductionPoint {
            identifier: String::new(),
            address: None,
            port: None,
            onion_key: None,
            service_key: None,
            authentication: Vec::new(),
            unrecognized: Unrecognized::new(),
        };

        let total = items.len();
        for (index, item) in items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "introduction-point" => point.identifier = item.arguments_or_empty().to_string(),
                "ip-address" => {
                    let arg = item.arguments_or_empty();
                    point.address = asm.defer(
                        arg.parse::<IpAddr>()
                            .map_err(|_| DocumentParseError::InvalidIpAddress(arg.to_string())),
                    )?;
                }
                "onion-port" => {
                    point.port = asm.defer(item.arguments_or_empty().parse::<u16>().context("onion-port"))?
                }
                "onion-key" => {
                    point.onion_key = asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?
                }
                "service-key" => {
                    point.service_key = asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?
                }
                "intro-authentication" => {
                    if let Some((auth_type, data)) = item.arguments_or_empty().split_once(' ') {
                        point.authentication.push((auth_type.to_string(), data.trim().to_string()));
                    }
                }
                _ => {}
            }
        }

        point.unrecognized = asm.finish()?;
        Ok(point)
    }
}

/// A `rendezvous-service-descriptor` document.
///
/// Mandatory fields are `None` only when parsed permissively without them.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenServiceDescriptor {
    /// Base32 identifier the descriptor is stored under
    pub descriptor_id: Option<String>,
    pub version: Option<u32>,
    /// The service's long-term key, which its onion address is derived from
    pub permanent_key: Option<RsaPublicKey>,
    /// Base32 digest of the time period, descriptor cookie and replica
    pub secret_id_part: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Versions of the rendezvous protocol the service supports
    pub protocol_versions: Vec<u32>,
    /// Introduction points, encrypted when the service uses client authorization
    pub introduction_points_blob: Option<Object>,
    pub signature: Option<Object>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    pub signature_valid: Option<bool>,
}

impl HiddenServiceDescriptor {
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&HIDDEN_SERVICE_DESCRIPTOR, strictness);
        asm.note_skipped(&doc.skipped);
        let mut desc = HiddenServiceDescriptor {
            descriptor_id: None,
            version: None,
            permanent_key: None,
            secret_id_part: None,
            published: None,
            protocol_versions: Vec::new(),
            introduction_points_blob: None,
            signature: None,
            raw: doc.raw.to_string(),
            lines: doc.lines(),
            unrecognized: Unrecognized::new(),
            signature_valid: None,
        };

        let total = doc.items.len();
        for (index, item) in doc.items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "rendezvous-service-descriptor" => desc.descriptor_id = asm.defer(parse_digest32(item))?,
                "version" => {
                    desc.version = asm.defer(item.arguments_or_empty().parse::<u32>().context("version"))?
                }
                "permanent-key" => {
                    desc.permanent_key = asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?
                }
                "secret-id-part" => desc.secret_id_part = asm.defer(parse_digest32(item))?,
                "publication-time" => desc.published = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
                "protocol-versions" => {
                    if let Some(versions) = asm.defer(parse_protocol_versions(item))? {
                        desc.protocol_versions = versions;
                    }
                }
                "introduction-points" => desc.introduction_points_blob = item.object.clone(),
                "signature" => desc.signature = item.object.clone(),
                _ => {}
            }
        }

        desc.unrecognized = asm.finish()?;
        debug!(
            "assembled hidden service descriptor {}",
            desc.descriptor_id.as_deref().unwrap_or("<unnamed>")
        );
        Ok(desc)
    }

    /// First 10 bytes of the permanent key's SHA-1 digest
    pub fn permanent_id(&self) -> Option<[u8; 10]> {
        let digest = self.permanent_key.as_ref()?.fingerprint();
        let mut id = [0u8; 10];
        id.copy_from_slice(&digest.as_bytes()[..10]);
        Some(id)
    }

    /// The service's `.onion` address
    pub fn onion_address(&self) -> Option<String> {
        self.permanent_id().map(|id| format!("{}.onion", base32_encode(&id)))
    }

    /// Descriptor id derived from the permanent key and secret id part
    pub fn computed_descriptor_id(&self) -> Option<String> {
        let permanent_id = self.permanent_id()?;
        let secret = base32_decode(self.secret_id_part.as_deref()?)?;
        let mut input = permanent_id.to_vec();
        input.extend_from_slice(&secret);
        Some(base32_encode(sha1_fingerprint(&input).as_bytes()))
    }

    /// Decode the introduction points. Descriptors without any yield an
    /// empty list.
    pub fn introduction_points(&self, strictness: Strictness) -> Result<Vec<IntroductionPoint>, DocumentParseError> {
        let blob = match &self.introduction_points_blob {
            Some(blob) => blob.decode()?,
            None => return Ok(Vec::new()),
        };
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        if !blob.starts_with(b"introduction-point ") {
            return Err(DocumentParseError::EncryptedIntroductionPoints);
        }

        let text = std::str::from_utf8(&blob)?;
        let doc = Document::parse(text, strictness)?;
        let starts: Vec<usize> = doc
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.keyword == "introduction-point")
            .map(|(index, _)| index)
            .collect();

        let mut points = Vec::with_capacity(starts.len());
        for (n, start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(doc.items.len());
            let skipped: &[String] = if n == 0 { &doc.skipped } else { &[] };
            points.push(IntroductionPoint::from_items(&doc.items[*start..end], strictness, skipped)?);
        }
        Ok(points)
    }

    /// Text signed by `signature`
    pub fn signed_content(&self) -> Result<&str, DocumentParseError> {
        content_between(&self.raw, "rendezvous-service-descriptor", "\nsignature\n")
    }

    /// Check the descriptor id and the signature made with the permanent key.
    pub fn validate_signature(&self) -> Result<(), DocumentParseError> {
        let permanent_key = self
            .permanent_key
            .as_ref()
            .ok_or_else(|| SignatureError::MissingKey("hidden service descriptor (no permanent-key)".to_string()))?;

        if let (Some(declared), Some(computed)) = (&self.descriptor_id, self.computed_descriptor_id()) {
            if *declared != computed {
                return Err(SignatureError::DescriptorIdMismatch {
                    declared: declared.clone(),
                    computed,
                }
                .into());
            }
        }

        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| SignatureError::MalformedSignature("no signature".to_string()))?;
        let local = DigestAlgorithm::Sha1.digest(self.signed_content()?.as_bytes());
        permanent_key.verify_digest(&signature.decode()?, &local, "hidden service descriptor")?;
        Ok(())
    }
}

impl SignedDocument for HiddenServiceDescriptor {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}
