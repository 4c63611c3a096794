//! Network status documents, version 3: votes, consensuses and
//! microdescriptor consensuses.

pub mod authority;

use std::collections::BTreeMap;
use std::ops::Range;
use std::str::FromStr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::crypto::{digest_range, DigestAlgorithm};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SchemaViolation, SignatureError};
use crate::key_cert::KeyCertificate;
use crate::meta::{parse_timestamp, DescriptorLine, Document, Fingerprint, Item, Object};
use crate::protocol::ProtocolList;
use crate::router_status::{Flag, RouterStatusEntry, RouterStatusVersion};
use crate::schema::{Flavor, NETWORK_STATUS_V3_FOOTER, NETWORK_STATUS_V3_HEADER};
use crate::unrecognized::{Section, Unrecognized, UnrecognizedKind};

pub use authority::{DirectoryAuthority, SharedRandomness, SharedRandomnessCommitment};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};

/// Which kind of v3 network status document this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Vote,
    Consensus,
    MicrodescConsensus,
}

impl DocumentKind {
    fn flavor(self) -> Flavor {
        match self {
            DocumentKind::Vote => Flavor::Vote,
            DocumentKind::Consensus | DocumentKind::MicrodescConsensus => Flavor::Consensus,
        }
    }

    /// The format of the document's router status entries
    pub fn router_status_version(self) -> RouterStatusVersion {
        match self {
            DocumentKind::MicrodescConsensus => RouterStatusVersion::MicroV3,
            _ => RouterStatusVersion::V3,
        }
    }

    /// Guess the kind from the header without complaining; the header's
    /// own assembly reports malformed lines.
    fn detect(items: &[Item]) -> DocumentKind {
        let vote = items
            .iter()
            .find(|i| i.keyword == "vote-status")
            .map_or(false, |i| i.arguments == Some("vote"));
        let microdesc = items
            .iter()
            .find(|i| i.keyword == "network-status-version")
            .map_or(false, |i| i.arguments_or_empty().split_whitespace().nth(1) == Some("microdesc"));
        match (vote, microdesc) {
            (true, _) => DocumentKind::Vote,
            (false, true) => DocumentKind::MicrodescConsensus,
            (false, false) => DocumentKind::Consensus,
        }
    }
}

/// A `directory-signature` line and its block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSignature {
    pub algorithm: DigestAlgorithm,
    /// Identity fingerprint of the signing authority
    pub identity: Fingerprint,
    /// SHA-1 digest of the authority's signing key
    pub signing_key_digest: Fingerprint,
    pub signature: Object,
}

impl DocumentSignature {
    fn parse(item: &Item) -> Result<DocumentSignature, DocumentParseError> {
        let args = item.split_arguments()?;
        let (algorithm, identity, key_digest) = match args[..] {
            [identity, key_digest] => (DigestAlgorithm::Sha1, identity, key_digest),
            [algorithm, identity, key_digest, ..] => {
                let algorithm = DigestAlgorithm::from_name(algorithm).ok_or_else(|| {
                    DocumentParseError::shape(item.keyword, "a sha1 or sha256 digest algorithm", Some(algorithm))
                })?;
                (algorithm, identity, key_digest)
            }
            _ => return Err(DocumentParseError::args_missing(item.keyword)),
        };
        Ok(DocumentSignature {
            algorithm,
            identity: Fingerprint::from_str_hex(identity)?,
            signing_key_digest: Fingerprint::from_str_hex(key_digest)?,
            signature: item.get_object()?.clone(),
        })
    }
}

/// Parse `key=value` tokens.
fn parse_key_values<'a>(arguments: &'a str) -> Result<Vec<(&'a str, &'a str)>, DocumentParseError> {
    arguments
        .split_whitespace()
        .map(|entry| {
            entry
                .split_once('=')
                .ok_or_else(|| DocumentParseError::InvalidArgumentDict { raw: entry.to_string() })
        })
        .collect()
}

/// Parse `params`, whose keys must be sorted and whose values are 32 bit
/// signed integers.
fn parse_params(item: &Item) -> Result<BTreeMap<String, i32>, DocumentParseError> {
    let entries = parse_key_values(item.arguments_or_empty())?;
    let mut params = BTreeMap::new();
    let mut previous: Option<&str> = None;
    for (key, value) in entries {
        if previous.map_or(false, |p| p >= key) {
            return Err(DocumentParseError::shape(
                item.keyword,
                "keys in ascending order",
                item.arguments,
            ));
        }
        previous = Some(key);
        params.insert(key.to_string(), value.parse::<i32>().context(format!("param {}", key))?);
    }
    Ok(params)
}

fn parse_weights(item: &Item) -> Result<BTreeMap<String, i64>, DocumentParseError> {
    let mut weights = BTreeMap::new();
    for (key, value) in parse_key_values(item.arguments_or_empty())? {
        let weight = value.parse::<i64>().context(format!("bandwidth weight {}", key))?;
        weights.insert(key.to_string(), weight);
    }
    Ok(weights)
}

fn parse_voting_delay(item: &Item) -> Result<(u32, u32), DocumentParseError> {
    let args = item.split_arguments()?;
    match args[..] {
        [vote, dist] => Ok((
            vote.parse::<u32>().context("voting-delay (vote)")?,
            dist.parse::<u32>().context("voting-delay (distribution)")?,
        )),
        _ => Err(DocumentParseError::shape(item.keyword, "two integers", item.arguments)),
    }
}

fn parse_version(item: &Item) -> Result<(u32, Option<String>), DocumentParseError> {
    let mut args = item.get_argument()?.split_whitespace();
    let version = args
        .next()
        .ok_or_else(|| DocumentParseError::args_missing(item.keyword))?
        .parse::<u32>()
        .context("network status version")?;
    Ok((version, args.next().map(String::from)))
}

pub(crate) fn comma_list(item: &Item) -> Vec<String> {
    item.arguments_or_empty()
        .split(',')
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Part {
    Header,
    Authorities,
    Routers,
    Footer,
}

/// Item indexes of each section of a document
#[derive(Debug, Default)]
struct Layout {
    header: Vec<usize>,
    authorities: Vec<Range<usize>>,
    routers: Vec<Range<usize>>,
    footer: Vec<usize>,
    /// Section-opening lines found after their section ended
    misplaced: Vec<(usize, Part)>,
}

impl Layout {
    fn of(items: &[Item]) -> Layout {
        let mut layout = Layout::default();
        let mut part = Part::Header;
        for (index, item) in items.iter().enumerate() {
            let next = match item.keyword {
                "dir-source" => Part::Authorities,
                "r" => Part::Routers,
                "directory-footer" | "directory-signature" => Part::Footer,
                _ => part,
            };
            if next < part {
                layout.misplaced.push((index, part));
                continue;
            }
            match next {
                Part::Header => layout.header.push(index),
                Part::Footer => layout.footer.push(index),
                Part::Authorities | Part::Routers => {
                    let blocks = if next == Part::Authorities {
                        &mut layout.authorities
                    } else {
                        &mut layout.routers
                    };
                    if matches!(item.keyword, "dir-source" | "r") {
                        blocks.push(index..index + 1);
                    } else if let Some(block) = blocks.last_mut() {
                        block.end = index + 1;
                    }
                }
            }
            part = next;
        }
        layout
    }
}

/// A v3 network status document.
///
/// Mandatory header fields are `None` only when parsed permissively without
/// them, or when they don't apply to the document's kind.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusDocumentV3 {
    pub kind: DocumentKind,
    pub version: Option<u32>,
    /// `microdesc` for microdescriptor consensuses
    pub version_flavor: Option<String>,
    /// Methods the voting authority supports, in votes
    pub consensus_methods: Vec<u32>,
    /// Method used to build a consensus
    pub consensus_method: Option<u32>,
    /// Vote publication time
    pub published: Option<DateTime<Utc>>,
    pub valid_after: Option<DateTime<Utc>>,
    pub fresh_until: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub vote_delay: Option<u32>,
    pub dist_delay: Option<u32>,
    pub client_versions: Vec<String>,
    pub server_versions: Vec<String>,
    pub packages: Vec<String>,
    pub known_flags: Vec<String>,
    pub flag_thresholds: BTreeMap<String, String>,
    pub recommended_client_protocols: ProtocolList,
    pub recommended_relay_protocols: ProtocolList,
    pub required_client_protocols: ProtocolList,
    pub required_relay_protocols: ProtocolList,
    pub params: BTreeMap<String, i32>,
    pub shared_randomness_participate: bool,
    pub shared_randomness_commitments: Vec<SharedRandomnessCommitment>,
    pub shared_randomness_previous: Option<SharedRandomness>,
    pub shared_randomness_current: Option<SharedRandomness>,
    pub bandwidth_file_headers: BTreeMap<String, String>,
    pub bandwidth_file_digest: Option<String>,
    pub authorities: Vec<DirectoryAuthority>,
    pub routers: Vec<RouterStatusEntry>,
    pub has_footer: bool,
    pub bandwidth_weights: BTreeMap<String, i64>,
    pub signatures: Vec<DocumentSignature>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    pub signature_valid: Option<bool>,
}

impl NetworkStatusDocumentV3 {
    fn empty(kind: DocumentKind, raw: &str) -> Self {
        NetworkStatusDocumentV3 {
            kind,
            version: None,
            version_flavor: None,
            consensus_methods: Vec::new(),
            consensus_method: None,
            published: None,
            valid_after: None,
            fresh_until: None,
            valid_until: None,
            vote_delay: None,
            dist_delay: None,
            client_versions: Vec::new(),
            server_versions: Vec::new(),
            packages: Vec::new(),
            known_flags: Vec::new(),
            flag_thresholds: BTreeMap::new(),
            recommended_client_protocols: ProtocolList::default(),
            recommended_relay_protocols: ProtocolList::default(),
            required_client_protocols: ProtocolList::default(),
            required_relay_protocols: ProtocolList::default(),
            params: BTreeMap::new(),
            shared_randomness_participate: false,
            shared_randomness_commitments: Vec::new(),
            shared_randomness_previous: None,
            shared_randomness_current: None,
            bandwidth_file_headers: BTreeMap::new(),
            bandwidth_file_digest: None,
            authorities: Vec::new(),
            routers: Vec::new(),
            has_footer: false,
            bandwidth_weights: BTreeMap::new(),
            signatures: Vec::new(),
            raw: raw.to_string(),
            lines: Vec::new(),
            unrecognized: Unrecognized::new(),
            signature_valid: None,
        }
    }

    /// Parse a vote or consensus. The kind is taken from its `vote-status`
    /// and `network-status-version` lines.
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let items = &doc.items;
        let kind = DocumentKind::detect(items);
        let layout = Layout::of(items);
        let mut status = NetworkStatusDocumentV3::empty(kind, doc.raw);
        status.lines = doc.lines();

        let mut header = Assembler::new(&NETWORK_STATUS_V3_HEADER, strictness)
            .with_flavor(kind.flavor())
            .in_section(Section::Header);
        header.note_skipped(&doc.skipped);
        let header_items: Vec<&Item> = layout.header.iter().map(|&i| &items[i]).collect();
        let total = header_items.len();
        for (index, item) in header_items.into_iter().enumerate() {
            if header.accept(item, index, total)?.is_some() {
                status.read_header_item(&mut header, item)?;
            }
        }
        let mut unrecognized = header.finish()?;

        for range in &layout.authorities {
            let authority = DirectoryAuthority::from_items(doc.raw, &items[range.clone()], kind.flavor(), strictness, &[])?;
            unrecognized.absorb(authority.unrecognized.clone(), Section::Authority);
            status.authorities.push(authority);
        }

        for range in &layout.routers {
            let entry = RouterStatusEntry::from_items(
                doc.raw,
                &items[range.clone()],
                kind.router_status_version(),
                strictness,
                &[],
            )?;
            unrecognized.absorb(entry.unrecognized.clone(), Section::Router);
            status.routers.push(entry);
        }

        let mut footer = Assembler::new(&NETWORK_STATUS_V3_FOOTER, strictness)
            .with_flavor(kind.flavor())
            .in_section(Section::Footer);
        let total = layout.footer.len();
        for (index, item) in layout.footer.iter().map(|&i| &items[i]).enumerate() {
            if footer.accept(item, index, total)?.is_some() {
                status.read_footer_item(&mut footer, item)?;
            }
        }
        unrecognized.absorb(footer.finish()?, Section::Footer);

        for &(index, part) in &layout.misplaced {
            let item = &items[index];
            let (section, reason) = match part {
                Part::Routers => (Section::Router, "appears after the router status entries began"),
                _ => (Section::Footer, "appears in the footer"),
            };
            let violation = SchemaViolation::Misordered {
                dialect: NETWORK_STATUS_V3_HEADER.dialect,
                keyword: item.keyword.to_string(),
                reason: reason.to_string(),
            };
            if strictness.is_strict() {
                return Err(violation.into());
            }
            warn!("{}", violation);
            unrecognized.push(section, UnrecognizedKind::Deferred, violation.to_string());
        }

        status.unrecognized = unrecognized;
        debug!(
            "assembled {:?} with {} authorities and {} router status entries",
            kind,
            status.authorities.len(),
            status.routers.len()
        );
        Ok(status)
    }

    fn read_header_item(&mut self, asm: &mut Assembler, item: &Item) -> Result<(), DocumentParseError> {
        match item.keyword {
            "network-status-version" => {
                if let Some((version, flavor)) = asm.defer(parse_version(item))? {
                    self.version = Some(version);
                    self.version_flavor = flavor;
                    if version != 3 {
                        asm.defer::<()>(Err(DocumentParseError::shape(item.keyword, "3", item.arguments)))?;
                    }
                }
            }
            "vote-status" => match item.arguments {
                Some("vote") | Some("consensus") => {}
                _ if asm.strictness().is_strict() => {
                    return Err(DocumentParseError::shape(
                        item.keyword,
                        "'vote' or 'consensus'",
                        item.arguments,
                    ))
                }
                _ => asm.record(UnrecognizedKind::Value, item.content()),
            },
            "consensus-methods" => {
                let methods = item
                    .arguments_or_empty()
                    .split_whitespace()
                    .map(|m| m.parse::<u32>().context("consensus-methods"))
                    .collect::<Result<Vec<_>, _>>();
                if let Some(methods) = asm.defer(methods)? {
                    self.consensus_methods = methods;
                }
            }
            "consensus-method" => {
                self.consensus_method = asm.defer(item.arguments_or_empty().parse::<u32>().context("consensus-method"))?
            }
            "published" => self.published = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
            "valid-after" => self.valid_after = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
            "fresh-until" => self.fresh_until = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
            "valid-until" => self.valid_until = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
            "voting-delay" => {
                if let Some((vote, dist)) = asm.defer(parse_voting_delay(item))? {
                    self.vote_delay = Some(vote);
                    self.dist_delay = Some(dist);
                }
            }
            "client-versions" => self.client_versions = comma_list(item),
            "server-versions" => self.server_versions = comma_list(item),
            "package" => self.packages.push(item.arguments_or_empty().to_string()),
            "known-flags" => {
                self.known_flags = item.arguments_or_empty().split_whitespace().map(String::from).collect();
                for flag in self.known_flags.iter().filter(|f| f.parse::<Flag>().is_err()) {
                    asm.record(UnrecognizedKind::Flag, flag.as_str());
                }
            }
            "flag-thresholds" => {
                if let Some(entries) = asm.defer(parse_key_values(item.arguments_or_empty()))? {
                    self.flag_thresholds = entries
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                }
            }
            "recommended-client-protocols"
            | "recommended-relay-protocols"
            | "required-client-protocols"
            | "required-relay-protocols" => {
                if let Some(protocols) = asm.defer(item.arguments_or_empty().parse::<ProtocolList>())? {
                    for unknown in &protocols.unknown {
                        asm.record(UnrecognizedKind::Value, format!("{} {}", item.keyword, unknown));
                    }
                    *self.protocol_list_mut(item.keyword) = protocols;
                }
            }
            "params" => {
                if let Some(params) = asm.defer(parse_params(item))? {
                    self.params = params;
                }
            }
            "shared-rand-participate" => self.shared_randomness_participate = true,
            "shared-rand-commit" => {
                if let Some(commitment) = asm.defer(item.arguments_or_empty().parse())? {
                    self.shared_randomness_commitments.push(commitment);
                }
            }
            "shared-rand-previous-value" => {
                self.shared_randomness_previous = asm.defer(item.arguments_or_empty().parse())?
            }
            "shared-rand-current-value" => {
                self.shared_randomness_current = asm.defer(item.arguments_or_empty().parse())?
            }
            "bandwidth-file-headers" => {
                if let Some(entries) = asm.defer(parse_key_values(item.arguments_or_empty()))? {
                    self.bandwidth_file_headers = entries
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                }
            }
            "bandwidth-file-digest" => self.bandwidth_file_digest = item.arguments.map(String::from),
            _ => {}
        }
        Ok(())
    }

    fn protocol_list_mut(&mut self, keyword: &str) -> &mut ProtocolList {
        match keyword {
            "recommended-client-protocols" => &mut self.recommended_client_protocols,
            "recommended-relay-protocols" => &mut self.recommended_relay_protocols,
            "required-client-protocols" => &mut self.required_client_protocols,
            _ => &mut self.required_relay_protocols,
        }
    }

    fn read_footer_item(&mut self, asm: &mut Assembler, item: &Item) -> Result<(), DocumentParseError> {
        match item.keyword {
            "directory-footer" => self.has_footer = true,
            "bandwidth-weights" => {
                if let Some(weights) = asm.defer(parse_weights(item))? {
                    self.bandwidth_weights = weights;
                }
            }
            "directory-signature" => {
                if let Some(signature) = asm.defer(DocumentSignature::parse(item))? {
                    self.signatures.push(signature);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_vote(&self) -> bool {
        self.kind == DocumentKind::Vote
    }

    pub fn is_consensus(&self) -> bool {
        self.kind != DocumentKind::Vote
    }

    pub fn is_microdescriptor(&self) -> bool {
        self.kind == DocumentKind::MicrodescConsensus
    }

    /// A consensus parameter, if it was listed
    pub fn param(&self, name: &str) -> Option<i32> {
        self.params.get(name).copied()
    }

    pub fn authority(&self, identity: &Fingerprint) -> Option<&DirectoryAuthority> {
        self.authorities.iter().find(|a| &a.identity == identity)
    }

    pub fn router(&self, fingerprint: &Fingerprint) -> Option<&RouterStatusEntry> {
        self.routers.iter().find(|r| &r.fingerprint == fingerprint)
    }

    /// Digest of the signed part of the document
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>, DocumentParseError> {
        digest_range(&self.raw, "network-status-version", "directory-signature ", algorithm)
    }

    /// Check the document's signatures against authority key certificates.
    ///
    /// Each signature is checked with the certificate carrying the same
    /// identity and signing key digest. At least half of all signatures must
    /// be valid, and at least one certificate must match. Returns the number
    /// of valid signatures.
    pub fn validate_signatures(&self, certificates: &[KeyCertificate]) -> Result<usize, DocumentParseError> {
        let total = self.signatures.len();
        let mut matched = 0;
        let mut valid = 0;
        for signature in &self.signatures {
            let signing_key = certificates
                .iter()
                .filter(|c| c.fingerprint == Some(signature.identity))
                .filter(|c| c.signing_key_digest() == Some(signature.signing_key_digest))
                .find_map(|c| c.signing_key.as_ref());
            let signing_key = match signing_key {
                Some(key) => key,
                None => {
                    trace!("no key certificate for signature by {}", signature.identity);
                    continue;
                }
            };
            matched += 1;

            let local = self.digest(signature.algorithm)?;
            match signing_key.verify_digest(&signature.signature.decode()?, &local, "network status document") {
                Ok(()) => valid += 1,
                Err(e) => debug!("signature by {} is invalid: {}", signature.identity, e),
            }
        }

        if matched == 0 {
            return Err(SignatureError::NoMatchingCertificate.into());
        }
        if valid * 2 < total {
            return Err(SignatureError::InsufficientSignatures { valid, total }.into());
        }
        Ok(valid)
    }
}

impl SignedDocument for NetworkStatusDocumentV3 {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}

impl FromStr for NetworkStatusDocumentV3 {
    type Err = DocumentParseError;

    /// Parse permissively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, Strictness::Permissive)
    }
}
