//! Tor server descriptor documents

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::assembler::Assembler;
use crate::certificate::{Ed25519Certificate, ED25519_KEY_LENGTH};
use crate::config::Strictness;
use crate::crypto::{sha1_fingerprint, RsaPublicKey};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SignatureError};
use crate::meta::{content_between, parse_timestamp, DescriptorLine, Document, Fingerprint, Item, Object};
use crate::protocol::ProtocolList;
use crate::router_status::is_valid_nickname;
use crate::schema::SERVER_DESCRIPTOR;
use crate::unrecognized::{Unrecognized, UnrecognizedKind};

mod exit;
pub use exit::{AddressPattern, ExitPolicy, ExitRule, PolicyAction, PortRange, PortSummary};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use log::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyMember {
    Fingerprint(Fingerprint),
    Nickname(String),
}

impl FromStr for FamilyMember {
    type Err = DocumentParseError;

    /// Parse `$FINGERPRINT`, `$FINGERPRINT=nickname`, `$FINGERPRINT~nickname`
    /// or `nickname`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('$') {
            Some(rest) => {
                let hex = rest.split(|c| c == '=' || c == '~').next().unwrap_or(rest);
                Ok(FamilyMember::Fingerprint(Fingerprint::from_str_hex(hex)?))
            }
            None => Ok(FamilyMember::Nickname(s.to_string())),
        }
    }
}

/// Contents of the `router` line
#[derive(Debug)]
struct RouterLine {
    nickname: String,
    address: IpAddr,
    or_port: u16,
    socks_port: Option<u16>,
    dir_port: Option<u16>,
}

fn parse_router_line(item: &Item) -> Result<RouterLine, DocumentParseError> {
    let splits = item.split_arguments()?;
    match splits[..] {
        // nickname address ORPort SOCKSPort DirPort
        [nickname, ip, or_port, socks_port, dir_port, ..] => {
            if !is_valid_nickname(nickname) {
                return Err(DocumentParseError::shape(
                    item.keyword,
                    "a nickname of 1-19 alphanumeric characters",
                    Some(nickname),
                ));
            }
            let optional_port = |port: &str, context: &str| -> Result<Option<u16>, DocumentParseError> {
                match port.parse::<u16>().context(context)? {
                    0 => Ok(None),
                    port => Ok(Some(port)),
                }
            };
            Ok(RouterLine {
                nickname: nickname.to_string(),
                address: IpAddr::from_str(ip).map_err(|_| DocumentParseError::InvalidIpAddress(ip.to_string()))?,
                or_port: or_port.parse::<u16>().context("OR port")?,
                socks_port: optional_port(socks_port, "SOCKS port")?,
                dir_port: optional_port(dir_port, "dir port")?,
            })
        }
        _ => Err(DocumentParseError::args_missing(item.keyword)),
    }
}

fn parse_bandwidth(item: &Item) -> Result<(u64, u64, u64), DocumentParseError> {
    let splits = item.split_arguments()?;
    match splits[..] {
        // bandwidth-avg bandwidth-burst bandwidth-observed
        [avg, burst, observed, ..] => Ok((
            avg.parse::<u64>().context("bandwidth (average)")?,
            burst.parse::<u64>().context("bandwidth (burst)")?,
            observed.parse::<u64>().context("bandwidth (observed)")?,
        )),
        _ => Err(DocumentParseError::args_missing(item.keyword)),
    }
}

/// `fingerprint` lines group the hex digits in blocks of four
fn parse_spaced_fingerprint(arguments: &str) -> Result<Fingerprint, DocumentParseError> {
    let hex: String = arguments.split_whitespace().collect();
    Fingerprint::from_str_hex(&hex)
}

/// A relay server descriptor.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(private)]
pub struct ServerDescriptor {
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,
    #[builder(default)]
    pub socks_port: Option<u16>,
    #[builder(default)]
    pub dir_port: Option<u16>,
    #[builder(default)]
    pub bandwidth_avg: Option<u64>,
    #[builder(default)]
    pub bandwidth_burst: Option<u64>,
    #[builder(default)]
    pub bandwidth_observed: Option<u64>,
    #[builder(default)]
    pub platform: Option<String>,
    #[builder(default)]
    pub published: Option<DateTime<Utc>>,
    #[builder(default)]
    pub fingerprint: Option<Fingerprint>,
    #[builder(default)]
    pub hibernating: bool,
    #[builder(default)]
    pub uptime: Option<u64>,
    #[builder(default)]
    pub onion_key: Option<RsaPublicKey>,
    #[builder(default)]
    pub onion_key_crosscert: Option<Object>,
    /// Base64 curve25519 key
    #[builder(default)]
    pub ntor_onion_key: Option<String>,
    #[builder(default)]
    pub signing_key: Option<RsaPublicKey>,
    #[builder(default)]
    pub ed25519_certificate: Option<Ed25519Certificate>,
    /// Base64 Ed25519 master key
    #[builder(default)]
    pub ed25519_master_key: Option<String>,
    #[builder(default)]
    pub family: Vec<FamilyMember>,
    #[builder(setter(custom), default)]
    pub or_addresses: Vec<SocketAddr>,
    #[builder(setter(custom), default)]
    pub exit_policy: ExitPolicy,
    #[builder(default)]
    pub ipv6_policy: PortSummary,
    #[builder(default)]
    pub contact: Option<String>,
    #[builder(default)]
    pub extra_info_digest: Option<Fingerprint>,
    /// Base64 SHA-256 digest of the extra-info descriptor
    #[builder(default)]
    pub extra_info_sha256_digest: Option<String>,
    /// Hidden service descriptor versions this relay serves, if it is a
    /// hidden service directory
    #[builder(default)]
    pub hidden_service_dir: Option<Vec<u32>>,
    #[builder(default)]
    pub caches_extra_info: bool,
    #[builder(default)]
    pub allow_single_hop_exits: bool,
    #[builder(default)]
    pub tunnelled_dir_server: bool,
    /// Legacy `protocols Link 1 2 Circuit 1` line
    #[builder(default)]
    pub link_protocols: Option<String>,
    #[builder(default)]
    pub protocols: ProtocolList,
    #[builder(default)]
    pub bridge_distribution: Option<String>,
    /// Base64 `router-sig-ed25519` signature
    #[builder(default)]
    pub ed25519_signature: Option<String>,
    #[builder(default)]
    pub signature: Option<Object>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    #[builder(default)]
    pub signature_valid: Option<bool>,
}

impl ServerDescriptorBuilder {
    fn add_or_address(&mut self, or: SocketAddr) {
        self.or_addresses.get_or_insert_with(Vec::new).push(or);
    }

    fn add_exit_policy_rule(&mut self, rule: ExitRule) {
        self.exit_policy.get_or_insert_with(ExitPolicy::default).push(rule);
    }
}

impl ServerDescriptor {
    /// Parse a descriptor document from raw text.
    pub fn parse(text: &str, strictness: Strictness) -> Result<ServerDescriptor, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    /// Parse a descriptor document from an already-parsed Tor meta document
    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<ServerDescriptor, DocumentParseError> {
        let mut asm = Assembler::new(&SERVER_DESCRIPTOR, strictness);
        asm.note_skipped(&doc.skipped);
        let mut builder = ServerDescriptorBuilder::default();

        let total = doc.items.len();
        for (index, item) in doc.items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "router" => {
                    if let Some(router) = asm.defer(parse_router_line(item))? {
                        builder
                            .nickname(router.nickname)
                            .address(router.address)
                            .or_port(router.or_port)
                            .socks_port(router.socks_port)
                            .dir_port(router.dir_port);
                    }
                }
                "bandwidth" => {
                    if let Some((avg, burst, observed)) = asm.defer(parse_bandwidth(item))? {
                        builder
                            .bandwidth_avg(Some(avg))
                            .bandwidth_burst(Some(burst))
                            .bandwidth_observed(Some(observed));
                    }
                }
                "platform" => {
                    builder.platform(item.arguments.map(String::from));
                }
                "published" => {
                    builder.published(asm.defer(parse_timestamp(item.arguments_or_empty()))?);
                }
                "fingerprint" => {
                    builder.fingerprint(asm.defer(parse_spaced_fingerprint(item.arguments_or_empty()))?);
                }
                "hibernating" => {
                    builder.hibernating(item.arguments == Some("1"));
                }
                "uptime" => {
                    builder.uptime(asm.defer(item.arguments_or_empty().parse::<u64>().context("uptime"))?);
                }
                "onion-key" => {
                    builder.onion_key(asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?);
                }
                "onion-key-crosscert" => {
                    builder.onion_key_crosscert(item.object.clone());
                }
                "ntor-onion-key" => {
                    builder.ntor_onion_key(item.arguments.map(String::from));
                }
                "signing-key" => {
                    builder.signing_key(asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?);
                }
                "identity-ed25519" => {
                    let certificate = item
                        .get_object()
                        .and_then(|o| Ed25519Certificate::parse(&o.text).map_err(DocumentParseError::from));
                    builder.ed25519_certificate(asm.defer(certificate)?);
                }
                "master-key-ed25519" => {
                    builder.ed25519_master_key(item.arguments.map(String::from));
                }
                "family" => {
                    let family = item
                        .arguments_or_empty()
                        .split_whitespace()
                        .map(FamilyMember::from_str)
                        .collect::<Result<Vec<_>, _>>();
                    if let Some(family) = asm.defer(family)? {
                        builder.family(family);
                    }
                }
                "or-address" => {
                    let arg = item.arguments_or_empty();
                    let address = arg
                        .parse::<SocketAddr>()
                        .map_err(|_| DocumentParseError::InvalidIpAddress(arg.to_string()));
                    if let Some(address) = asm.defer(address)? {
                        builder.add_or_address(address);
                    }
                }
                "accept" | "reject" => {
                    let rule = item
                        .keyword
                        .parse::<PolicyAction>()
                        .and_then(|action| ExitRule::parse(action, item.arguments_or_empty()));
                    if let Some(rule) = asm.defer(rule)? {
                        builder.add_exit_policy_rule(rule);
                    }
                }
                "ipv6-policy" => {
                    if let Some(policy) = asm.defer(item.arguments_or_empty().parse::<PortSummary>())? {
                        builder.ipv6_policy(policy);
                    }
                }
                "contact" => {
                    builder.contact(item.arguments.map(String::from));
                }
                "extra-info-digest" => {
                    let mut args = item.arguments_or_empty().split_whitespace();
                    let digest = args.next().map(Fingerprint::from_str_hex).transpose();
                    builder.extra_info_digest(asm.defer(digest)?.flatten());
                    builder.extra_info_sha256_digest(args.next().map(String::from));
                }
                "hidden-service-dir" => {
                    // no arguments means version 2
                    let versions = match item.arguments {
                        None => Ok(vec![2]),
                        Some(args) => args
                            .split_whitespace()
                            .map(|v| v.parse::<u32>().context("hidden-service-dir version"))
                            .collect::<Result<Vec<_>, _>>(),
                    };
                    builder.hidden_service_dir(asm.defer(versions)?);
                }
                "caches-extra-info" => {
                    builder.caches_extra_info(true);
                }
                "allow-single-hop-exits" => {
                    builder.allow_single_hop_exits(true);
                }
                "tunnelled-dir-server" => {
                    builder.tunnelled_dir_server(true);
                }
                "protocols" => {
                    builder.link_protocols(item.arguments.map(String::from));
                }
                "proto" => {
                    if let Some(protocols) = asm.defer(item.arguments_or_empty().parse::<ProtocolList>())? {
                        for unknown in &protocols.unknown {
                            asm.record(UnrecognizedKind::Value, format!("proto {}", unknown));
                        }
                        builder.protocols(protocols);
                    }
                }
                "bridge-distribution-request" => {
                    builder.bridge_distribution(item.arguments.map(String::from));
                }
                "router-sig-ed25519" => {
                    builder.ed25519_signature(item.arguments.map(String::from));
                }
                "router-signature" => {
                    builder.signature(item.object.clone());
                }
                _ => {}
            }
        }

        let unrecognized = asm.finish()?;
        builder
            .raw(doc.raw.to_string())
            .lines(doc.lines())
            .unrecognized(unrecognized);
        let descriptor = builder
            .build()
            .map_err(|e| DocumentParseError::Incomplete(Box::new(e)))?;
        debug!("assembled server descriptor for {}", descriptor.nickname);
        Ok(descriptor)
    }

    /// The document text starting at its `router` line
    fn from_router_line(&self) -> &str {
        if self.raw.starts_with("router ") {
            return &self.raw;
        }
        match self.raw.find("\nrouter ") {
            Some(index) => &self.raw[index + 1..],
            None => &self.raw,
        }
    }

    /// Text signed by `router-signature`
    pub fn signed_content(&self) -> Result<&str, DocumentParseError> {
        content_between(self.from_router_line(), "router", "\nrouter-signature\n")
    }

    /// Text covered by `router-sig-ed25519`, through the keyword and its space
    pub fn ed25519_signed_content(&self) -> Result<&str, DocumentParseError> {
        content_between(self.from_router_line(), "router", "router-sig-ed25519 ")
    }

    /// SHA-1 digest of the signed content, as referenced by network status
    /// documents
    pub fn digest(&self) -> Result<Fingerprint, DocumentParseError> {
        Ok(sha1_fingerprint(self.signed_content()?.as_bytes()))
    }

    /// Check `router-signature` with the descriptor's own signing key, and
    /// that the key matches the declared fingerprint.
    pub fn validate_signature(&self) -> Result<(), DocumentParseError> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| SignatureError::MissingKey("server descriptor (no signing-key)".to_string()))?;
        if let Some(declared) = self.fingerprint {
            let computed = signing_key.fingerprint();
            if declared != computed {
                return Err(SignatureError::FingerprintMismatch {
                    declared: declared.to_string(),
                    computed: computed.to_string(),
                }
                .into());
            }
        }
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| SignatureError::MalformedSignature("no router-signature".to_string()))?;
        let digest = self.digest()?;
        signing_key.verify_digest(&signature.decode()?, digest.as_bytes(), "server descriptor")?;
        Ok(())
    }

    /// Check the Ed25519 certificate and `router-sig-ed25519`, optionally
    /// with a different key for the certificate's signature.
    pub fn validate_ed25519(&self, key_override: Option<&[u8; ED25519_KEY_LENGTH]>) -> Result<(), DocumentParseError> {
        let certificate = self
            .ed25519_certificate
            .as_ref()
            .ok_or_else(|| SignatureError::MissingKey("server descriptor (no identity-ed25519)".to_string()))?;
        certificate.validate(self, key_override)
    }
}

impl SignedDocument for ServerDescriptor {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}
