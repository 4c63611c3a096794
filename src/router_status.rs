//! Router status entries: one relay's entry in a network status document.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::descriptor::PortSummary;
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::{covered_text, parse_timestamp, DescriptorLine, Document, Fingerprint, Item};
use crate::protocol::ProtocolList;
use crate::schema::{Schema, ROUTER_STATUS_MICRO_V3, ROUTER_STATUS_V2, ROUTER_STATUS_V3};
use crate::unrecognized::{Unrecognized, UnrecognizedKind};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use lazy_static::lazy_static;
use log::trace;
use regex::Regex;
use strum::{Display, EnumString, EnumVariantNames, IntoStaticStr, VariantNames};

lazy_static! {
    static ref NICKNAME: Regex = Regex::new(r"^[A-Za-z0-9]{1,19}$").expect("valid nickname regex");
}

/// Whether `nickname` is 1 to 19 alphanumeric characters
pub fn is_valid_nickname(nickname: &str) -> bool {
    NICKNAME.is_match(nickname)
}

/// A relay flag assigned by the directory authorities
#[derive(
    Debug, Clone, Copy, Display, EnumString, EnumVariantNames, IntoStaticStr, PartialEq, Eq, Hash,
)]
pub enum Flag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    MiddleOnly,
    Named,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    Sybil,
    Unnamed,
    V2Dir,
    Valid,
}

impl Flag {
    pub fn known_flags_string() -> String {
        Flag::VARIANTS.join(" ")
    }
}

/// Format of a router status entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterStatusVersion {
    /// Entries of v2 network status documents
    V2,
    /// Entries of v3 votes and consensuses
    V3,
    /// Entries of microdescriptor consensuses
    MicroV3,
}

impl RouterStatusVersion {
    pub(crate) fn schema(self) -> &'static Schema {
        match self {
            RouterStatusVersion::V2 => &ROUTER_STATUS_V2,
            RouterStatusVersion::V3 => &ROUTER_STATUS_V3,
            RouterStatusVersion::MicroV3 => &ROUTER_STATUS_MICRO_V3,
        }
    }
}

/// Microdescriptor digests listed in a vote, `m 13,14,15 sha256=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrodescriptorHash {
    pub consensus_methods: Vec<u32>,
    /// Hash algorithm to base64 digest
    pub digests: BTreeMap<String, String>,
}

impl FromStr for MicrodescriptorHash {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let methods = parts.next().ok_or_else(|| DocumentParseError::args_missing("m"))?;
        let consensus_methods = methods
            .split(',')
            .map(|m| m.parse::<u32>().context("consensus method"))
            .collect::<Result<Vec<_>, _>>()?;
        let digests = parts
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| DocumentParseError::InvalidArgumentDict { raw: entry.to_string() })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(MicrodescriptorHash {
            consensus_methods,
            digests,
        })
    }
}

/// Contents of the `r` line
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouterLine {
    nickname: String,
    fingerprint: Fingerprint,
    digest: Option<Fingerprint>,
    published: DateTime<Utc>,
    address: IpAddr,
    or_port: u16,
    dir_port: Option<u16>,
}

fn parse_router_line(item: &Item, version: RouterStatusVersion) -> Result<RouterLine, DocumentParseError> {
    let args = item.split_arguments()?;
    let (nickname, identity, digest, rest) = match (version, &args[..]) {
        (RouterStatusVersion::MicroV3, [nickname, identity, rest @ ..]) if rest.len() >= 5 => {
            (*nickname, *identity, None, rest)
        }
        (RouterStatusVersion::V2 | RouterStatusVersion::V3, [nickname, identity, digest, rest @ ..])
            if rest.len() >= 5 =>
        {
            (*nickname, *identity, Some(*digest), rest)
        }
        _ => return Err(DocumentParseError::args_missing(item.keyword)),
    };

    if !is_valid_nickname(nickname) {
        return Err(DocumentParseError::shape(
            "r",
            "a nickname of 1-19 alphanumeric characters",
            Some(nickname),
        ));
    }
    let address = rest[2]
        .parse::<IpAddr>()
        .map_err(|_| DocumentParseError::InvalidIpAddress(rest[2].to_string()))?;
    let or_port = rest[3].parse::<u16>().context("OR port")?;
    let dir_port = match rest[4].parse::<u16>().context("dir port")? {
        0 => None,
        port => Some(port),
    };

    Ok(RouterLine {
        nickname: nickname.to_string(),
        fingerprint: Fingerprint::from_str_b64(identity)?,
        digest: digest.map(Fingerprint::from_str_b64).transpose()?,
        published: parse_timestamp(&format!("{} {}", rest[0], rest[1]))?,
        address,
        or_port,
        dir_port,
    })
}

/// Parsed `w` line
#[derive(Debug, Default)]
struct BandwidthLine {
    bandwidth: Option<u64>,
    measured: Option<u64>,
    unmeasured: bool,
    unknown: Vec<String>,
}

fn parse_bandwidth_line(item: &Item) -> Result<BandwidthLine, DocumentParseError> {
    let mut line = BandwidthLine::default();
    for entry in item.split_arguments()? {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| DocumentParseError::InvalidArgumentDict { raw: entry.to_string() })?;
        match key {
            "Bandwidth" => line.bandwidth = Some(value.parse::<u64>().context("w Bandwidth")?),
            "Measured" => line.measured = Some(value.parse::<u64>().context("w Measured")?),
            "Unmeasured" => line.unmeasured = value == "1",
            _ => line.unknown.push(entry.to_string()),
        }
    }
    Ok(line)
}

/// A relay's entry in a network status document.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(private)]
pub struct RouterStatusEntry {
    pub version: RouterStatusVersion,
    pub nickname: String,
    pub fingerprint: Fingerprint,
    /// Server descriptor digest; microdescriptor entries don't have one
    #[builder(default)]
    pub digest: Option<Fingerprint>,
    pub published: DateTime<Utc>,
    pub address: IpAddr,
    pub or_port: u16,
    #[builder(default)]
    pub dir_port: Option<u16>,
    /// Additional addresses from `a` lines
    #[builder(default)]
    pub or_addresses: Vec<SocketAddr>,
    /// All flags as listed, known or not
    #[builder(default)]
    pub flags: Vec<String>,
    #[builder(default)]
    pub version_line: Option<String>,
    #[builder(default)]
    pub bandwidth: Option<u64>,
    #[builder(default)]
    pub measured: Option<u64>,
    #[builder(default)]
    pub is_unmeasured: bool,
    #[builder(default)]
    pub exit_policy: Option<PortSummary>,
    #[builder(default)]
    pub protocols: ProtocolList,
    /// Digest of the relay's microdescriptor, in microdescriptor consensuses
    #[builder(default)]
    pub microdescriptor_digest: Option<String>,
    /// Microdescriptor digests per consensus method, in votes
    #[builder(default)]
    pub microdescriptor_hashes: Vec<MicrodescriptorHash>,
    /// Ed25519 identity from the `id` line of votes, or "none"
    #[builder(default)]
    pub ed25519_identity: Option<String>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
}

impl RouterStatusEntry {
    pub fn parse(text: &str, version: RouterStatusVersion, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        let mut entry = Self::from_items(text, &doc.items, version, strictness, &doc.skipped)?;
        entry.raw = text.to_string();
        Ok(entry)
    }

    /// Assemble an entry from items lexed out of `source`.
    pub(crate) fn from_items(
        source: &str,
        items: &[Item],
        version: RouterStatusVersion,
        strictness: Strictness,
        skipped: &[String],
    ) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(version.schema(), strictness);
        asm.note_skipped(skipped);
        let mut builder = RouterStatusEntryBuilder::default();
        builder.version(version);

        let total = items.len();
        for (index, item) in items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "r" => {
                    if let Some(r) = asm.defer(parse_router_line(item, version))? {
                        builder
                            .nickname(r.nickname)
                            .fingerprint(r.fingerprint)
                            .digest(r.digest)
                            .published(r.published)
                            .address(r.address)
                            .or_port(r.or_port)
                            .dir_port(r.dir_port);
                    }
                }
                "a" => {
                    let parsed = item
                        .arguments_or_empty()
                        .parse::<SocketAddr>()
                        .map_err(|_| DocumentParseError::InvalidIpAddress(item.arguments_or_empty().to_string()));
                    if let Some(address) = asm.defer(parsed)? {
                        builder.or_addresses.get_or_insert_with(Vec::new).push(address);
                    }
                }
                "s" => {
                    let flags: Vec<String> = item.arguments_or_empty().split_whitespace().map(String::from).collect();
                    for flag in flags.iter().filter(|f| f.parse::<Flag>().is_err()) {
                        asm.record(UnrecognizedKind::Flag, flag.as_str());
                    }
                    builder.flags(flags);
                }
                "v" => {
                    builder.version_line(item.arguments.map(String::from));
                }
                "w" => {
                    if let Some(w) = asm.defer(parse_bandwidth_line(item))? {
                        for unknown in &w.unknown {
                            asm.record(UnrecognizedKind::Value, format!("w {}", unknown));
                        }
                        builder
                            .bandwidth(w.bandwidth)
                            .measured(w.measured)
                            .is_unmeasured(w.unmeasured);
                    }
                }
                "p" => {
                    if let Some(policy) = asm.defer(item.arguments_or_empty().parse::<PortSummary>())? {
                        builder.exit_policy(Some(policy));
                    }
                }
                "pr" => {
                    if let Some(protocols) = asm.defer(item.arguments_or_empty().parse::<ProtocolList>())? {
                        for unknown in &protocols.unknown {
                            asm.record(UnrecognizedKind::Value, format!("pr {}", unknown));
                        }
                        builder.protocols(protocols);
                    }
                }
                "id" => {
                    // "id ed25519 <key>"
                    if let Some(args) = asm.defer(item.split_arguments())? {
                        match args[..] {
                            ["ed25519", key] => {
                                builder.ed25519_identity(Some(key.to_string()));
                            }
                            _ => asm.record(UnrecognizedKind::Value, item.content()),
                        }
                    }
                }
                "m" => match version {
                    RouterStatusVersion::MicroV3 => {
                        builder.microdescriptor_digest(item.arguments.map(String::from));
                    }
                    _ => {
                        if let Some(hash) = asm.defer(item.arguments_or_empty().parse::<MicrodescriptorHash>())? {
                            builder.microdescriptor_hashes.get_or_insert_with(Vec::new).push(hash);
                        }
                    }
                },
                _ => {}
            }
        }

        let unrecognized = asm.finish()?;
        builder
            .raw(covered_text(source, items).to_string())
            .lines(items.iter().map(Item::to_line).collect())
            .unrecognized(unrecognized);
        let entry = builder
            .build()
            .map_err(|err| DocumentParseError::Incomplete(Box::new(err)))?;
        trace!("assembled router status entry for {}", entry.nickname);
        Ok(entry)
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        let name: &'static str = flag.into();
        self.flags.iter().any(|f| f == name)
    }

    /// Flags this crate knows about, in listed order
    pub fn known_flags(&self) -> Vec<Flag> {
        self.flags.iter().filter_map(|f| f.parse().ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY_V3: &str = "r caerSidi p1aag7VwarGxqctS7/fS0y5FU+s oQZFLYe9e4A7bOkWKR7TaNxb0JE 2012-08-06 11:19:31 71.35.150.29 9001 0
a [2001:db8::1]:9001
s Fast Named Running Stable Valid
v Tor 0.2.3.19-rc
pr Cons=1-2 Link=1-5
w Bandwidth=1234 Measured=1100
p reject 1-65535
";

    const ENTRY_MICRO: &str = "r Konata ARIJF2zbqirB9IwsW0mQznccWww 2012-09-24 13:40:40 69.64.48.168 9001 9030
m aiUklwBrua82obG5AsTX+iEpkjQA2+AQHxZ7GwMfY70
s Fast Guard HSDir Named Running Stable V2Dir Valid
";

    #[test]
    fn test_v3_entry() {
        let entry = RouterStatusEntry::parse(ENTRY_V3, RouterStatusVersion::V3, Strictness::Strict).unwrap();
        assert_eq!("caerSidi", entry.nickname);
        assert_eq!("A7569A83B5706AB1B1A9CB52EFF7D2D32E4553EB", entry.fingerprint.to_string());
        assert_eq!("2012-08-06 11:19:31 UTC", entry.published.to_string());
        assert_eq!("71.35.150.29".parse::<IpAddr>().unwrap(), entry.address);
        assert_eq!(9001, entry.or_port);
        assert_eq!(None, entry.dir_port);
        assert_eq!(vec!["[2001:db8::1]:9001".parse::<SocketAddr>().unwrap()], entry.or_addresses);
        assert!(entry.has_flag(Flag::Named));
        assert!(!entry.has_flag(Flag::Exit));
        assert_eq!(5, entry.known_flags().len());
        assert_eq!(Some("Tor 0.2.3.19-rc".to_string()), entry.version_line);
        assert_eq!(Some(1234), entry.bandwidth);
        assert_eq!(Some(1100), entry.measured);
        assert!(!entry.exit_policy.as_ref().unwrap().allows_port(80));
        assert!(entry.unrecognized.is_empty());
    }

    #[test]
    fn test_micro_entry() {
        let entry = RouterStatusEntry::parse(ENTRY_MICRO, RouterStatusVersion::MicroV3, Strictness::Strict).unwrap();
        assert_eq!("Konata", entry.nickname);
        assert_eq!(None, entry.digest);
        assert_eq!(Some(9030), entry.dir_port);
        assert_eq!(
            Some("aiUklwBrua82obG5AsTX+iEpkjQA2+AQHxZ7GwMfY70".to_string()),
            entry.microdescriptor_digest
        );
    }

    #[test]
    fn test_micro_entry_requires_digest() {
        let text = ENTRY_MICRO.replace("m aiUklwBrua82obG5AsTX+iEpkjQA2+AQHxZ7GwMfY70\n", "");
        let err = RouterStatusEntry::parse(&text, RouterStatusVersion::MicroV3, Strictness::Strict).unwrap_err();
        assert!(err.to_string().contains("missing mandatory fields: m"));

        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::MicroV3, Strictness::Permissive).unwrap();
        assert_eq!(None, entry.microdescriptor_digest);
        assert_eq!(vec!["m"], entry.unrecognized.missing());
    }

    #[test]
    fn test_unknown_content_is_kept() {
        let text = ENTRY_V3
            .replace("s Fast", "s Pancake Fast")
            .replace("Measured=1100", "Measured=1100 Hedgehog=4")
            + "zz top\n";
        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).unwrap();
        assert!(entry.flags.contains(&"Pancake".to_string()));
        assert_eq!(1, entry.unrecognized.of_kind(UnrecognizedKind::Flag).count());
        assert!(entry.unrecognized.contains("w Hedgehog=4"));
        assert_eq!(vec!["zz top"], entry.unrecognized.lines());
    }

    #[test]
    fn test_vote_entry_lines() {
        let text = ENTRY_V3.to_string()
            + "id ed25519 none\nm 13,14,15 sha256=uaAYTOVuYRqUwJpNfP2WizjzO0FiUvKq7sZyC8ZcX5o\n";
        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).unwrap();
        assert_eq!(Some("none".to_string()), entry.ed25519_identity);
        assert_eq!(vec![13, 14, 15], entry.microdescriptor_hashes[0].consensus_methods);
        assert!(entry.microdescriptor_hashes[0].digests.contains_key("sha256"));
    }

    #[test]
    fn test_bad_nickname() {
        let text = ENTRY_V3.replace("caerSidi", "caer_Sidi");
        let err = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).unwrap_err();
        assert!(err.to_string().contains("caer_Sidi"));

        // an entry without a usable r line can't be assembled at all
        assert!(RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive).is_err());
    }

    #[test]
    fn test_misplaced_r_line() {
        let text = "s Fast\n".to_string() + ENTRY_V3.replace("s Fast Named Running Stable Valid\n", "").as_str();
        let err = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).unwrap_err();
        assert!(err.to_string().contains("first line"));
    }

    #[test]
    fn test_malformed_bandwidth_is_deferred() {
        let text = ENTRY_V3.replace("Bandwidth=1234", "Bandwidth=lots");
        assert!(RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).is_err());

        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive).unwrap();
        assert_eq!(None, entry.bandwidth);
        assert_eq!(1, entry.unrecognized.of_kind(UnrecognizedKind::Deferred).count());
    }

    #[test]
    fn test_malformed_id_is_deferred() {
        let text = format!("{}id\n", ENTRY_V3);
        assert!(RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).is_err());

        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive).unwrap();
        assert_eq!(None, entry.ed25519_identity);
        assert_eq!(1, entry.unrecognized.of_kind(UnrecognizedKind::Deferred).count());

        let text = format!("{}id rsa1024 AAAA\n", ENTRY_V3);
        let entry = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict).unwrap();
        assert_eq!(None, entry.ed25519_identity);
        assert!(entry.unrecognized.contains("id rsa1024 AAAA"));
        assert_eq!(1, entry.unrecognized.of_kind(UnrecognizedKind::Value).count());
    }

    #[test]
    fn test_known_flags_string() {
        assert!(Flag::known_flags_string().starts_with("Authority BadExit"));
        assert_eq!(Flag::HSDir, "HSDir".parse().unwrap());
    }
}
