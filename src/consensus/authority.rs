//! Directory authority entries of v3 network status documents

use std::net::IpAddr;
use std::str::FromStr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::error::{DocumentParseError, ErrorContext, SchemaViolation};
use crate::key_cert::KeyCertificate;
use crate::meta::{covered_text, DescriptorLine, Document, Fingerprint, Item};
use crate::router_status::is_valid_nickname;
use crate::schema::{Flavor, DIRECTORY_AUTHORITY};
use crate::unrecognized::{Section, Unrecognized};

use log::debug;

/// A `shared-rand-commit` line of a vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRandomnessCommitment {
    pub version: u32,
    pub algorithm: String,
    pub identity: Fingerprint,
    pub commit: String,
    /// Only present once the authority revealed its value
    pub reveal: Option<String>,
}

impl FromStr for SharedRandomnessCommitment {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_whitespace().collect::<Vec<_>>()[..] {
            [version, algorithm, identity, commit, ref rest @ ..] => Ok(SharedRandomnessCommitment {
                version: version.parse::<u32>().context("shared-rand-commit version")?,
                algorithm: algorithm.to_string(),
                identity: Fingerprint::from_str_hex(identity)?,
                commit: commit.to_string(),
                reveal: rest.first().map(|r| r.to_string()),
            }),
            _ => Err(DocumentParseError::args_missing("shared-rand-commit")),
        }
    }
}

/// A `shared-rand-previous-value` or `shared-rand-current-value` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRandomness {
    pub reveals: u32,
    pub value: String,
}

impl FromStr for SharedRandomness {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_whitespace().collect::<Vec<_>>()[..] {
            [reveals, value, ..] => Ok(SharedRandomness {
                reveals: reveals.parse::<u32>().context("shared randomness reveal count")?,
                value: value.to_string(),
            }),
            _ => Err(DocumentParseError::args_missing("shared-rand-value")),
        }
    }
}

/// Contents of the `dir-source` line
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirSource {
    nickname: String,
    identity: Fingerprint,
    hostname: String,
    address: IpAddr,
    dir_port: Option<u16>,
    or_port: u16,
}

fn parse_dir_source(item: &Item) -> Result<DirSource, DocumentParseError> {
    let args = item.split_arguments()?;
    let (nickname, identity, hostname, address, dir_port, or_port) = match args[..] {
        [nickname, identity, hostname, address, dir_port, or_port, ..] => {
            (nickname, identity, hostname, address, dir_port, or_port)
        }
        _ => return Err(DocumentParseError::args_missing(item.keyword)),
    };
    if !is_valid_nickname(nickname.trim_end_matches("-legacy")) {
        return Err(DocumentParseError::shape(
            item.keyword,
            "a nickname of 1-19 alphanumeric characters",
            Some(nickname),
        ));
    }
    let dir_port = dir_port.parse::<u16>().context("authority DirPort")?;
    Ok(DirSource {
        nickname: nickname.to_string(),
        identity: Fingerprint::from_str_hex(identity)?,
        hostname: hostname.to_string(),
        address: address
            .parse::<IpAddr>()
            .map_err(|_| DocumentParseError::InvalidIpAddress(address.to_string()))?,
        dir_port: (dir_port != 0).then_some(dir_port),
        or_port: or_port.parse::<u16>().context("authority ORPort")?,
    })
}

/// An authority's section of a vote or consensus.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryAuthority {
    pub nickname: String,
    /// v3 identity fingerprint
    pub identity: Fingerprint,
    pub hostname: String,
    pub address: IpAddr,
    pub dir_port: Option<u16>,
    pub or_port: u16,
    /// Legacy entries carry a `-legacy` nickname suffix and few other fields
    pub is_legacy: bool,
    pub contact: Option<String>,
    pub legacy_dir_key: Option<Fingerprint>,
    /// Digest of the authority's vote, in consensuses
    pub vote_digest: Option<Fingerprint>,
    pub shared_randomness_participate: bool,
    pub shared_randomness_commitments: Vec<SharedRandomnessCommitment>,
    pub shared_randomness_previous: Option<SharedRandomness>,
    pub shared_randomness_current: Option<SharedRandomness>,
    /// The authority's key certificate, which votes embed
    pub key_certificate: Option<KeyCertificate>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
}

impl DirectoryAuthority {
    /// Parse a standalone authority entry of a vote (`is_vote`) or consensus.
    pub fn parse(text: &str, is_vote: bool, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        let flavor = if is_vote { Flavor::Vote } else { Flavor::Consensus };
        let mut authority = Self::from_items(text, &doc.items, flavor, strictness, &doc.skipped)?;
        authority.raw = text.to_string();
        Ok(authority)
    }

    /// Assemble an entry from items lexed out of `source`.
    pub(crate) fn from_items(
        source: &str,
        items: &[Item],
        flavor: Flavor,
        strictness: Strictness,
        skipped: &[String],
    ) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&DIRECTORY_AUTHORITY, strictness).with_flavor(flavor);
        asm.note_skipped(skipped);

        // votes append the authority's key certificate
        let cert_start = items
            .iter()
            .position(|i| i.keyword == "dir-key-certificate-version")
            .unwrap_or(items.len());
        let (entry_items, cert_items) = items.split_at(cert_start);

        let mut dir_source = None;
        let mut contact = None;
        let mut legacy_dir_key = None;
        let mut vote_digest = None;
        let mut participate = false;
        let mut commitments = Vec::new();
        let mut previous = None;
        let mut current = None;

        let total = entry_items.len();
        for (index, item) in entry_items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "dir-source" => dir_source = asm.defer(parse_dir_source(item))?,
                "contact" => contact = item.arguments.map(String::from),
                "legacy-dir-key" => {
                    legacy_dir_key = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?
                }
                "vote-digest" => vote_digest = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?,
                "shared-rand-participate" => participate = true,
                "shared-rand-commit" => {
                    if let Some(commitment) = asm.defer(item.arguments_or_empty().parse())? {
                        commitments.push(commitment);
                    }
                }
                "shared-rand-previous-value" => previous = asm.defer(item.arguments_or_empty().parse())?,
                "shared-rand-current-value" => current = asm.defer(item.arguments_or_empty().parse())?,
                _ => {}
            }
        }

        let dir_source: DirSource = match dir_source {
            Some(dir_source) => dir_source,
            None => {
                return Err(SchemaViolation::Missing {
                    dialect: DIRECTORY_AUTHORITY.dialect,
                    keywords: vec!["dir-source".to_string()],
                }
                .into())
            }
        };
        let is_legacy = dir_source.nickname.ends_with("-legacy");
        if is_legacy {
            asm.exempt("contact");
            asm.exempt("vote-digest");
        }

        let key_certificate = if cert_items.is_empty() {
            if flavor == Flavor::Vote && !is_legacy {
                asm.require("dir-key-certificate-version");
            }
            None
        } else if flavor == Flavor::Consensus {
            asm.complain(SchemaViolation::Disallowed {
                dialect: DIRECTORY_AUTHORITY.dialect,
                keyword: "dir-key-certificate-version".to_string(),
                reason: "consensus authority entries can't have a key certificate".to_string(),
            })?;
            None
        } else {
            let cert = KeyCertificate::from_items(source, cert_items, strictness, &[])?;
            asm.absorb(cert.unrecognized.clone(), Section::Authority);
            Some(cert)
        };

        let unrecognized = asm.finish()?;
        debug!("assembled directory authority entry for {}", dir_source.nickname);
        Ok(DirectoryAuthority {
            nickname: dir_source.nickname,
            identity: dir_source.identity,
            hostname: dir_source.hostname,
            address: dir_source.address,
            dir_port: dir_source.dir_port,
            or_port: dir_source.or_port,
            is_legacy,
            contact,
            legacy_dir_key,
            vote_digest,
            shared_randomness_participate: participate,
            shared_randomness_commitments: commitments,
            shared_randomness_previous: previous,
            shared_randomness_current: current,
            key_certificate,
            raw: covered_text(source, items).to_string(),
            lines: items.iter().map(Item::to_line).collect(),
            unrecognized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unrecognized::UnrecognizedKind;

    const CONSENSUS_ENTRY: &str = "dir-source moria1 D586D18309DED4CD6D57C18FDB97EFA96D330566 128.31.0.34 128.31.0.34 9131 9101
contact 1024D/28988BF5 arma mit edu
vote-digest 49015F787433103580E3B66A1707A00E60F2D15B
";

    const LEGACY_ENTRY: &str = "dir-source moria1-legacy 81349FC1F2DBA2C2C11B45CB9706637D480AB913 128.31.0.34 128.31.0.34 9131 9101
";

    const KEY: &str = "-----BEGIN RSA PUBLIC KEY-----
MEgCQQCwEy+3emMwCGjCAs7i9NS0esui4IA6LcRIDNPo9JWNDMgbvshEfgTJb3os
1zmQKSSuF60d+IPfeTSG9BRPOeehAgMBAAE=
-----END RSA PUBLIC KEY-----";

    fn vote_entry() -> String {
        format!(
            "dir-source moria1 D586D18309DED4CD6D57C18FDB97EFA96D330566 128.31.0.34 128.31.0.34 9131 9101
contact 1024D/28988BF5 arma mit edu
shared-rand-participate
shared-rand-commit 1 sha3-256 D586D18309DED4CD6D57C18FDB97EFA96D330566 AAAAAFd4/kAaklgYr4ijHZjXXy/B354jQfL31BFhhE46nuOHSPITyw==
dir-key-certificate-version 3
fingerprint D586D18309DED4CD6D57C18FDB97EFA96D330566
dir-key-published 2017-05-25 04:45:52
dir-key-expires 2018-05-25 04:45:52
dir-identity-key
{KEY}
dir-signing-key
{KEY}
dir-key-certification
-----BEGIN SIGNATURE-----
AAAA
-----END SIGNATURE-----
"
        )
    }

    #[test]
    fn test_consensus_entry() {
        let authority = DirectoryAuthority::parse(CONSENSUS_ENTRY, false, Strictness::Strict).unwrap();
        assert_eq!("moria1", authority.nickname);
        assert_eq!(
            "D586D18309DED4CD6D57C18FDB97EFA96D330566",
            authority.identity.to_string()
        );
        assert_eq!("128.31.0.34", authority.address.to_string());
        assert_eq!(Some(9131), authority.dir_port);
        assert_eq!(9101, authority.or_port);
        assert!(!authority.is_legacy);
        assert_eq!(Some("1024D/28988BF5 arma mit edu"), authority.contact.as_deref());
        assert_eq!(
            "49015F787433103580E3B66A1707A00E60F2D15B",
            authority.vote_digest.unwrap().to_string()
        );
        assert!(authority.key_certificate.is_none());
        assert!(authority.unrecognized.is_empty());
        assert_eq!(CONSENSUS_ENTRY, authority.raw);
    }

    #[test]
    fn test_missing_vote_digest() {
        let text = CONSENSUS_ENTRY.replace("vote-digest 49015F787433103580E3B66A1707A00E60F2D15B\n", "");
        let err = DirectoryAuthority::parse(&text, false, Strictness::Strict).unwrap_err();
        match err {
            DocumentParseError::Schema(SchemaViolation::Missing { keywords, .. }) => {
                assert_eq!(vec!["vote-digest".to_string()], keywords)
            }
            other => panic!("unexpected error: {}", other),
        }

        let authority = DirectoryAuthority::parse(&text, false, Strictness::Permissive).unwrap();
        assert_eq!(None, authority.vote_digest);
        assert_eq!(vec!["vote-digest"], authority.unrecognized.missing());
    }

    #[test]
    fn test_legacy_entry() {
        let authority = DirectoryAuthority::parse(LEGACY_ENTRY, false, Strictness::Strict).unwrap();
        assert!(authority.is_legacy);
        assert_eq!("moria1-legacy", authority.nickname);
        assert!(authority.contact.is_none());
        assert!(authority.vote_digest.is_none());
    }

    #[test]
    fn test_missing_dir_source_is_fatal() {
        let text = "contact someone\nvote-digest 49015F787433103580E3B66A1707A00E60F2D15B\n";
        assert!(DirectoryAuthority::parse(text, false, Strictness::Strict).is_err());
        assert!(DirectoryAuthority::parse(text, false, Strictness::Permissive).is_err());
    }

    #[test]
    fn test_vote_entry_with_certificate() {
        let text = vote_entry();
        let authority = DirectoryAuthority::parse(&text, true, Strictness::Strict).unwrap();
        assert!(authority.shared_randomness_participate);
        assert_eq!(1, authority.shared_randomness_commitments.len());
        let commitment = &authority.shared_randomness_commitments[0];
        assert_eq!("sha3-256", commitment.algorithm);
        assert!(commitment.reveal.is_none());

        let cert = authority.key_certificate.unwrap();
        assert_eq!(Some(authority.identity), cert.fingerprint);
        assert!(cert.raw.starts_with("dir-key-certificate-version 3\n"));
        assert!(cert.raw.ends_with("-----END SIGNATURE-----\n"));
    }

    #[test]
    fn test_vote_entry_needs_certificate() {
        let text = vote_entry();
        let entry_only = &text[..text.find("dir-key-certificate-version").unwrap()];
        let err = DirectoryAuthority::parse(entry_only, true, Strictness::Strict).unwrap_err();
        assert!(err.to_string().contains("dir-key-certificate-version"));
    }

    #[test]
    fn test_vote_digest_disallowed_in_votes() {
        let err = DirectoryAuthority::parse(CONSENSUS_ENTRY, true, Strictness::Strict).unwrap_err();
        assert!(matches!(err, DocumentParseError::Schema(SchemaViolation::Disallowed { .. })));

        let text = format!("{}{}", CONSENSUS_ENTRY, &vote_entry()[vote_entry().find("dir-key").unwrap()..]);
        let authority = DirectoryAuthority::parse(&text, true, Strictness::Permissive).unwrap();
        assert!(authority.vote_digest.is_none());
        assert_eq!(1, authority.unrecognized.of_kind(UnrecognizedKind::Deferred).count());
    }
}
