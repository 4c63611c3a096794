//! Extra-info descriptors, the statistics relays publish alongside their
//! server descriptors.

use std::collections::BTreeMap;

use crate::assembler::Assembler;
use crate::certificate::Ed25519Certificate;
use crate::config::Strictness;
use crate::crypto::{sha1_fingerprint, RsaPublicKey};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SignatureError};
use crate::meta::{content_between, parse_timestamp, DescriptorLine, Document, Fingerprint, Item, Object};
use crate::router_status::is_valid_nickname;
use crate::schema::EXTRA_INFO;
use crate::unrecognized::{Unrecognized, UnrecognizedKind};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use log::debug;

/// End of a measurement period and its length in seconds, as in
/// `2012-05-05 17:02:45 (900 s)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsPeriod {
    pub end: DateTime<Utc>,
    pub interval: u32,
}

/// Bytes transferred in each interval, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthHistory {
    pub period: StatsPeriod,
    pub values: Vec<u64>,
}

/// Connection counts from a `conn-bi-direct` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnBiDirect {
    pub period: StatsPeriod,
    /// Connections with too little traffic to be classified
    pub below: u64,
    pub read: u64,
    pub write: u64,
    pub both: u64,
}

/// Split `YYYY-MM-DD HH:MM:SS (NSEC s) rest` into the period and the rest.
fn parse_period<'a>(item: &Item<'a>) -> Result<(StatsPeriod, Vec<&'a str>), DocumentParseError> {
    let args = item.split_arguments()?;
    match args[..] {
        [date, time, interval, unit, ref rest @ ..] => {
            let interval = interval
                .strip_prefix('(')
                .filter(|_| unit == "s)")
                .ok_or_else(|| DocumentParseError::shape(item.keyword, "'(N s)' interval", item.arguments))?;
            let period = StatsPeriod {
                end: parse_timestamp(&format!("{} {}", date, time))?,
                interval: interval.parse::<u32>().context(format!("{} interval", item.keyword))?,
            };
            Ok((period, rest.to_vec()))
        }
        _ => Err(DocumentParseError::shape(
            item.keyword,
            "a timestamp and '(N s)' interval",
            item.arguments,
        )),
    }
}

fn parse_history(item: &Item) -> Result<BandwidthHistory, DocumentParseError> {
    let (period, rest) = parse_period(item)?;
    let values = match rest.first() {
        Some(values) => values
            .split(',')
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<u64>().context(item.keyword))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    Ok(BandwidthHistory { period, values })
}

fn parse_conn_bi_direct(item: &Item) -> Result<ConnBiDirect, DocumentParseError> {
    let (period, rest) = parse_period(item)?;
    let counts = match rest.first() {
        Some(counts) => counts
            .split(',')
            .map(|c| c.parse::<u64>().context("conn-bi-direct"))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    match counts[..] {
        [below, read, write, both] => Ok(ConnBiDirect {
            period,
            below,
            read,
            write,
            both,
        }),
        _ => Err(DocumentParseError::shape(item.keyword, "four comma separated counts", item.arguments)),
    }
}

fn parse_extra_info_line(item: &Item) -> Result<(String, Fingerprint), DocumentParseError> {
    let args = item.split_arguments()?;
    match args[..] {
        [nickname, fingerprint, ..] => {
            if !is_valid_nickname(nickname) {
                return Err(DocumentParseError::shape(
                    item.keyword,
                    "a nickname of 1-19 alphanumeric characters",
                    Some(nickname),
                ));
            }
            Ok((nickname.to_string(), Fingerprint::from_str_hex(fingerprint)?))
        }
        _ => Err(DocumentParseError::args_missing(item.keyword)),
    }
}

/// An extra-info descriptor.
///
/// Statistics lines other than the bandwidth histories are kept as written
/// in [`statistics`](Self::statistics), keyed by their keyword.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraInfoDescriptor {
    pub nickname: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub published: Option<DateTime<Utc>>,
    pub ed25519_certificate: Option<Ed25519Certificate>,
    pub geoip_db_digest: Option<Fingerprint>,
    pub geoip6_db_digest: Option<Fingerprint>,
    /// Pluggable transport lines, `name address:port [args]`
    pub transports: Vec<String>,
    pub read_history: Option<BandwidthHistory>,
    pub write_history: Option<BandwidthHistory>,
    pub dir_read_history: Option<BandwidthHistory>,
    pub dir_write_history: Option<BandwidthHistory>,
    pub conn_bi_direct: Option<ConnBiDirect>,
    /// Periods of the `*-stats-end` lines
    pub stats_periods: BTreeMap<String, StatsPeriod>,
    pub statistics: BTreeMap<String, String>,
    /// Digests of the matching server descriptor, in bridge descriptors
    pub router_digest: Option<Fingerprint>,
    pub router_digest_sha256: Option<String>,
    pub ed25519_signature: Option<String>,
    pub signature: Option<Object>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    pub signature_valid: Option<bool>,
}

impl ExtraInfoDescriptor {
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&EXTRA_INFO, strictness);
        asm.note_skipped(&doc.skipped);
        let mut desc = ExtraInfoDescriptor {
            nickname: None,
            fingerprint: None,
            published: None,
            ed25519_certificate: None,
            geoip_db_digest: None,
            geoip6_db_digest: None,
            transports: Vec::new(),
            read_history: None,
            write_history: None,
            dir_read_history: None,
            dir_write_history: None,
            conn_bi_direct: None,
            stats_periods: BTreeMap::new(),
            statistics: BTreeMap::new(),
            router_digest: None,
            router_digest_sha256: None,
            ed25519_signature: None,
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
                "extra-info" => {
                    if let Some((nickname, fingerprint)) = asm.defer(parse_extra_info_line(item))? {
                        desc.nickname = Some(nickname);
                        desc.fingerprint = Some(fingerprint);
                    }
                }
                "identity-ed25519" => {
                    let certificate = item
                        .get_object()
                        .and_then(|o| Ed25519Certificate::parse(&o.text).map_err(DocumentParseError::from));
                    desc.ed25519_certificate = asm.defer(certificate)?;
                }
                "published" => desc.published = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
                "geoip-db-digest" => {
                    desc.geoip_db_digest = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?
                }
                "geoip6-db-digest" => {
                    desc.geoip6_db_digest = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?
                }
                "transport" => desc.transports.push(item.arguments_or_empty().to_string()),
                "read-history" => desc.read_history = asm.defer(parse_history(item))?,
                "write-history" => desc.write_history = asm.defer(parse_history(item))?,
                "dirreq-read-history" => desc.dir_read_history = asm.defer(parse_history(item))?,
                "dirreq-write-history" => desc.dir_write_history = asm.defer(parse_history(item))?,
                "conn-bi-direct" => desc.conn_bi_direct = asm.defer(parse_conn_bi_direct(item))?,
                "router-digest" => {
                    desc.router_digest = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?
                }
                "router-digest-sha256" => desc.router_digest_sha256 = item.arguments.map(String::from),
                "router-sig-ed25519" => desc.ed25519_signature = item.arguments.map(String::from),
                "router-signature" => desc.signature = item.object.clone(),
                keyword if keyword.ends_with("-stats-end") => {
                    if let Some((period, rest)) = asm.defer(parse_period(item))? {
                        if !rest.is_empty() {
                            asm.record(UnrecognizedKind::Value, item.content());
                        }
                        desc.stats_periods.insert(keyword.to_string(), period);
                    }
                }
                keyword => {
                    desc.statistics
                        .insert(keyword.to_string(), item.arguments_or_empty().to_string());
                }
            }
        }

        desc.unrecognized = asm.finish()?;
        debug!(
            "assembled extra-info descriptor for {}",
            desc.nickname.as_deref().unwrap_or("<unnamed>")
        );
        Ok(desc)
    }

    /// A comma separated `key=value` statistics line, such as
    /// `dirreq-v3-resp` or `bridge-ips`, as a map.
    pub fn statistic_map(&self, keyword: &str) -> Result<Option<BTreeMap<&str, &str>>, DocumentParseError> {
        let arguments = match self.statistics.get(keyword) {
            Some(arguments) => arguments,
            None => return Ok(None),
        };
        arguments
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .split_once('=')
                    .ok_or_else(|| DocumentParseError::InvalidArgumentDict { raw: entry.to_string() })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Some)
    }

    /// Text signed by `router-signature`
    pub fn signed_content(&self) -> Result<&str, DocumentParseError> {
        content_between(&self.raw, "extra-info", "\nrouter-signature\n")
    }

    /// SHA-1 digest of the signed content
    pub fn digest(&self) -> Result<Fingerprint, DocumentParseError> {
        Ok(sha1_fingerprint(self.signed_content()?.as_bytes()))
    }

    /// Check `router-signature` with the relay's signing key, taken from its
    /// server descriptor.
    pub fn validate_signature(&self, signing_key: &RsaPublicKey) -> Result<(), DocumentParseError> {
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
        signing_key.verify_digest(&signature.decode()?, self.digest()?.as_bytes(), "extra-info descriptor")?;
        Ok(())
    }
}

impl SignedDocument for ExtraInfoDescriptor {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = "extra-info NINJA B2289C3EAB83ECD6EB916A2F481A02E6B76A0A48
published 2012-05-05 17:03:50
write-history 2012-05-05 17:02:45 (900 s) 1082368,19456,50176,272384,485376
read-history 2012-05-05 17:02:45 (900 s) 3309568,9216,41984,27648,123904
dirreq-write-history 2012-05-05 17:02:45 (900 s) 0,0,0,227328,349184
dirreq-read-history 2012-05-05 17:02:45 (900 s)
geoip-db-digest 2AE5BC6CFA1B0A1EB4B5D3FE1A7C07C34D6E4C98
dirreq-stats-end 2012-05-03 12:07:50 (86400 s)
dirreq-v3-resp ok=72,not-enough-sigs=0,unavailable=0,not-found=0,not-modified=0,busy=0
bridge-ips de=8,us=8
conn-bi-direct 2012-05-03 12:07:50 (500 s) 277431,12089,0,2134
router-signature
-----BEGIN SIGNATURE-----
AAAA
-----END SIGNATURE-----
";

    #[test]
    fn test_fields() {
        let desc = ExtraInfoDescriptor::parse(DESCRIPTOR, Strictness::Strict).unwrap();
        assert_eq!(Some("NINJA"), desc.nickname.as_deref());
        assert_eq!(
            "B2289C3EAB83ECD6EB916A2F481A02E6B76A0A48",
            desc.fingerprint.unwrap().to_string()
        );
        assert_eq!("2012-05-05 17:03:50 UTC", desc.published.unwrap().to_string());

        let read = desc.read_history.as_ref().unwrap();
        assert_eq!(900, read.period.interval);
        assert_eq!("2012-05-05 17:02:45 UTC", read.period.end.to_string());
        assert_eq!(vec![3309568, 9216, 41984, 27648, 123904], read.values);
        assert!(desc.dir_read_history.as_ref().unwrap().values.is_empty());

        let conn = desc.conn_bi_direct.unwrap();
        assert_eq!((500, 277431, 2134), (conn.period.interval, conn.below, conn.both));
        assert_eq!(86400, desc.stats_periods["dirreq-stats-end"].interval);
        assert!(desc.unrecognized.is_empty());
    }

    #[test]
    fn test_statistic_map() {
        let desc = ExtraInfoDescriptor::parse(DESCRIPTOR, Strictness::Strict).unwrap();
        let ips = desc.statistic_map("bridge-ips").unwrap().unwrap();
        assert_eq!(Some(&"8"), ips.get("de"));
        assert_eq!(2, ips.len());
        let responses = desc.statistic_map("dirreq-v3-resp").unwrap().unwrap();
        assert_eq!("72", responses["ok"]);
        assert_eq!("0", responses["not-found"]);
        assert_eq!(None, desc.statistic_map("entry-ips").unwrap());
    }

    #[test]
    fn test_signed_content() {
        let desc = ExtraInfoDescriptor::parse(DESCRIPTOR, Strictness::Strict).unwrap();
        assert!(desc.signed_content().unwrap().ends_with("2134\nrouter-signature\n"));
    }

    #[test]
    fn test_unrecognized_line() {
        let text = DESCRIPTOR.replace("published", "pepperjack is oh so tasty!\npublished");
        let desc = ExtraInfoDescriptor::parse(&text, Strictness::Strict).unwrap();
        assert_eq!(vec!["pepperjack is oh so tasty!"], desc.unrecognized.lines());
    }

    #[test]
    fn test_malformed_history() {
        let text = DESCRIPTOR.replace("(900 s) 3309568", "(900s) 3309568");
        assert!(ExtraInfoDescriptor::parse(&text, Strictness::Strict).is_err());

        let desc = ExtraInfoDescriptor::parse(&text, Strictness::Permissive).unwrap();
        assert!(desc.read_history.is_none());
        assert!(desc.write_history.is_some());
    }

    #[test]
    fn test_missing_extra_info_line() {
        let text = DESCRIPTOR.replace("extra-info NINJA B2289C3EAB83ECD6EB916A2F481A02E6B76A0A48\n", "");
        let err = ExtraInfoDescriptor::parse(&text, Strictness::Strict).unwrap_err();
        assert!(err.to_string().contains("extra-info"));

        let desc = ExtraInfoDescriptor::parse(&text, Strictness::Permissive).unwrap();
        assert_eq!(None, desc.nickname);
        assert_eq!(vec!["extra-info"], desc.unrecognized.missing());
    }
}
