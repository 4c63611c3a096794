//! Version 2 network status documents, each published by a single
//! directory authority.

use std::net::IpAddr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::consensus::comma_list;
use crate::crypto::{sha1_fingerprint, RsaPublicKey};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SignatureError};
use crate::meta::{parse_timestamp, DescriptorLine, Document, Fingerprint, Item, Object};
use crate::router_status::{RouterStatusEntry, RouterStatusVersion};
use crate::schema::NETWORK_STATUS_V2;
use crate::unrecognized::{Section, Unrecognized};

//
// External dependencies
//
use chrono::{DateTime, Utc};
use log::debug;

/// Contents of the `dir-source` line
struct DirSource {
    hostname: String,
    address: IpAddr,
    dir_port: Option<u16>,
}

fn parse_dir_source(item: &Item) -> Result<DirSource, DocumentParseError> {
    let args = item.split_arguments()?;
    match args[..] {
        [hostname, address, dir_port, ..] => {
            let dir_port = dir_port.parse::<u16>().context("dir-source DirPort")?;
            Ok(DirSource {
                hostname: hostname.to_string(),
                address: address
                    .parse::<IpAddr>()
                    .map_err(|_| DocumentParseError::InvalidIpAddress(address.to_string()))?,
                dir_port: (dir_port != 0).then_some(dir_port),
            })
        }
        _ => Err(DocumentParseError::args_missing(item.keyword)),
    }
}

fn parse_version(item: &Item) -> Result<u32, DocumentParseError> {
    let version = item.get_argument()?.parse::<u32>().context("network status version")?;
    if version != 2 {
        return Err(DocumentParseError::shape(item.keyword, "2", item.arguments));
    }
    Ok(version)
}

/// A v2 network status document.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusDocumentV2 {
    pub version: Option<u32>,
    pub hostname: Option<String>,
    pub address: Option<IpAddr>,
    pub dir_port: Option<u16>,
    /// Identity of the publishing authority, the digest of its signing key
    pub fingerprint: Option<Fingerprint>,
    pub contact: Option<String>,
    pub signing_key: Option<RsaPublicKey>,
    pub client_versions: Vec<String>,
    pub server_versions: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    /// `dir-options` flags, such as `Names` or `Versions`
    pub options: Vec<String>,
    /// Nickname on the `directory-signature` line
    pub signing_authority: Option<String>,
    pub signature: Option<Object>,
    pub routers: Vec<RouterStatusEntry>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    pub signature_valid: Option<bool>,
}

impl NetworkStatusDocumentV2 {
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        Self::from_doc(&doc, strictness)
    }

    pub(crate) fn from_doc(doc: &Document, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let mut status = NetworkStatusDocumentV2 {
            version: None,
            hostname: None,
            address: None,
            dir_port: None,
            fingerprint: None,
            contact: None,
            signing_key: None,
            client_versions: Vec::new(),
            server_versions: Vec::new(),
            published: None,
            options: Vec::new(),
            signing_authority: None,
            signature: None,
            routers: Vec::new(),
            raw: doc.raw.to_string(),
            lines: doc.lines(),
            unrecognized: Unrecognized::new(),
            signature_valid: None,
        };

        // router status entries run from the first `r` line up to the signature
        let items = &doc.items;
        let first_router = items.iter().position(|i| i.keyword == "r");
        let footer = items
            .iter()
            .rposition(|i| i.keyword == "directory-signature")
            .unwrap_or(items.len());
        let routers = match first_router {
            Some(start) if start < footer => start..footer,
            _ => footer..footer,
        };

        let mut asm = Assembler::new(&NETWORK_STATUS_V2, strictness).in_section(Section::Header);
        asm.note_skipped(&doc.skipped);
        let document_items: Vec<&Item> = items[..routers.start].iter().chain(&items[routers.end..]).collect();
        let total = document_items.len();
        for (index, item) in document_items.into_iter().enumerate() {
            if asm.accept(item, index, total)?.is_some() {
                status.read_item(&mut asm, item)?;
            }
        }
        let mut unrecognized = asm.finish()?;

        let router_items = &items[routers];
        let mut starts: Vec<usize> = router_items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.keyword == "r")
            .map(|(index, _)| index)
            .collect();
        starts.push(router_items.len());
        for bounds in starts.windows(2) {
            let entry = RouterStatusEntry::from_items(
                doc.raw,
                &router_items[bounds[0]..bounds[1]],
                RouterStatusVersion::V2,
                strictness,
                &[],
            )?;
            unrecognized.absorb(entry.unrecognized.clone(), Section::Router);
            status.routers.push(entry);
        }

        status.unrecognized = unrecognized;
        debug!(
            "assembled v2 network status with {} router status entries",
            status.routers.len()
        );
        Ok(status)
    }

    fn read_item(&mut self, asm: &mut Assembler, item: &Item) -> Result<(), DocumentParseError> {
        match item.keyword {
            "network-status-version" => self.version = asm.defer(parse_version(item))?,
            "dir-source" => {
                if let Some(source) = asm.defer(parse_dir_source(item))? {
                    self.hostname = Some(source.hostname);
                    self.address = Some(source.address);
                    self.dir_port = source.dir_port;
                }
            }
            "fingerprint" => self.fingerprint = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?,
            "contact" => self.contact = item.arguments.map(String::from),
            "dir-signing-key" => {
                self.signing_key = asm.defer(item.get_object().and_then(RsaPublicKey::from_object))?
            }
            "client-versions" => self.client_versions = comma_list(item),
            "server-versions" => self.server_versions = comma_list(item),
            "published" => self.published = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
            "dir-options" => {
                self.options = item.arguments_or_empty().split_whitespace().map(String::from).collect()
            }
            "directory-signature" => {
                self.signing_authority = item.arguments.map(String::from);
                self.signature = item.object.clone();
            }
            _ => {}
        }
        Ok(())
    }

    /// Text covered by the signature: everything through the
    /// `directory-signature` line.
    pub fn signed_content(&self) -> Result<&str, DocumentParseError> {
        let not_found = || DocumentParseError::ContentRangeNotFound {
            from: "network-status-version".to_string(),
            to: "directory-signature".to_string(),
        };
        let start = self.raw.find("network-status-version").ok_or_else(not_found)?;
        let rest = &self.raw[start..];
        let signature_line = rest.find("\ndirectory-signature ").ok_or_else(not_found)? + 1;
        let end = match rest[signature_line..].find('\n') {
            Some(newline) => signature_line + newline + 1,
            None => rest.len(),
        };
        Ok(&rest[..end])
    }

    /// SHA-1 digest of the signed content
    pub fn digest(&self) -> Result<Fingerprint, DocumentParseError> {
        Ok(sha1_fingerprint(self.signed_content()?.as_bytes()))
    }

    /// Check the signature with the document's own `dir-signing-key`, which
    /// must also match the declared fingerprint.
    pub fn validate_signature(&self) -> Result<(), DocumentParseError> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| SignatureError::MissingKey("network status v2 (no dir-signing-key)".to_string()))?;
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
            .ok_or_else(|| SignatureError::MalformedSignature("no directory-signature block".to_string()))?;
        signing_key.verify_digest(&signature.decode()?, self.digest()?.as_bytes(), "network status v2")?;
        Ok(())
    }
}

impl SignedDocument for NetworkStatusDocumentV2 {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}
