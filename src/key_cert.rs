//! Directory key certificates, which bind an authority's medium-term
//! signing key to its long-term identity key.

use std::net::IpAddr;

use crate::assembler::Assembler;
use crate::config::Strictness;
use crate::crypto::{digest_range, sha1_fingerprint, DigestAlgorithm, RsaPublicKey};
use crate::document::SignedDocument;
use crate::error::{DocumentParseError, ErrorContext, SignatureError};
use crate::meta::{covered_text, parse_timestamp, DescriptorLine, Document, Fingerprint, Item, Object};
use crate::schema::KEY_CERTIFICATE;
use crate::unrecognized::Unrecognized;

//
// External dependencies
//
use chrono::{DateTime, Utc};
use log::debug;

/// A `dir-key-certificate-version 3` document.
///
/// Mandatory fields are `None` only when parsed permissively without them.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCertificate {
    pub version: Option<u32>,
    pub address: Option<IpAddr>,
    pub dir_port: Option<u16>,
    /// The authority's identity fingerprint, as declared
    pub fingerprint: Option<Fingerprint>,
    pub identity_key: Option<RsaPublicKey>,
    pub published: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub signing_key: Option<RsaPublicKey>,
    /// Signature of the identity fingerprint made with the signing key
    pub crosscert: Option<Object>,
    /// Signature of the certificate made with the identity key
    pub certification: Option<Object>,
    pub raw: String,
    pub lines: Vec<DescriptorLine>,
    pub unrecognized: Unrecognized,
    pub signature_valid: Option<bool>,
}

fn parse_dir_address(item: &Item) -> Result<(IpAddr, u16), DocumentParseError> {
    let arg = item.get_argument()?;
    let (address, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| DocumentParseError::shape(item.keyword, "IP:port", Some(arg)))?;
    let address = address
        .parse::<IpAddr>()
        .map_err(|_| DocumentParseError::InvalidIpAddress(address.to_string()))?;
    Ok((address, port.parse::<u16>().context("dir-address port")?))
}

fn parse_version(item: &Item) -> Result<u32, DocumentParseError> {
    let version = item.get_argument()?.parse::<u32>().context("certificate version")?;
    if version != 3 {
        return Err(DocumentParseError::shape(
            item.keyword,
            "3",
            item.arguments,
        ));
    }
    Ok(version)
}

impl KeyCertificate {
    pub fn parse(text: &str, strictness: Strictness) -> Result<Self, DocumentParseError> {
        let doc = Document::parse(text, strictness)?;
        let mut cert = Self::from_items(text, &doc.items, strictness, &doc.skipped)?;
        cert.raw = text.to_string();
        Ok(cert)
    }

    /// Assemble a certificate from items lexed out of `source`.
    pub(crate) fn from_items(
        source: &str,
        items: &[Item],
        strictness: Strictness,
        skipped: &[String],
    ) -> Result<Self, DocumentParseError> {
        let mut asm = Assembler::new(&KEY_CERTIFICATE, strictness);
        asm.note_skipped(skipped);
        let mut cert = KeyCertificate {
            version: None,
            address: None,
            dir_port: None,
            fingerprint: None,
            identity_key: None,
            published: None,
            expires: None,
            signing_key: None,
            crosscert: None,
            certification: None,
            raw: covered_text(source, items).to_string(),
            lines: items.iter().map(Item::to_line).collect(),
            unrecognized: Unrecognized::new(),
            signature_valid: None,
        };

        let total = items.len();
        for (index, item) in items.iter().enumerate() {
            if asm.accept(item, index, total)?.is_none() {
                continue;
            }
            match item.keyword {
                "dir-key-certificate-version" => cert.version = asm.defer(parse_version(item))?,
                "dir-address" => {
                    if let Some((address, port)) = asm.defer(parse_dir_address(item))? {
                        cert.address = Some(address);
                        cert.dir_port = Some(port);
                    }
                }
                "fingerprint" => {
                    cert.fingerprint = asm.defer(Fingerprint::from_str_hex(item.arguments_or_empty()))?
                }
                "dir-identity-key" => {
                    cert.identity_key = asm.defer(RsaPublicKey::from_object(item.get_object()?))?
                }
                "dir-signing-key" => {
                    cert.signing_key = asm.defer(RsaPublicKey::from_object(item.get_object()?))?
                }
                "dir-key-published" => cert.published = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
                "dir-key-expires" => cert.expires = asm.defer(parse_timestamp(item.arguments_or_empty()))?,
                "dir-key-crosscert" => cert.crosscert = item.object.clone(),
                "dir-key-certification" => cert.certification = item.object.clone(),
                _ => {}
            }
        }

        cert.unrecognized = asm.finish()?;
        debug!(
            "assembled key certificate for {}",
            cert.fingerprint.map(|f| f.to_string()).unwrap_or_default()
        );
        Ok(cert)
    }

    pub fn is_expired(&self) -> bool {
        self.expires.map_or(false, |expires| Utc::now() > expires)
    }

    /// SHA-1 of the signing key, as referenced by `directory-signature` lines
    pub fn signing_key_digest(&self) -> Option<Fingerprint> {
        self.signing_key.as_ref().map(RsaPublicKey::fingerprint)
    }

    /// Check the fingerprint, the certification and the cross-certification.
    pub fn validate_signature(&self) -> Result<(), DocumentParseError> {
        let identity_key = self
            .identity_key
            .as_ref()
            .ok_or_else(|| SignatureError::MissingKey("key certificate (no dir-identity-key)".to_string()))?;
        let computed = identity_key.fingerprint();
        if let Some(declared) = self.fingerprint {
            if declared != computed {
                return Err(SignatureError::FingerprintMismatch {
                    declared: declared.to_string(),
                    computed: computed.to_string(),
                }
                .into());
            }
        }

        let certification = self
            .certification
            .as_ref()
            .ok_or_else(|| SignatureError::MalformedSignature("no dir-key-certification".to_string()))?;
        let local = digest_range(
            &self.raw,
            "dir-key-certificate-version",
            "dir-key-certification\n",
            DigestAlgorithm::Sha1,
        )?;
        identity_key.verify_digest(&certification.decode()?, &local, "key certificate")?;

        if let Some(crosscert) = &self.crosscert {
            let signing_key = self
                .signing_key
                .as_ref()
                .ok_or_else(|| SignatureError::MissingKey("key certificate crosscert".to_string()))?;
            signing_key.verify_digest(&crosscert.decode()?, computed.as_bytes(), "key certificate crosscert")?;
        }
        Ok(())
    }

    /// SHA-1 identity fingerprint computed from the identity key
    pub fn computed_fingerprint(&self) -> Option<Fingerprint> {
        self.identity_key.as_ref().map(|k| sha1_fingerprint(k.der()))
    }
}

impl SignedDocument for KeyCertificate {
    fn signature_valid(&self) -> Option<bool> {
        self.signature_valid
    }

    fn set_signature_valid(&mut self, valid: bool) {
        self.signature_valid = Some(valid);
    }
}
