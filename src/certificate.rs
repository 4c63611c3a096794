//! Ed25519 certificates, as embedded in server descriptors.
//!
//! Layout of a version 1 certificate:
//!
//! ```text
//! version:1 cert_type:1 expiration_hours:4 key_type:1 key:32 ext_count:1
//!   [ext_length:2 ext_type:1 ext_flags:1 ext_data:ext_length]*
//! signature:64
//! ```

use std::fmt;

use crate::crypto::{verify_ed25519, DigestAlgorithm};
use crate::descriptor::ServerDescriptor;
use crate::error::{CertificateFormatError, DocumentParseError, SignatureError};
use crate::meta::object::{self, decode_base64};

//
// External dependencies
//
use chrono::{DateTime, TimeZone, Utc};
use log::debug;

pub const ED25519_KEY_LENGTH: usize = 32;
pub const ED25519_HEADER_LENGTH: usize = 40;
pub const ED25519_SIGNATURE_LENGTH: usize = 64;

/// Prefix hashed together with a server descriptor for `router-sig-ed25519`
pub const ROUTER_SIGNATURE_PREFIX: &[u8] = b"Tor router descriptor signature v1";

/// Purpose of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertType {
    /// Signing key certified by a relay's identity key (4)
    Signing,
    /// TLS link certificate signed by the signing key (5)
    LinkCert,
    /// Authentication key signed by the signing key (6)
    Auth,
    /// A type defined after this parser was written (8 and above)
    Other(u8),
}

impl CertType {
    fn from_int(value: u8) -> Result<CertType, CertificateFormatError> {
        match value {
            0..=3 => Err(CertificateFormatError::ReservedForCertsCells(value)),
            4 => Ok(CertType::Signing),
            5 => Ok(CertType::LinkCert),
            6 => Ok(CertType::Auth),
            7 => Err(CertificateFormatError::ReservedForCrossCertification),
            other => Ok(CertType::Other(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    /// Carries the 32 byte key that signed the certificate
    HasSigningKey,
    Other(u8),
}

impl From<u8> for ExtensionType {
    fn from(value: u8) -> Self {
        match value {
            4 => ExtensionType::HasSigningKey,
            other => ExtensionType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionFlag {
    /// The certificate must not be trusted unless this extension is understood
    AffectsValidation,
    /// Some bit other than `AffectsValidation` was set
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Extension {
    pub ext_type: ExtensionType,
    pub type_int: u8,
    pub flag_int: u8,
    pub flags: Vec<ExtensionFlag>,
    pub data: Vec<u8>,
}

impl Ed25519Extension {
    pub fn new(type_int: u8, flag_int: u8, data: Vec<u8>) -> Result<Self, CertificateFormatError> {
        let ext_type = ExtensionType::from(type_int);
        if ext_type == ExtensionType::HasSigningKey && data.len() != ED25519_KEY_LENGTH {
            return Err(CertificateFormatError::SigningKeyLength(data.len()));
        }

        let mut flags = Vec::new();
        if flag_int & 1 == 1 {
            flags.push(ExtensionFlag::AffectsValidation);
        }
        if flag_int & !1 != 0 {
            flags.push(ExtensionFlag::Unknown);
        }

        Ok(Ed25519Extension {
            ext_type,
            type_int,
            flag_int,
            flags,
            data,
        })
    }

    /// Split one extension off the front of `content`.
    fn pop(content: &[u8]) -> Result<(Self, &[u8]), CertificateFormatError> {
        if content.len() < 4 {
            return Err(CertificateFormatError::ExtensionHeaderMissing);
        }
        let declared = u16::from_be_bytes([content[0], content[1]]) as usize;
        let (type_int, flag_int) = (content[2], content[3]);
        let content = &content[4..];

        if content.len() < declared {
            return Err(CertificateFormatError::TruncatedExtension {
                declared,
                available: content.len(),
            });
        }
        let (data, rest) = content.split_at(declared);
        Ok((Self::new(type_int, flag_int, data.to_vec())?, rest))
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.push(self.type_int);
        out.push(self.flag_int);
        out.extend_from_slice(&self.data);
        out
    }
}

/// A version 1 Ed25519 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Certificate {
    pub version: u8,
    pub cert_type: CertType,
    pub type_int: u8,
    pub expiration: DateTime<Utc>,
    pub key_type: u8,
    /// The certified key
    pub key: [u8; ED25519_KEY_LENGTH],
    pub extensions: Vec<Ed25519Extension>,
    pub signature: [u8; ED25519_SIGNATURE_LENGTH],
    encoded: Vec<u8>,
}

impl Ed25519Certificate {
    /// Parse a base64 encoded certificate, with or without the
    /// `-----BEGIN ED25519 CERT-----` armour.
    pub fn parse(content: &str) -> Result<Self, CertificateFormatError> {
        let content = content.trim();
        let payload: String = if object::looks_like_begin(content) {
            content
                .lines()
                .filter(|l| object::begin_tag(l).is_none() && object::end_tag(l).is_none())
                .collect()
        } else {
            content.to_string()
        };

        let decoded =
            decode_base64(&payload).map_err(|e| CertificateFormatError::InvalidBase64(e.to_string()))?;
        if decoded.is_empty() {
            return Err(CertificateFormatError::Empty);
        }
        Self::unpack(&decoded)
    }

    /// Parse a certificate's binary encoding.
    pub fn unpack(content: &[u8]) -> Result<Self, CertificateFormatError> {
        let minimum = ED25519_HEADER_LENGTH + ED25519_SIGNATURE_LENGTH;
        if content.len() < minimum {
            return Err(CertificateFormatError::TooShort {
                actual: content.len(),
                minimum,
            });
        }

        let version = content[0];
        if version != 1 {
            return Err(CertificateFormatError::UnsupportedVersion(version));
        }

        let type_int = content[1];
        let cert_type = CertType::from_int(type_int)?;

        let hours = u32::from_be_bytes([content[2], content[3], content[4], content[5]]);
        let expiration = Utc
            .timestamp_opt(hours as i64 * 3600, 0)
            .single()
            .ok_or(CertificateFormatError::InvalidExpiration(hours))?;

        let key_type = content[6];
        let mut key = [0u8; ED25519_KEY_LENGTH];
        key.copy_from_slice(&content[7..39]);

        let extension_count = content[39] as usize;
        let (body, signature_bytes) = content.split_at(content.len() - ED25519_SIGNATURE_LENGTH);
        let mut remaining = &body[ED25519_HEADER_LENGTH..];
        let mut extensions = Vec::with_capacity(extension_count);
        for _ in 0..extension_count {
            let (extension, rest) = Ed25519Extension::pop(remaining)?;
            extensions.push(extension);
            remaining = rest;
        }
        if !remaining.is_empty() {
            return Err(CertificateFormatError::UnusedExtensionData(remaining.len()));
        }

        let mut signature = [0u8; ED25519_SIGNATURE_LENGTH];
        signature.copy_from_slice(signature_bytes);

        Ok(Ed25519Certificate {
            version,
            cert_type,
            type_int,
            expiration,
            key_type,
            key,
            extensions,
            signature,
            encoded: content.to_vec(),
        })
    }

    /// The binary encoding this certificate was parsed from
    pub fn pack(&self) -> &[u8] {
        &self.encoded
    }

    pub fn to_base64(&self) -> String {
        base64::encode(&self.encoded)
    }

    /// Everything the certificate's signature covers
    pub fn body(&self) -> &[u8] {
        &self.encoded[..self.encoded.len() - ED25519_SIGNATURE_LENGTH]
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expiration
    }

    /// Key from the `HasSigningKey` extension, if there is one
    pub fn signing_key(&self) -> Option<[u8; ED25519_KEY_LENGTH]> {
        self.extensions
            .iter()
            .find(|e| e.ext_type == ExtensionType::HasSigningKey)
            .and_then(|e| e.data.as_slice().try_into().ok())
    }

    /// Check this certificate and the descriptor it was published in.
    ///
    /// The certificate's own signature is checked with `key_override`, else
    /// the key in its `HasSigningKey` extension, else its certified key.
    /// Then the descriptor's `router-sig-ed25519` is checked with the
    /// certified key.
    pub fn validate(
        &self,
        descriptor: &ServerDescriptor,
        key_override: Option<&[u8; ED25519_KEY_LENGTH]>,
    ) -> Result<(), DocumentParseError> {
        let signing_key = match key_override {
            Some(key) => *key,
            None => self.signing_key().unwrap_or(self.key),
        };
        verify_ed25519(&signing_key, self.body(), &self.signature, "Ed25519 certificate")?;
        debug!("Ed25519 certificate signature is valid");

        let encoded_signature = descriptor
            .ed25519_signature
            .as_deref()
            .ok_or_else(|| SignatureError::MissingKey("descriptor without router-sig-ed25519".to_string()))?;
        let signature: [u8; ED25519_SIGNATURE_LENGTH] = decode_base64(encoded_signature)
            .ok()
            .and_then(|s| s.as_slice().try_into().ok())
            .ok_or_else(|| {
                SignatureError::MalformedSignature("router-sig-ed25519 is not 64 bytes of base64".to_string())
            })?;

        let signed_content = descriptor.ed25519_signed_content()?;
        let mut message = ROUTER_SIGNATURE_PREFIX.to_vec();
        message.extend_from_slice(signed_content.as_bytes());
        let digest = DigestAlgorithm::Sha256.digest(&message);

        verify_ed25519(&self.key, &digest, &signature, "descriptor")?;
        Ok(())
    }
}

impl fmt::Display for Ed25519Certificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Ed25519 certificate ({:?}, expires {})",
            self.cert_type, self.expiration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_CERT: &str = "
AQQABhtZAaW2GoBED1IjY3A6f6GNqBEl5A83fD2Za9upGke51JGqAQAgBABnprVR
ptIr43bWPo2fIzo3uOywfoMrryprpbm4HhCkZMaO064LP+1KNuLvlc8sGG8lTjx1
g4k3ELuWYgHYWU5rAia7nl4gUfBZOEfHAfKES7l3d63dBEjEX98Ljhdp2w4=
";

    fn certificate(version: u8, cert_type: u8, extensions: &[&[u8]]) -> Vec<u8> {
        let mut cert = vec![version, cert_type, 0, 0, 0, 0, 1];
        cert.extend_from_slice(&[3u8; 32]);
        cert.push(extensions.len() as u8);
        for ext in extensions {
            cert.extend_from_slice(ext);
        }
        cert.extend_from_slice(&[1u8; 64]);
        cert
    }

    fn encoded(version: u8, cert_type: u8, extensions: &[&[u8]]) -> String {
        base64::encode(certificate(version, cert_type, extensions))
    }

    #[test]
    fn test_real_certificate() {
        let cert = Ed25519Certificate::parse(ED25519_CERT).unwrap();
        assert_eq!(1, cert.version);
        assert_eq!(CertType::Signing, cert.cert_type);
        assert_eq!(Utc.with_ymd_and_hms(2015, 8, 28, 17, 0, 0).unwrap(), cert.expiration);
        assert_eq!(1, cert.key_type);
        assert_eq!(0xa5, cert.key[0]);
        assert_eq!(1, cert.extensions.len());
        assert_eq!(ExtensionType::HasSigningKey, cert.extensions[0].ext_type);
        assert_eq!(0x67, cert.signing_key().unwrap()[0]);
        assert_eq!(0xc6, cert.signature[0]);
        assert!(cert.is_expired());

        let compact: String = ED25519_CERT.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(compact, cert.to_base64());
    }

    #[test]
    fn test_pem_armour() {
        let pem = format!("-----BEGIN ED25519 CERT-----{}-----END ED25519 CERT-----", ED25519_CERT);
        let cert = Ed25519Certificate::parse(&pem).unwrap();
        assert_eq!(CertType::Signing, cert.cert_type);
    }

    #[test]
    fn test_minimum_length() {
        let cert = certificate(1, 4, &[]);
        assert_eq!(104, cert.len());
        assert!(Ed25519Certificate::unpack(&cert).is_ok());

        let err = Ed25519Certificate::unpack(&cert[..103]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("103"));
        assert!(msg.contains("104"));
    }

    #[test]
    fn test_empty_and_non_base64() {
        assert_eq!(CertificateFormatError::Empty, Ed25519Certificate::parse("").unwrap_err());
        let err = Ed25519Certificate::parse("\x02\x0323\x04").unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_version() {
        let err = Ed25519Certificate::parse(&encoded(2, 4, &[])).unwrap_err();
        assert!(err.to_string().contains("version 2"));
        assert!(err.to_string().contains("only supports version 1"));
    }

    #[test]
    fn test_reserved_types() {
        for reserved in 0..=3 {
            let err = Ed25519Certificate::parse(&encoded(1, reserved, &[])).unwrap_err();
            assert_eq!(CertificateFormatError::ReservedForCertsCells(reserved), err);
        }
        let err = Ed25519Certificate::parse(&encoded(1, 7, &[])).unwrap_err();
        assert!(err.to_string().contains("RSA identity cross-certification"));

        let cert = Ed25519Certificate::parse(&encoded(1, 8, &[])).unwrap();
        assert_eq!(CertType::Other(8), cert.cert_type);
    }

    #[test]
    fn test_extension_flags() {
        let mut with_key = vec![0x00, 0x20, 0x04, 0x07];
        with_key.extend_from_slice(&[0x11; 32]);
        let empty = [0x00, 0x00, 0x05, 0x00];
        let cert = Ed25519Certificate::parse(&encoded(1, 4, &[&with_key, &empty])).unwrap();

        let ext = &cert.extensions[0];
        assert_eq!(7, ext.flag_int);
        assert_eq!(vec![ExtensionFlag::AffectsValidation, ExtensionFlag::Unknown], ext.flags);
        assert_eq!(with_key, ext.pack());
        assert_eq!(Some([0x11; 32]), cert.signing_key());

        assert_eq!(ExtensionType::Other(5), cert.extensions[1].ext_type);
        assert!(cert.extensions[1].flags.is_empty());
    }

    #[test]
    fn test_missing_extension_header() {
        let err = Ed25519Certificate::parse(&encoded(1, 4, &[&[]])).unwrap_err();
        assert_eq!(CertificateFormatError::ExtensionHeaderMissing, err);
    }

    #[test]
    fn test_truncated_extension() {
        let err = Ed25519Certificate::parse(&encoded(1, 4, &[&[0x50, 0x00, 0x00, 0x00, 0x15, 0x12]])).unwrap_err();
        assert_eq!(
            CertificateFormatError::TruncatedExtension {
                declared: 0x5000,
                available: 2
            },
            err
        );
    }

    #[test]
    fn test_unused_extension_data() {
        // declares one byte of data but supplies two
        let err = Ed25519Certificate::parse(&encoded(1, 4, &[&[0x00, 0x01, 0x00, 0x00, 0x15, 0x12]])).unwrap_err();
        assert!(err.to_string().contains("1 bytes of unused extension data"));
    }

    #[test]
    fn test_short_signing_key() {
        let err = Ed25519Certificate::parse(&encoded(1, 4, &[&[0x00, 0x02, 0x04, 0x07, 0x11, 0x12]])).unwrap_err();
        assert_eq!(CertificateFormatError::SigningKeyLength(2), err);
        assert!(err.to_string().contains("HAS_SIGNING_KEY"));
    }

    #[test]
    fn test_body_excludes_signature() {
        let cert = Ed25519Certificate::unpack(&certificate(1, 4, &[])).unwrap();
        assert_eq!(40, cert.body().len());
        assert_eq!(104, cert.pack().len());
    }
}
