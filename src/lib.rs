//! A parser for Tor directory documents.
//!
//! This crate parses the documents described in
//! [dir-spec](https://gitlab.torproject.org/tpo/core/torspec/-/blob/main/dir-spec.txt):
//! server and extra-info descriptors, microdescriptors, network status
//! documents (v2 and v3 votes and consensuses), their router status entries,
//! directory authority entries, key certificates and v2 hidden service
//! descriptors.
//!
//! Every document keeps its raw text and its lines in order, so it can be
//! rendered again, and collects whatever it didn't understand in an
//! [`Unrecognized`] collection. Parsing is either strict, failing on the first
//! problem, or permissive, see [`Strictness`].
//!
//! ```
//! use tordesc::{Dialect, Microdescriptor, Strictness};
//!
//! let text = "onion-key
//! -----BEGIN RSA PUBLIC KEY-----
//! MEgCQQCwEy+3emMwCGjCAs7i9NS0esui4IA6LcRIDNPo9JWNDMgbvshEfgTJb3os
//! 1zmQKSSuF60d+IPfeTSG9BRPOeehAgMBAAE=
//! -----END RSA PUBLIC KEY-----
//! family $A1CE5B2D2E2E6A3FAF3F22B49E7B0B9D0E3BA6C8
//! ";
//! let parsed = tordesc::parse_one(text.as_bytes(), Dialect::Microdescriptor, Strictness::Strict).unwrap();
//! let micro = Microdescriptor::try_from(parsed).unwrap();
//! assert_eq!(1, micro.family.len());
//! ```

use std::io::BufRead;

pub mod certificate;
#[doc(inline)]
pub use certificate::Ed25519Certificate;

pub mod config;
#[doc(inline)]
pub use config::{ParseOptions, Strictness};

pub mod consensus;
#[doc(inline)]
pub use consensus::{DirectoryAuthority, NetworkStatusDocumentV3};

pub mod crypto;

pub mod descriptor;
#[doc(inline)]
pub use descriptor::ServerDescriptor;

pub mod document;
#[doc(inline)]
pub use document::{Dialect, ParsedDocument, SignedDocument, TorDocument, TypeAnnotation};

pub mod error;
#[doc(inline)]
pub use error::DocumentParseError;

pub mod extra_info;
#[doc(inline)]
pub use extra_info::ExtraInfoDescriptor;

pub mod hidden_service;
#[doc(inline)]
pub use hidden_service::HiddenServiceDescriptor;

pub mod key_cert;
#[doc(inline)]
pub use key_cert::KeyCertificate;

pub mod micro;
#[doc(inline)]
pub use micro::Microdescriptor;

pub mod network_status_v2;
#[doc(inline)]
pub use network_status_v2::NetworkStatusDocumentV2;

pub mod protocol;

pub mod reader;
#[doc(inline)]
pub use reader::{parse_annotated, DocumentReader, ReaderStats};

pub mod router_status;
#[doc(inline)]
pub use router_status::{RouterStatusEntry, RouterStatusVersion};

pub mod unrecognized;
#[doc(inline)]
pub use unrecognized::Unrecognized;

mod assembler;
mod meta;
mod schema;

pub use meta::{DescriptorLine, Fingerprint, Object};

/// Skip leading annotation and blank lines.
fn strip_annotations(text: &str) -> &str {
    let mut rest = text;
    while rest.starts_with('@') || rest.starts_with('\n') || rest.starts_with("\r\n") {
        rest = match rest.find('\n') {
            Some(end) => &rest[end + 1..],
            None => "",
        };
    }
    rest
}

/// Parse a single document of a known dialect.
pub fn parse_one(bytes: &[u8], dialect: Dialect, strictness: Strictness) -> Result<ParsedDocument, DocumentParseError> {
    parse_one_with(bytes, dialect, &strictness.into())
}

/// Parse a single document of a known dialect with custom options.
pub fn parse_one_with(
    bytes: &[u8],
    dialect: Dialect,
    options: &ParseOptions,
) -> Result<ParsedDocument, DocumentParseError> {
    if bytes.len() > options.max_document_size {
        return Err(DocumentParseError::malformed(
            1,
            format!("document exceeds {} bytes", options.max_document_size),
        ));
    }
    let mut text = std::str::from_utf8(bytes)?;
    if options.skip_annotations {
        text = strip_annotations(text);
    }
    let doc = meta::Document::parse(text, options.strictness)?;
    dialect.assemble(&doc, options.strictness)
}

/// Lazily parse a stream of concatenated documents of one dialect.
pub fn parse_stream<R: BufRead>(reader: R, dialect: Dialect, strictness: Strictness) -> DocumentReader<R> {
    DocumentReader::new(reader, dialect, strictness.into())
}

/// Lazily parse a stream of concatenated documents with custom options.
pub fn parse_stream_with<R: BufRead>(reader: R, dialect: Dialect, options: ParseOptions) -> DocumentReader<R> {
    DocumentReader::new(reader, dialect, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_annotations() {
        assert_eq!("r a\n", strip_annotations("@type bridge-network-status 1.2\n\nr a\n"));
        assert_eq!("", strip_annotations("@downloaded-at 2014-09-01 10:00:00"));
        assert_eq!("onion-key\n", strip_annotations("onion-key\n"));
    }

    #[test]
    fn test_parse_one_size_limit() {
        let options = ParseOptions {
            max_document_size: 4,
            ..ParseOptions::strict()
        };
        let err = parse_one_with(b"onion-key\n", Dialect::Microdescriptor, &options).unwrap_err();
        assert!(matches!(err, DocumentParseError::MalformedLine { .. }));
    }

    #[test]
    fn test_parse_one_rejects_invalid_utf8() {
        let err = parse_one(b"onion-key\n\xff\n", Dialect::Microdescriptor, Strictness::Strict).unwrap_err();
        assert!(matches!(err, DocumentParseError::InvalidUtf8(_)));
    }
}
