//! Dialect dispatch and the traits shared by every parsed document

use std::fmt;

use crate::config::Strictness;
use crate::consensus::{DirectoryAuthority, NetworkStatusDocumentV3};
use crate::descriptor::ServerDescriptor;
use crate::error::DocumentParseError;
use crate::extra_info::ExtraInfoDescriptor;
use crate::hidden_service::HiddenServiceDescriptor;
use crate::key_cert::KeyCertificate;
use crate::meta::{render_lines, DescriptorLine, Document};
use crate::micro::Microdescriptor;
use crate::network_status_v2::NetworkStatusDocumentV2;
use crate::router_status::{RouterStatusEntry, RouterStatusVersion};
use crate::schema::Flavor;
use crate::unrecognized::Unrecognized;

//
// External dependencies
//
use phf::phf_map;
use strum::{Display, EnumString, IntoStaticStr};

/// One of the document formats this crate understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Dialect {
    ServerDescriptor,
    ExtraInfo,
    Microdescriptor,
    RouterStatusV2,
    RouterStatusV3,
    RouterStatusMicroV3,
    NetworkStatusV2,
    /// Votes, consensuses and microdescriptor consensuses
    NetworkStatusV3,
    KeyCertificate,
    /// An authority entry of a consensus
    DirectoryAuthority,
    /// An authority entry of a vote, with its key certificate
    DirectoryAuthorityVote,
    HiddenServiceDescriptor,
}

/// `@type` annotation names, as used by CollecTor archives
static ANNOTATED_DIALECTS: phf::Map<&'static str, Dialect> = phf_map! {
    "server-descriptor" => Dialect::ServerDescriptor,
    "bridge-server-descriptor" => Dialect::ServerDescriptor,
    "extra-info" => Dialect::ExtraInfo,
    "bridge-extra-info" => Dialect::ExtraInfo,
    "microdescriptor" => Dialect::Microdescriptor,
    "network-status-2" => Dialect::NetworkStatusV2,
    "network-status-consensus-3" => Dialect::NetworkStatusV3,
    "network-status-vote-3" => Dialect::NetworkStatusV3,
    "network-status-microdesc-consensus-3" => Dialect::NetworkStatusV3,
    "bridge-network-status" => Dialect::RouterStatusV3,
    "dir-key-certificate-3" => Dialect::KeyCertificate,
    "hidden-service-descriptor" => Dialect::HiddenServiceDescriptor,
};

impl Dialect {
    /// Keyword that starts every document of this dialect
    pub fn sentinel(self) -> &'static str {
        match self {
            Dialect::ServerDescriptor => "router",
            Dialect::ExtraInfo => "extra-info",
            Dialect::Microdescriptor => "onion-key",
            Dialect::RouterStatusV2 | Dialect::RouterStatusV3 | Dialect::RouterStatusMicroV3 => "r",
            Dialect::NetworkStatusV2 | Dialect::NetworkStatusV3 => "network-status-version",
            Dialect::KeyCertificate => "dir-key-certificate-version",
            Dialect::DirectoryAuthority | Dialect::DirectoryAuthorityVote => "dir-source",
            Dialect::HiddenServiceDescriptor => "rendezvous-service-descriptor",
        }
    }

    pub(crate) fn router_status_version(self) -> Option<RouterStatusVersion> {
        match self {
            Dialect::RouterStatusV2 => Some(RouterStatusVersion::V2),
            Dialect::RouterStatusV3 => Some(RouterStatusVersion::V3),
            Dialect::RouterStatusMicroV3 => Some(RouterStatusVersion::MicroV3),
            _ => None,
        }
    }

    /// The dialect named by a `@type` annotation
    pub fn from_annotation(annotation: &TypeAnnotation) -> Option<Dialect> {
        ANNOTATED_DIALECTS.get(annotation.name.as_str()).copied()
    }

    /// Assemble a lexed document of this dialect.
    pub(crate) fn assemble(self, doc: &Document, strictness: Strictness) -> Result<ParsedDocument, DocumentParseError> {
        let raw = doc.raw.to_string();
        let parsed = match self {
            Dialect::ServerDescriptor => ServerDescriptor::from_doc(doc, strictness)?.into(),
            Dialect::ExtraInfo => ExtraInfoDescriptor::from_doc(doc, strictness)?.into(),
            Dialect::Microdescriptor => Microdescriptor::from_doc(doc, strictness)?.into(),
            Dialect::RouterStatusV2 | Dialect::RouterStatusV3 | Dialect::RouterStatusMicroV3 => {
                let version = self.router_status_version().unwrap_or(RouterStatusVersion::V3);
                let mut entry = RouterStatusEntry::from_items(doc.raw, &doc.items, version, strictness, &doc.skipped)?;
                entry.raw = raw;
                entry.into()
            }
            Dialect::NetworkStatusV2 => NetworkStatusDocumentV2::from_doc(doc, strictness)?.into(),
            Dialect::NetworkStatusV3 => NetworkStatusDocumentV3::from_doc(doc, strictness)?.into(),
            Dialect::KeyCertificate => {
                let mut cert = KeyCertificate::from_items(doc.raw, &doc.items, strictness, &doc.skipped)?;
                cert.raw = raw;
                cert.into()
            }
            Dialect::DirectoryAuthority | Dialect::DirectoryAuthorityVote => {
                let flavor = match self {
                    Dialect::DirectoryAuthorityVote => Flavor::Vote,
                    _ => Flavor::Consensus,
                };
                let mut authority = DirectoryAuthority::from_items(doc.raw, &doc.items, flavor, strictness, &doc.skipped)?;
                authority.raw = raw;
                authority.into()
            }
            Dialect::HiddenServiceDescriptor => HiddenServiceDescriptor::from_doc(doc, strictness)?.into(),
        };
        Ok(parsed)
    }
}

/// A `@type <name> <major>.<minor>` annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAnnotation {
    pub name: String,
    pub major_version: u32,
    pub minor_version: u32,
}

impl TypeAnnotation {
    /// Parse an annotation line, or `None` if `line` isn't one.
    pub fn parse(line: &str) -> Option<TypeAnnotation> {
        let rest = line.trim().strip_prefix("@type ")?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?;
        let (major, minor) = parts.next()?.split_once('.')?;
        if parts.next().is_some() {
            return None;
        }
        Some(TypeAnnotation {
            name: name.to_string(),
            major_version: major.parse().ok()?,
            minor_version: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for TypeAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@type {} {}.{}", self.name, self.major_version, self.minor_version)
    }
}

/// Functionality shared by all parsed documents
pub trait TorDocument {
    /// The document's text, as it was parsed
    fn raw(&self) -> &str;

    /// The document's lines in their original order
    fn lines(&self) -> &[DescriptorLine];

    /// Everything the parser skipped over
    fn unrecognized(&self) -> &Unrecognized;

    /// Render the document's lines again. Blank lines and CRLF line endings
    /// are normalized away; everything else is reproduced byte for byte.
    fn render(&self) -> String {
        render_lines(self.lines())
    }
}

/// A document carrying a signature that callers may choose to check
pub trait SignedDocument {
    /// Outcome of the last recorded signature check, if any
    fn signature_valid(&self) -> Option<bool>;

    fn set_signature_valid(&mut self, valid: bool);

    /// Remember the outcome of a validation call, such as
    /// `doc.record_signature_check(&doc.validate_signature())`.
    fn record_signature_check<T>(&mut self, result: &Result<T, DocumentParseError>) {
        self.set_signature_valid(result.is_ok());
    }
}

macro_rules! tor_document {
    ($($t:ty),+) => {
        $(
            impl TorDocument for $t {
                fn raw(&self) -> &str {
                    &self.raw
                }

                fn lines(&self) -> &[DescriptorLine] {
                    &self.lines
                }

                fn unrecognized(&self) -> &Unrecognized {
                    &self.unrecognized
                }
            }
        )+
    };
}

tor_document!(
    ServerDescriptor,
    ExtraInfoDescriptor,
    Microdescriptor,
    RouterStatusEntry,
    NetworkStatusDocumentV2,
    NetworkStatusDocumentV3,
    KeyCertificate,
    DirectoryAuthority,
    HiddenServiceDescriptor
);

/// A document of any dialect
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDocument {
    ServerDescriptor(ServerDescriptor),
    ExtraInfo(ExtraInfoDescriptor),
    Microdescriptor(Microdescriptor),
    RouterStatus(RouterStatusEntry),
    NetworkStatusV2(NetworkStatusDocumentV2),
    NetworkStatusV3(Box<NetworkStatusDocumentV3>),
    KeyCertificate(KeyCertificate),
    DirectoryAuthority(DirectoryAuthority),
    HiddenService(HiddenServiceDescriptor),
}

impl ParsedDocument {
    fn as_document(&self) -> &dyn TorDocument {
        match self {
            ParsedDocument::ServerDescriptor(d) => d,
            ParsedDocument::ExtraInfo(d) => d,
            ParsedDocument::Microdescriptor(d) => d,
            ParsedDocument::RouterStatus(d) => d,
            ParsedDocument::NetworkStatusV2(d) => d,
            ParsedDocument::NetworkStatusV3(d) => &**d,
            ParsedDocument::KeyCertificate(d) => d,
            ParsedDocument::DirectoryAuthority(d) => d,
            ParsedDocument::HiddenService(d) => d,
        }
    }

    /// The dialect the document was parsed as
    pub fn dialect(&self) -> Dialect {
        match self {
            ParsedDocument::ServerDescriptor(_) => Dialect::ServerDescriptor,
            ParsedDocument::ExtraInfo(_) => Dialect::ExtraInfo,
            ParsedDocument::Microdescriptor(_) => Dialect::Microdescriptor,
            ParsedDocument::RouterStatus(entry) => match entry.version {
                RouterStatusVersion::V2 => Dialect::RouterStatusV2,
                RouterStatusVersion::V3 => Dialect::RouterStatusV3,
                RouterStatusVersion::MicroV3 => Dialect::RouterStatusMicroV3,
            },
            ParsedDocument::NetworkStatusV2(_) => Dialect::NetworkStatusV2,
            ParsedDocument::NetworkStatusV3(_) => Dialect::NetworkStatusV3,
            ParsedDocument::KeyCertificate(_) => Dialect::KeyCertificate,
            ParsedDocument::DirectoryAuthority(authority) if authority.key_certificate.is_some() => {
                Dialect::DirectoryAuthorityVote
            }
            ParsedDocument::DirectoryAuthority(_) => Dialect::DirectoryAuthority,
            ParsedDocument::HiddenService(_) => Dialect::HiddenServiceDescriptor,
        }
    }
}

impl TorDocument for ParsedDocument {
    fn raw(&self) -> &str {
        self.as_document().raw()
    }

    fn lines(&self) -> &[DescriptorLine] {
        self.as_document().lines()
    }

    fn unrecognized(&self) -> &Unrecognized {
        self.as_document().unrecognized()
    }
}

/// Returned when a [`ParsedDocument`] is converted into the wrong type
#[derive(thiserror::Error, Debug)]
#[error("expected a {expected} document, but it was {actual}")]
pub struct WrongDialect {
    pub expected: &'static str,
    pub actual: Dialect,
    pub document: Box<ParsedDocument>,
}

macro_rules! parsed_variant {
    ($variant:ident, $t:ty, $name:literal, $wrap:expr, $unwrap:expr) => {
        impl From<$t> for ParsedDocument {
            fn from(document: $t) -> Self {
                ParsedDocument::$variant($wrap(document))
            }
        }

        impl TryFrom<ParsedDocument> for $t {
            type Error = WrongDialect;

            fn try_from(document: ParsedDocument) -> Result<Self, Self::Error> {
                match document {
                    ParsedDocument::$variant(inner) => Ok($unwrap(inner)),
                    other => Err(WrongDialect {
                        expected: $name,
                        actual: other.dialect(),
                        document: Box::new(other),
                    }),
                }
            }
        }
    };
    ($variant:ident, $t:ty, $name:literal) => {
        parsed_variant!($variant, $t, $name, std::convert::identity, std::convert::identity);
    };
}

parsed_variant!(ServerDescriptor, ServerDescriptor, "server descriptor");
parsed_variant!(ExtraInfo, ExtraInfoDescriptor, "extra-info descriptor");
parsed_variant!(Microdescriptor, Microdescriptor, "microdescriptor");
parsed_variant!(RouterStatus, RouterStatusEntry, "router status entry");
parsed_variant!(NetworkStatusV2, NetworkStatusDocumentV2, "network status v2");
parsed_variant!(NetworkStatusV3, NetworkStatusDocumentV3, "network status v3", Box::new, |b: Box<_>| *b);
parsed_variant!(KeyCertificate, KeyCertificate, "key certificate");
parsed_variant!(DirectoryAuthority, DirectoryAuthority, "directory authority");
parsed_variant!(HiddenService, HiddenServiceDescriptor, "hidden service descriptor");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_annotation() {
        let annotation = TypeAnnotation::parse("@type network-status-consensus-3 1.0").unwrap();
        assert_eq!("network-status-consensus-3", annotation.name);
        assert_eq!((1, 0), (annotation.major_version, annotation.minor_version));
        assert_eq!("@type network-status-consensus-3 1.0", annotation.to_string());
        assert_eq!(Some(Dialect::NetworkStatusV3), Dialect::from_annotation(&annotation));

        assert!(TypeAnnotation::parse("@type server-descriptor").is_none());
        assert!(TypeAnnotation::parse("router a 1.2.3.4 1 0 0").is_none());
        let unknown = TypeAnnotation::parse("@type torperf 1.0").unwrap();
        assert_eq!(None, Dialect::from_annotation(&unknown));
    }

    #[test]
    fn test_dialect_names() {
        assert_eq!("router-status-micro-v3", Dialect::RouterStatusMicroV3.to_string());
        assert_eq!(Ok(Dialect::ExtraInfo), "extra-info".parse::<Dialect>());
        assert_eq!("r", Dialect::RouterStatusV2.sentinel());
        assert_eq!(
            Ok(Dialect::HiddenServiceDescriptor),
            "hidden-service-descriptor".parse::<Dialect>()
        );
        let annotation = TypeAnnotation::parse("@type hidden-service-descriptor 1.0").unwrap();
        assert_eq!(Some(Dialect::HiddenServiceDescriptor), Dialect::from_annotation(&annotation));
    }

    #[test]
    fn test_wrong_dialect() {
        let text = "r moria1 lpXfw1/+uGEym58asExGOXAgzjE xpmsmAK2/nTmOKMSSwiYvv1Vqgc 2017-05-25 04:46:11 128.31.0.34 9101 9131\ns Running\n";
        let doc = Document::parse(text, Strictness::Strict).unwrap();
        let parsed = Dialect::RouterStatusV3.assemble(&doc, Strictness::Strict).unwrap();
        assert_eq!(Dialect::RouterStatusV3, parsed.dialect());
        assert_eq!(text, parsed.raw());
        assert_eq!(text, parsed.render());

        let err = KeyCertificate::try_from(parsed).unwrap_err();
        assert!(err.to_string().contains("key certificate"));
        let entry = RouterStatusEntry::try_from(*err.document).unwrap();
        assert_eq!("moria1", entry.nickname);
    }
}
