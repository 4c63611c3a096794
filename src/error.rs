//! Custom error types for the parsing of Tor documents

use std::num::ParseIntError;
use std::string::ToString;

use thiserror;

/// Error that occured when parsing or validating a Tor document
#[derive(thiserror::Error, Debug)]
pub enum DocumentParseError {
    #[error("Malformed content on line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
    #[error(transparent)]
    Schema(#[from] SchemaViolation),
    #[error("Argument of '{keyword}' should be {expected}, but was '{actual}'")]
    ArgumentShape {
        keyword: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Certificate(#[from] CertificateFormatError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("When parsing a document, not all necessary information were present")]
    Incomplete(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("An item with keyword '{keyword}' unexpectedly had no or not enough arguments")]
    ItemArgumentsMissing { keyword: String },
    #[error("Could not parse date/time")]
    InvalidDate(#[from] chrono::format::ParseError),
    #[error("Could not parse integer in {context}")]
    InvalidInt { context: String },
    #[error("Invalid fingerprint '{raw}'")]
    InvalidFingerprint { raw: String },
    #[error("Invalid protocol version '{raw}'")]
    InvalidProtocolVersion { raw: String },
    #[error("Invalid exit policy entry '{raw}'")]
    InvalidExitPolicyEntry { raw: String },
    #[error("Malformed exit policy")]
    MalformedExitPolicy,
    #[error("Invalid argument dictionary entry '{raw}'")]
    InvalidArgumentDict { raw: String },
    #[error("Content range '{from}'...'{to}' not found")]
    ContentRangeNotFound { from: String, to: String },
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),
    #[error("Invalid address pattern '{0}'")]
    IpParseError(String),
    #[error("Invalid port range '{0}'")]
    RangeParseError(String),
    #[error("Expected \"accept\" or \"reject\", but received: {0}")]
    PolicyParseError(String),
    #[error("Introduction points are encrypted for authorized clients")]
    EncryptedIntroductionPoints,
    #[error("Document is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Could not read document stream")]
    Io(#[from] std::io::Error),
}

impl DocumentParseError {
    /// Create a new ItemArgumentsMissing error, easily
    pub fn args_missing(keyword: impl Into<String>) -> DocumentParseError {
        DocumentParseError::ItemArgumentsMissing {
            keyword: keyword.into(),
        }
    }

    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> DocumentParseError {
        DocumentParseError::MalformedLine {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(
        keyword: impl Into<String>,
        expected: impl Into<String>,
        actual: Option<&str>,
    ) -> DocumentParseError {
        DocumentParseError::ArgumentShape {
            keyword: keyword.into(),
            expected: expected.into(),
            actual: actual.unwrap_or("").to_string(),
        }
    }
}

impl From<ParseIntError> for DocumentParseError {
    fn from(e: ParseIntError) -> Self {
        DocumentParseError::InvalidInt {
            context: e.to_string(),
        }
    }
}

/// A document's keywords did not follow its dialect's grammar
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("{dialect} is missing mandatory fields: {}", keywords.join(", "))]
    Missing {
        dialect: &'static str,
        keywords: Vec<String>,
    },
    #[error("{dialect} should have at most one '{keyword}' line, but had {count}")]
    Duplicate {
        dialect: &'static str,
        keyword: String,
        count: usize,
    },
    #[error("'{keyword}' is misplaced in {dialect}: {reason}")]
    Misordered {
        dialect: &'static str,
        keyword: String,
        reason: String,
    },
    #[error("'{keyword}' is not permitted in {dialect}: {reason}")]
    Disallowed {
        dialect: &'static str,
        keyword: String,
        reason: String,
    },
}

/// Binary layout violations of an Ed25519 certificate
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateFormatError {
    #[error("Ed25519 certificate wasn't properly base64 encoded (empty)")]
    Empty,
    #[error("Ed25519 certificate wasn't properly base64 encoded ({0})")]
    InvalidBase64(String),
    #[error("Ed25519 certificate was {actual} bytes, but should be at least {minimum}")]
    TooShort { actual: usize, minimum: usize },
    #[error("Ed25519 certificate is version {0}. Parser presently only supports version 1")]
    UnsupportedVersion(u8),
    #[error("Ed25519 certificate cannot have a type of {0}. This is reserved for CERTS cells")]
    ReservedForCertsCells(u8),
    #[error("Ed25519 certificate cannot have a type of 7. This is reserved for RSA identity cross-certification")]
    ReservedForCrossCertification,
    #[error("Ed25519 extension is missing header fields")]
    ExtensionHeaderMissing,
    #[error("Ed25519 extension is truncated. It should have {declared} bytes of data but there's only {available}")]
    TruncatedExtension { declared: usize, available: usize },
    #[error("Ed25519 HAS_SIGNING_KEY extension must be 32 bytes, but was {0}")]
    SigningKeyLength(usize),
    #[error("Ed25519 certificate had {0} bytes of unused extension data")]
    UnusedExtensionData(usize),
    #[error("Ed25519 certificate has an invalid expiration of {0} hours")]
    InvalidExpiration(u32),
}

/// Failures while checking a document's or certificate's signature
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature validation requires {0} support, which this build lacks")]
    Unavailable(&'static str),
    #[error("No key is available to check the {0}")]
    MissingKey(String),
    #[error("Malformed key: {0}")]
    MalformedKey(String),
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
    #[error("The {what} signature was not made over the local digest {local}")]
    DigestMismatch { what: String, local: String },
    #[error("The {0} signature is forged or corrupt")]
    Forged(String),
    #[error("Descriptor id {declared} does not match {computed}, derived from the permanent key")]
    DescriptorIdMismatch { declared: String, computed: String },
    #[error("Fingerprint {declared} does not match the identity key's digest {computed}")]
    FingerprintMismatch { declared: String, computed: String },
    #[error("Network status document has {valid} valid signatures out of {total} total, needed {}", (total + 1) / 2)]
    InsufficientSignatures { valid: usize, total: usize },
    #[error("None of the document's signatures were made by a provided key certificate")]
    NoMatchingCertificate,
}

pub(crate) trait ErrorContext<T> {
    type IntoError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError>;
}

impl<T> ErrorContext<T> for Result<T, ParseIntError> {
    type IntoError = DocumentParseError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError> {
        self.map_err(|_| DocumentParseError::InvalidInt {
            context: context.to_string(),
        })
    }
}
