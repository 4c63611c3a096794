//! Options controlling how documents are parsed

use derive_builder::Builder;

/// How tolerant the parser is of structural problems.
///
/// Strict parsing fails closed on the first missing, duplicated, misplaced or
/// malformed field. Permissive parsing keeps going and records those
/// complaints in the document's [`Unrecognized`](crate::Unrecognized)
/// collection, leaving affected fields unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    Strict,
    #[default]
    Permissive,
}

impl Strictness {
    pub fn is_strict(self) -> bool {
        self == Strictness::Strict
    }
}

impl From<bool> for Strictness {
    fn from(strict: bool) -> Self {
        if strict {
            Strictness::Strict
        } else {
            Strictness::Permissive
        }
    }
}

/// Upper bound for a single document read from a stream (32 MiB)
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 32 * 1024 * 1024;

/// Parser configuration.
///
/// ```
/// use tordesc::config::{ParseOptionsBuilder, Strictness};
///
/// let options = ParseOptionsBuilder::default()
///     .strictness(Strictness::Strict)
///     .build()
///     .unwrap();
/// assert!(options.strictness.is_strict());
/// ```
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ParseOptions {
    #[builder(default)]
    pub strictness: Strictness,
    /// Documents larger than this many bytes are rejected by the stream reader.
    #[builder(default = "DEFAULT_MAX_DOCUMENT_SIZE")]
    pub max_document_size: usize,
    /// Skip `@type` and other annotation lines in front of documents.
    #[builder(default = "true")]
    pub skip_annotations: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            strictness: Strictness::default(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            skip_annotations: true,
        }
    }
}

impl ParseOptions {
    pub fn strict() -> Self {
        ParseOptions {
            strictness: Strictness::Strict,
            ..Default::default()
        }
    }

    pub fn permissive() -> Self {
        ParseOptions::default()
    }
}

impl From<Strictness> for ParseOptions {
    fn from(strictness: Strictness) -> Self {
        ParseOptions {
            strictness,
            ..Default::default()
        }
    }
}
