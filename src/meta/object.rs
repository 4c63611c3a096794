//! Embedded `-----BEGIN TAG-----` ... `-----END TAG-----` blocks

use crate::error::DocumentParseError;

const BEGIN_PREFIX: &str = "-----BEGIN ";
const END_PREFIX: &str = "-----END ";
const DELIMITER_SUFFIX: &str = "-----";
const LINE_WIDTH: usize = 64;

/// A block of base64 encoded data attached to a keyword line, such as a key
/// or a signature.
///
/// The block text is kept exactly as it appeared (minus line endings) so
/// that documents can be re-rendered byte for byte. Decoding happens on
/// demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Tag of the delimiters, e.g. `RSA PUBLIC KEY`
    pub tag: String,
    /// Full block text from the BEGIN through the END line, `\n` separated
    pub text: String,
    /// Line of the document on which the block began
    pub line: usize,
}

impl Object {
    /// Create a block holding `data`, wrapped at 64 columns.
    pub fn encode(tag: &str, data: &[u8]) -> Object {
        let encoded = base64::encode(data);
        let mut text = format!("{}{}{}", BEGIN_PREFIX, tag, DELIMITER_SUFFIX);
        for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
            text.push('\n');
            // base64 output is ASCII, so every chunk boundary is a char boundary
            text.push_str(&String::from_utf8_lossy(chunk));
        }
        text.push('\n');
        text.push_str(&format!("{}{}{}", END_PREFIX, tag, DELIMITER_SUFFIX));
        Object {
            tag: tag.to_string(),
            text,
            line: 0,
        }
    }

    /// The base64 payload with delimiters and line breaks removed
    pub fn body(&self) -> String {
        self.text
            .lines()
            .filter(|l| !l.starts_with(BEGIN_PREFIX) && !l.starts_with(END_PREFIX))
            .map(str::trim)
            .collect()
    }

    /// Decode the block's payload.
    pub fn decode(&self) -> Result<Vec<u8>, DocumentParseError> {
        decode_base64(&self.body()).map_err(|e| {
            DocumentParseError::malformed(
                self.line,
                format!("'{}' block is not valid base64: {}", self.tag, e),
            )
        })
    }
}

/// Tag named by a BEGIN delimiter line, if it is one
pub(crate) fn begin_tag(line: &str) -> Option<&str> {
    line.strip_prefix(BEGIN_PREFIX)?.strip_suffix(DELIMITER_SUFFIX)
}

/// Tag named by an END delimiter line, if it is one
pub(crate) fn end_tag(line: &str) -> Option<&str> {
    line.strip_prefix(END_PREFIX)?.strip_suffix(DELIMITER_SUFFIX)
}

pub(crate) fn looks_like_begin(line: &str) -> bool {
    line.starts_with(BEGIN_PREFIX)
}

/// Decode base64, tolerating embedded whitespace and missing padding.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    base64::decode_config(cleaned, base64::STANDARD)
}
