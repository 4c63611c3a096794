//! Generic structure shared by all Tor documents.
//!
//! Every dialect is a sequence of keyword lines, `KEYWORD [ARGUMENTS]`, each
//! optionally followed by one embedded object block. This module splits raw
//! text into such [`Item`]s without knowing anything about the dialect.

use std::fmt;
use std::ops::Range;

use crate::config::Strictness;
use crate::error::DocumentParseError;

pub mod object;
pub use object::Object;

//
// External dependencies
//
use chrono::{offset::TimeZone, DateTime, NaiveDateTime, Utc};
use log::trace;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, space1},
    combinator::{all_consuming, opt, recognize, rest},
    sequence::{pair, preceded},
    IResult,
};

/// Parse `[opt ]KEYWORD[ ARGUMENTS]`, where annotations may start with `@`.
fn keyword_line(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (input, _) = opt(tag("opt "))(input)?;
    let (input, keyword) = recognize(pair(
        opt(char('@')),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
    ))(input)?;
    let (input, arguments) = opt(preceded(space1, rest))(input)?;
    Ok((input, (keyword, arguments)))
}

/// A single keyword line with its optional object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<'a> {
    pub keyword: &'a str,
    pub arguments: Option<&'a str>,
    pub object: Option<Object>,
    /// 1-based line number of the keyword line
    pub line: usize,
    /// Byte range of the line and its object within the lexed text
    pub span: Range<usize>,
    /// The keyword line as written, without its line ending
    pub text: &'a str,
}

impl<'a> Item<'a> {
    pub fn get_argument(&self) -> Result<&'a str, DocumentParseError> {
        self.arguments
            .ok_or_else(|| DocumentParseError::args_missing(self.keyword))
    }

    pub fn split_arguments(&self) -> Result<Vec<&'a str>, DocumentParseError> {
        Ok(self.get_argument()?.split_whitespace().collect())
    }

    /// Arguments, or the empty string if there are none
    pub fn arguments_or_empty(&self) -> &'a str {
        self.arguments.unwrap_or("")
    }

    pub fn get_object(&self) -> Result<&Object, DocumentParseError> {
        self.object.as_ref().ok_or_else(|| {
            DocumentParseError::malformed(
                self.line,
                format!("'{}' should be followed by a block", self.keyword),
            )
        })
    }

    /// `keyword arguments`, the way unrecognized lines are reported
    pub fn content(&self) -> String {
        match self.arguments {
            Some(args) => format!("{} {}", self.keyword, args),
            None => self.keyword.to_string(),
        }
    }

    pub fn to_line(&self) -> DescriptorLine {
        DescriptorLine {
            keyword: self.keyword.to_string(),
            arguments: self.arguments_or_empty().to_string(),
            object: self.object.clone(),
            text: self.text.to_string(),
        }
    }
}

/// Owned counterpart of [`Item`], kept by every parsed document so it can be
/// rendered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLine {
    pub keyword: String,
    pub arguments: String,
    pub object: Option<Object>,
    text: String,
}

impl DescriptorLine {
    /// The line (and block) as written, `\n` terminated.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + 1);
        out.push_str(&self.text);
        out.push('\n');
        if let Some(object) = &self.object {
            out.push_str(&object.text);
            out.push('\n');
        }
        out
    }
}

/// Render a sequence of lines back into document text.
pub fn render_lines(lines: &[DescriptorLine]) -> String {
    lines.iter().map(DescriptorLine::render).collect()
}

/// Lazily splits text into [`Item`]s.
///
/// Blank lines are skipped, `opt ` prefixes dropped and both LF and CRLF
/// line endings accepted. A malformed keyword line yields an error but
/// lexing continues after it; a broken object block ends the sequence.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    finished: bool,
}

struct RawLine<'a> {
    start: usize,
    end: usize,
    number: usize,
    content: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Lexer<'a> {
        Lexer {
            text,
            pos: 0,
            line: 1,
            finished: false,
        }
    }

    /// Whether lexing stopped, either at the end of input or on an
    /// unrecoverable error.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn next_line(&mut self) -> Option<RawLine<'a>> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text.as_bytes()[self.pos..];
        let end = match memchr::memchr(b'\n', rest) {
            Some(idx) => self.pos + idx + 1,
            None => self.text.len(),
        };
        let content = self.text[self.pos..end]
            .trim_end_matches('\n')
            .trim_end_matches('\r');
        let line = RawLine {
            start: self.pos,
            end,
            number: self.line,
            content,
        };
        self.pos = end;
        self.line += 1;
        Some(line)
    }

    fn fail(&mut self, line: usize, reason: String) -> Option<Result<Item<'a>, DocumentParseError>> {
        self.finished = true;
        Some(Err(DocumentParseError::malformed(line, reason)))
    }

    /// Collect the block started by `begin`, returning it and its end offset.
    fn read_object(&mut self, begin: RawLine<'a>) -> Result<(Object, usize), DocumentParseError> {
        let tag = object::begin_tag(begin.content).ok_or_else(|| {
            DocumentParseError::malformed(
                begin.number,
                format!("malformed block delimiter '{}'", begin.content),
            )
        })?;
        let mut text = begin.content.to_string();
        loop {
            let line = self.next_line().ok_or_else(|| {
                DocumentParseError::malformed(
                    begin.number,
                    format!("'{}' block was never closed", tag),
                )
            })?;
            text.push('\n');
            text.push_str(line.content);
            if let Some(end) = object::end_tag(line.content) {
                if end != tag {
                    return Err(DocumentParseError::malformed(
                        line.number,
                        format!("'{}' block was closed by a '{}' delimiter", tag, end),
                    ));
                }
                trace!("read '{}' block on lines {}-{}", tag, begin.number, line.number);
                return Ok((
                    Object {
                        tag: tag.to_string(),
                        text,
                        line: begin.number,
                    },
                    line.end,
                ));
            }
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Item<'a>, DocumentParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let raw = match self.next_line() {
                Some(raw) => raw,
                None => {
                    self.finished = true;
                    return None;
                }
            };
            if raw.content.trim().is_empty() {
                continue;
            }
            if object::looks_like_begin(raw.content) {
                return self.fail(
                    raw.number,
                    "block is not preceded by a keyword line".to_string(),
                );
            }

            let (keyword, arguments) = match all_consuming(keyword_line)(raw.content) {
                Ok((_, parsed)) => parsed,
                Err(_) => {
                    return Some(Err(DocumentParseError::malformed(
                        raw.number,
                        format!("'{}' is not a keyword line", raw.content),
                    )))
                }
            };
            let arguments = arguments.map(str::trim_end).filter(|a| !a.is_empty());

            // is the next non-empty line the start of an object?
            let (saved_pos, saved_line) = (self.pos, self.line);
            let mut end = raw.end;
            let mut obj = None;
            match self.next_line() {
                Some(next) if object::looks_like_begin(next.content) => {
                    match self.read_object(next) {
                        Ok((o, object_end)) => {
                            obj = Some(o);
                            end = object_end;
                        }
                        Err(e) => {
                            self.finished = true;
                            return Some(Err(e));
                        }
                    }
                }
                _ => {
                    self.pos = saved_pos;
                    self.line = saved_line;
                }
            }

            return Some(Ok(Item {
                keyword,
                arguments,
                object: obj,
                line: raw.number,
                span: raw.start..end,
                text: raw.content,
            }));
        }
    }
}

/// A lexed document.
#[derive(Debug, Clone)]
pub struct Document<'a> {
    pub raw: &'a str,
    /// Leading `@` annotation lines, such as `@type`
    pub annotations: Vec<Item<'a>>,
    pub items: Vec<Item<'a>>,
    /// Lines dropped by permissive lexing, with the reason
    pub skipped: Vec<String>,
}

impl<'a> Document<'a> {
    /// Lex `text`, failing on any malformed line.
    pub fn parse_single(text: &'a str) -> Result<Document<'a>, DocumentParseError> {
        Self::parse(text, Strictness::Strict)
    }

    /// Lex `text`. Permissive lexing drops malformed keyword lines, but a
    /// broken object block is always an error.
    pub fn parse(text: &'a str, strictness: Strictness) -> Result<Document<'a>, DocumentParseError> {
        let mut lexer = Lexer::new(text);
        let mut annotations = Vec::new();
        let mut items = Vec::new();
        let mut skipped = Vec::new();

        while let Some(next) = lexer.next() {
            match next {
                Ok(item) => {
                    if item.keyword.starts_with('@') && items.is_empty() {
                        annotations.push(item);
                    } else {
                        items.push(item);
                    }
                }
                Err(e) if strictness.is_strict() || lexer.is_finished() => return Err(e),
                Err(e) => skipped.push(e.to_string()),
            }
        }

        Ok(Document {
            raw: text,
            annotations,
            items,
            skipped,
        })
    }

    pub fn lines(&self) -> Vec<DescriptorLine> {
        self.items.iter().map(Item::to_line).collect()
    }
}

/// Text of `source` spanned by `items`, which were lexed from it
pub(crate) fn covered_text<'a>(source: &'a str, items: &[Item]) -> &'a str {
    match (items.first(), items.last()) {
        (Some(first), Some(last)) => &source[first.span.start..last.span.end],
        _ => "",
    }
}

/// Slice of `raw` from the first `start` through the first `end` after it
pub fn content_between<'a>(raw: &'a str, start: &str, end: &str) -> Result<&'a str, DocumentParseError> {
    let not_found = || DocumentParseError::ContentRangeNotFound {
        from: start.to_string(),
        to: end.to_string(),
    };
    let start_index = raw.find(start).ok_or_else(not_found)?;
    let end_index = raw[start_index..].find(end).ok_or_else(not_found)? + start_index;
    Ok(&raw[start_index..end_index + end.len()])
}

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DocumentParseError> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// A 20 byte SHA-1 based identifier, such as a relay's identity fingerprint
/// or a descriptor digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub fn from_u8(bytes: &[u8]) -> Result<Fingerprint, DocumentParseError> {
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| DocumentParseError::InvalidFingerprint {
                raw: hex::encode_upper(bytes),
            })?;
        Ok(Fingerprint(array))
    }

    /// From 40 hex characters
    pub fn from_str_hex(s: &str) -> Result<Fingerprint, DocumentParseError> {
        let invalid = || DocumentParseError::InvalidFingerprint { raw: s.to_string() };
        if s.len() != 40 {
            return Err(invalid());
        }
        Self::from_u8(&hex::decode(s).map_err(|_| invalid())?)
    }

    /// From unpadded base64, as used in router status entries
    pub fn from_str_b64(s: &str) -> Result<Fingerprint, DocumentParseError> {
        let invalid = || DocumentParseError::InvalidFingerprint { raw: s.to_string() };
        let bytes = object::decode_base64(s).map_err(|_| invalid())?;
        Self::from_u8(&bytes).map_err(|_| invalid())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Unpadded base64
    pub fn to_b64(&self) -> String {
        base64::encode_config(self.0, base64::STANDARD_NO_PAD)
    }
}

impl From<[u8; 20]> for Fingerprint {
    fn from(bytes: [u8; 20]) -> Self {
        Fingerprint(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}
