//! Schema enforcement shared by all dialect parsers.
//!
//! A dialect parser feeds each lexed [`Item`] through [`Assembler::accept`],
//! converts the items it is handed back, and passes conversion results
//! through [`Assembler::defer`]. Strict assembly turns every complaint into
//! an error; permissive assembly files them as unrecognized content.

use std::collections::HashMap;

use crate::config::Strictness;
use crate::error::{DocumentParseError, SchemaViolation};
use crate::meta::{parse_timestamp, Item};
use crate::schema::{ArgShape, Block, FieldSpec, Flavor, Position, Schema};
use crate::unrecognized::{Section, Unrecognized, UnrecognizedKind};

use log::warn;

pub struct Assembler {
    schema: &'static Schema,
    strictness: Strictness,
    flavor: Flavor,
    section: Section,
    counts: HashMap<&'static str, usize>,
    exempt: Vec<&'static str>,
    required: Vec<&'static str>,
    unrecognized: Unrecognized,
}

impl Assembler {
    pub fn new(schema: &'static Schema, strictness: Strictness) -> Assembler {
        Assembler {
            schema,
            strictness,
            flavor: Flavor::Plain,
            section: Section::Body,
            counts: HashMap::new(),
            exempt: Vec::new(),
            required: Vec::new(),
            unrecognized: Unrecognized::new(),
        }
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Assembler {
        self.flavor = flavor;
        self
    }

    pub fn in_section(mut self, section: Section) -> Assembler {
        self.section = section;
        self
    }

    /// Don't require `keyword`, even if the schema makes it mandatory.
    pub fn exempt(&mut self, keyword: &'static str) {
        self.exempt.push(keyword);
    }

    /// Also require `keyword`, which the schema itself doesn't demand.
    pub fn require(&mut self, keyword: &'static str) {
        self.required.push(keyword);
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn dialect(&self) -> &'static str {
        self.schema.dialect
    }

    /// Number of times `keyword` was accepted so far
    pub fn seen(&self, keyword: &str) -> usize {
        self.counts.get(keyword).copied().unwrap_or(0)
    }

    pub fn record(&mut self, kind: UnrecognizedKind, content: impl Into<String>) {
        self.unrecognized.push(self.section, kind, content);
    }

    /// File lines that permissive lexing dropped.
    pub fn note_skipped(&mut self, skipped: &[String]) {
        for reason in skipped {
            self.record(UnrecognizedKind::Deferred, reason.clone());
        }
    }

    /// Merge a nested document's unrecognized content.
    pub fn absorb(&mut self, other: Unrecognized, section: Section) {
        self.unrecognized.absorb(other, section);
    }

    /// Check `item`, the `index`th of `total` items, against the schema.
    ///
    /// Returns the field's rules if the caller should go on to convert the
    /// item, or `None` if it was unknown or (permissively) rejected.
    pub fn accept(
        &mut self,
        item: &Item,
        index: usize,
        total: usize,
    ) -> Result<Option<&'static FieldSpec>, DocumentParseError> {
        let (keyword, spec) = match self.schema.fields.get_entry(item.keyword) {
            Some((keyword, spec)) => (*keyword, spec),
            None => {
                self.record(UnrecognizedKind::Keyword, item.content());
                return Ok(None);
            }
        };

        let count = {
            let count = self.counts.entry(keyword).or_insert(0);
            *count += 1;
            *count
        };

        if !spec.presence.permits(self.flavor) {
            self.complain(SchemaViolation::Disallowed {
                dialect: self.schema.dialect,
                keyword: keyword.to_string(),
                reason: spec.presence_reason().to_string(),
            })?;
            return Ok(None);
        }

        if count > 1 && spec.cardinality.is_single() {
            self.complain(SchemaViolation::Duplicate {
                dialect: self.schema.dialect,
                keyword: keyword.to_string(),
                count,
            })?;
        }

        let misplaced = match spec.position {
            Position::First if index != 0 => Some("must be the first line"),
            Position::Last if index + 1 != total => Some("must be the last line"),
            _ => None,
        };
        if let Some(reason) = misplaced {
            self.complain(SchemaViolation::Misordered {
                dialect: self.schema.dialect,
                keyword: keyword.to_string(),
                reason: reason.to_string(),
            })?;
        }

        match self.defer(check_shape(item, spec))? {
            Some(()) => Ok(Some(spec)),
            None => Ok(None),
        }
    }

    /// Raise a schema violation, or file it when parsing permissively.
    pub fn complain(&mut self, violation: SchemaViolation) -> Result<(), DocumentParseError> {
        self.defer::<()>(Err(violation.into())).map(|_| ())
    }

    /// Pass a conversion result through, filing failures when permissive.
    pub fn defer<T>(&mut self, result: Result<T, DocumentParseError>) -> Result<Option<T>, DocumentParseError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.strictness.is_strict() => Err(e),
            Err(e) => {
                warn!("{}: {}", self.schema.dialect, e);
                self.record(UnrecognizedKind::Deferred, e.to_string());
                Ok(None)
            }
        }
    }

    /// Check that every mandatory keyword was seen.
    ///
    /// Strict assembly fails with a single error naming all missing
    /// keywords; permissive assembly files each of them as missing.
    pub fn finish(mut self) -> Result<Unrecognized, DocumentParseError> {
        let missing: Vec<&'static str> = self
            .schema
            .mandatory(self.flavor)
            .chain(self.required.iter().copied())
            .filter(|keyword| !self.exempt.contains(keyword) && self.seen(keyword) == 0)
            .collect();

        if missing.is_empty() {
            return Ok(self.unrecognized);
        }
        if self.strictness.is_strict() {
            return Err(SchemaViolation::Missing {
                dialect: self.schema.dialect,
                keywords: missing.iter().map(|k| k.to_string()).collect(),
            }
            .into());
        }
        warn!("{} is missing {}", self.schema.dialect, missing.join(", "));
        for keyword in missing {
            self.record(UnrecognizedKind::Missing, keyword);
        }
        Ok(self.unrecognized)
    }
}

fn check_shape(item: &Item, spec: &FieldSpec) -> Result<(), DocumentParseError> {
    let args = item.arguments;
    let fits = match spec.shape {
        ArgShape::Any => true,
        ArgShape::Present => args.is_some(),
        ArgShape::Empty => args.is_none(),
        ArgShape::Integer => args.map_or(false, |a| a.parse::<u64>().is_ok()),
        ArgShape::Timestamp => args.map_or(false, |a| parse_timestamp(a).is_ok()),
        ArgShape::Args(n) => args.map_or(0, |a| a.split_whitespace().count()) >= n,
    };
    if !fits {
        return Err(DocumentParseError::shape(item.keyword, spec.shape.to_string(), args));
    }

    let tag = item.object.as_ref().map(|o| o.tag.as_str());
    match (spec.block, tag) {
        (Block::Any, _) => Ok(()),
        (Block::Present, Some(_)) => Ok(()),
        (Block::Tagged(expected), Some(actual)) if expected == actual => Ok(()),
        (Block::Present, None) => Err(DocumentParseError::shape(
            item.keyword,
            "followed by a block",
            Some("no block"),
        )),
        (Block::Tagged(expected), actual) => Err(DocumentParseError::shape(
            item.keyword,
            format!("followed by a '{}' block", expected),
            Some(actual.unwrap_or("no block")),
        )),
    }
}
