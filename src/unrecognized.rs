//! Content a parser did not understand.
//!
//! Unknown keywords, flags and values are not errors. They are collected
//! here so callers can notice new protocol features, and so that permissive
//! parsing has somewhere to put the complaints it chose not to raise.

use std::fmt;

/// Part of a document an entry was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// The whole document, for dialects without sections
    Body,
    Header,
    Authority,
    Router,
    Footer,
}

/// What kind of content was not understood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnrecognizedKind {
    /// A line whose keyword the dialect does not define
    Keyword,
    /// A relay flag outside the known set
    Flag,
    /// An unknown value within a known line, such as a new `w` entry
    Value,
    /// A structural complaint that permissive parsing did not raise
    Deferred,
    /// A mandatory keyword that was absent under permissive parsing
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedEntry {
    pub section: Section,
    pub kind: UnrecognizedKind,
    pub content: String,
}

impl fmt::Display for UnrecognizedEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}/{:?}: {}", self.section, self.kind, self.content)
    }
}

/// Ordered collection of everything a document's parser skipped over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unrecognized {
    entries: Vec<UnrecognizedEntry>,
}

impl Unrecognized {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, section: Section, kind: UnrecognizedKind, content: impl Into<String>) {
        self.entries.push(UnrecognizedEntry {
            section,
            kind,
            content: content.into(),
        });
    }

    /// Take over another document's entries, filing them under `section`.
    pub(crate) fn absorb(&mut self, other: Unrecognized, section: Section) {
        self.entries
            .extend(other.entries.into_iter().map(|e| UnrecognizedEntry { section, ..e }));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnrecognizedEntry> {
        self.entries.iter()
    }

    pub fn in_section(&self, section: Section) -> impl Iterator<Item = &UnrecognizedEntry> {
        self.entries.iter().filter(move |e| e.section == section)
    }

    pub fn of_kind(&self, kind: UnrecognizedKind) -> impl Iterator<Item = &UnrecognizedEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Unknown lines, as `keyword arguments`
    pub fn lines(&self) -> Vec<&str> {
        self.of_kind(UnrecognizedKind::Keyword)
            .map(|e| e.content.as_str())
            .collect()
    }

    /// Mandatory keywords that were missing
    pub fn missing(&self) -> Vec<&str> {
        self.of_kind(UnrecognizedKind::Missing)
            .map(|e| e.content.as_str())
            .collect()
    }

    /// Whether any entry's content starts with `prefix`
    pub fn contains(&self, prefix: &str) -> bool {
        self.entries.iter().any(|e| e.content.starts_with(prefix))
    }
}

impl<'a> IntoIterator for &'a Unrecognized {
    type Item = &'a UnrecognizedEntry;
    type IntoIter = std::slice::Iter<'a, UnrecognizedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries() {
        let mut u = Unrecognized::new();
        u.push(Section::Header, UnrecognizedKind::Keyword, "foo bar");
        u.push(Section::Header, UnrecognizedKind::Missing, "published");

        let mut entry = Unrecognized::new();
        entry.push(Section::Body, UnrecognizedKind::Flag, "Pancake");
        u.absorb(entry, Section::Router);

        assert_eq!(3, u.len());
        assert_eq!(vec!["foo bar"], u.lines());
        assert_eq!(vec!["published"], u.missing());
        assert_eq!(1, u.in_section(Section::Router).count());
        assert!(u.contains("Pancake"));
        assert!(!u.contains("bar"));
    }
}
