//! Reading a stream of concatenated documents one at a time.

use std::io::BufRead;

use crate::config::ParseOptions;
use crate::document::{Dialect, ParsedDocument, TypeAnnotation};
use crate::error::DocumentParseError;
use crate::meta::Document;

//
// External dependencies
//
use log::{debug, trace, warn};

/// Counters of a [`DocumentReader`]'s progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Documents returned successfully
    pub yielded: usize,
    /// Documents dropped by permissive parsing
    pub skipped: usize,
    /// Bytes consumed from the underlying reader
    pub bytes_read: u64,
}

/// Bytes of a single document cut out of the stream
#[derive(Debug, Default)]
struct Chunk {
    bytes: Vec<u8>,
    /// Line of the stream the document starts on
    line: usize,
    oversized: bool,
}

impl Chunk {
    fn push(&mut self, line: &[u8], limit: usize) {
        if self.oversized || self.bytes.len() + line.len() > limit {
            self.oversized = true;
            return;
        }
        self.bytes.extend_from_slice(line);
    }
}

/// Keyword of a raw line, without any `opt ` prefix
fn keyword_of(line: &[u8]) -> &[u8] {
    let line = line.strip_prefix(b"opt ").unwrap_or(line);
    let end = line
        .iter()
        .position(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .unwrap_or(line.len());
    &line[..end]
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Lazily splits a stream into documents of one dialect.
///
/// Documents are separated by their dialect's sentinel keyword, for example
/// `router` for server descriptors. Annotation lines (`@type ...`) start a
/// new document too. Router status entries are cut out of whole network
/// status documents: lines before the first `r` and from the footer on are
/// skipped.
///
/// Strict parsing yields the first failure and then stops; permissive
/// parsing logs failing documents and moves on to the next one.
///
/// ```
/// use tordesc::{Dialect, ParsedDocument, Strictness};
///
/// let entries = "r a lpXfw1/+uGEym58asExGOXAgzjE xpmsmAK2/nTmOKMSSwiYvv1Vqgc 2017-05-25 04:46:11 10.0.0.1 9001 0\n\
///                s Running\n\
///                r b hGKIJA+vK+Fx0mrEb8dBlQf7jLk Y4xTsxpdXlqanMk7yhuHB1ckrVc 2017-05-25 04:46:11 10.0.0.2 9001 0\n\
///                s Running Valid\n";
/// let reader = tordesc::parse_stream(entries.as_bytes(), Dialect::RouterStatusV3, Strictness::Strict);
/// let documents: Vec<ParsedDocument> = reader.collect::<Result<_, _>>().unwrap();
/// assert_eq!(2, documents.len());
/// ```
#[derive(Debug)]
pub struct DocumentReader<R> {
    reader: R,
    dialect: Dialect,
    options: ParseOptions,
    /// A line read ahead that belongs to the next document, with its number
    pending: Option<(usize, Vec<u8>)>,
    line: usize,
    finished: bool,
    stats: ReaderStats,
}

impl<R: BufRead> DocumentReader<R> {
    pub fn new(reader: R, dialect: Dialect, options: ParseOptions) -> Self {
        DocumentReader {
            reader,
            dialect,
            options,
            pending: None,
            line: 0,
            finished: false,
            stats: ReaderStats::default(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse the next document, or `None` once the stream is exhausted (or
    /// a strict reader hit an error).
    pub fn next_document(&mut self) -> Option<Result<ParsedDocument, DocumentParseError>> {
        while !self.finished {
            let chunk = match self.read_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            match self.parse_chunk(&chunk) {
                Ok(document) => {
                    self.stats.yielded += 1;
                    return Some(Ok(document));
                }
                Err(e) if self.options.strictness.is_strict() => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Err(e) => {
                    warn!("skipping {} starting on line {}: {}", self.dialect, chunk.line, e);
                    self.stats.skipped += 1;
                }
            }
        }
        None
    }

    fn next_line(&mut self) -> Result<Option<(usize, Vec<u8>)>, DocumentParseError> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }
        self.stats.bytes_read += read as u64;
        self.line += 1;
        Ok(Some((self.line, line)))
    }

    fn is_router_status(&self) -> bool {
        self.dialect.router_status_version().is_some()
    }

    /// Cut the next document's bytes out of the stream.
    fn read_chunk(&mut self) -> Result<Option<Chunk>, DocumentParseError> {
        let sentinel = self.dialect.sentinel().as_bytes();
        let limit = self.options.max_document_size;
        let mut chunk: Option<Chunk> = None;
        let mut annotations = Chunk::default();

        while let Some((number, line)) = self.next_line()? {
            let keyword = keyword_of(&line);
            let current = match chunk.as_mut() {
                Some(current) => current,
                None => {
                    if keyword.starts_with(b"@") {
                        if !self.options.skip_annotations {
                            annotations.push(&line, limit);
                        }
                        continue;
                    }
                    if is_blank(&line) || (self.is_router_status() && keyword != sentinel) {
                        continue;
                    }
                    // annotations count against the document's size
                    let mut started = std::mem::take(&mut annotations);
                    started.line = number;
                    started.push(&line, limit);
                    chunk = Some(started);
                    continue;
                }
            };

            if keyword == sentinel || keyword.starts_with(b"@") {
                self.pending = Some((number, line));
                break;
            }
            if self.is_router_status() && matches!(keyword, b"directory-footer" | b"directory-signature") {
                trace!("router status entries end on line {}", number);
                break;
            }
            current.push(&line, limit);
        }

        if let Some(chunk) = &chunk {
            debug!("found {} on line {}", self.dialect, chunk.line);
        }
        Ok(chunk)
    }

    fn parse_chunk(&self, chunk: &Chunk) -> Result<ParsedDocument, DocumentParseError> {
        if chunk.oversized {
            return Err(DocumentParseError::malformed(
                chunk.line,
                format!("document exceeds {} bytes", self.options.max_document_size),
            ));
        }
        let text = std::str::from_utf8(&chunk.bytes)?;
        let strictness = self.options.strictness;
        let doc = Document::parse(text, strictness)?;
        self.dialect.assemble(&doc, strictness)
    }
}

impl<R: BufRead> Iterator for DocumentReader<R> {
    type Item = Result<ParsedDocument, DocumentParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document()
    }
}

/// Read a stream starting with a `@type` annotation, which picks the dialect.
pub fn parse_annotated<R: BufRead>(
    mut reader: R,
    options: ParseOptions,
) -> Result<DocumentReader<R>, DocumentParseError> {
    let mut first = Vec::new();
    let read = reader.read_until(b'\n', &mut first)?;
    let line = std::str::from_utf8(&first)?;
    let annotation = TypeAnnotation::parse(line)
        .ok_or_else(|| DocumentParseError::malformed(1, "expected a '@type <name> <major>.<minor>' annotation"))?;
    let dialect = Dialect::from_annotation(&annotation).ok_or_else(|| {
        DocumentParseError::malformed(1, format!("unsupported document type '{}'", annotation.name))
    })?;
    debug!("{} selects {}", annotation, dialect);

    let mut documents = DocumentReader::new(reader, dialect, options);
    documents.stats.bytes_read = read as u64;
    documents.line = 1;
    documents.pending = Some((1, first));
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strictness;
    use crate::document::TorDocument;
    use crate::router_status::RouterStatusEntry;

    const ENTRIES: &str = "network-status-version 3
vote-status consensus
r a lpXfw1/+uGEym58asExGOXAgzjE xpmsmAK2/nTmOKMSSwiYvv1Vqgc 2017-05-25 04:46:11 10.0.0.1 9001 0
s Running
r b hGKIJA+vK+Fx0mrEb8dBlQf7jLk Y4xTsxpdXlqanMk7yhuHB1ckrVc 2017-05-25 04:46:11 10.0.0.2 9001 0
s Running Valid

r c lpXfw1/+uGEym58asExGOXAgzjE Y4xTsxpdXlqanMk7yhuHB1ckrVc 2017-05-25 04:46:11 10.0.0.3 9001 0
s Fast
directory-footer
bandwidth-weights Wbd=0
";

    fn entries(text: &str, strictness: Strictness) -> DocumentReader<&[u8]> {
        DocumentReader::new(text.as_bytes(), Dialect::RouterStatusV3, strictness.into())
    }

    fn nicknames(reader: DocumentReader<&[u8]>) -> Vec<String> {
        reader
            .filter_map(Result::ok)
            .map(|d| RouterStatusEntry::try_from(d).unwrap().nickname)
            .collect()
    }

    #[test]
    fn test_entries_of_a_consensus() {
        let mut reader = entries(ENTRIES, Strictness::Strict);
        let first = reader.next_document().unwrap().unwrap();
        assert!(first.raw().starts_with("r a "));
        assert!(first.raw().ends_with("s Running\n"));
        assert_eq!(vec!["b", "c"], nicknames(reader));
    }

    #[test]
    fn test_stats() {
        let mut reader = entries(ENTRIES, Strictness::Strict);
        while reader.next_document().is_some() {}
        assert!(reader.is_finished());
        assert_eq!(3, reader.stats().yielded);
        assert_eq!(ENTRIES.len() as u64, reader.stats().bytes_read);
    }

    #[test]
    fn test_strict_stops_at_first_error() {
        let text = ENTRIES.replace("10.0.0.2", "10.0.0.256");
        let results: Vec<_> = entries(&text, Strictness::Strict).collect();
        assert_eq!(2, results.len());
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_permissive_skips_bad_documents() {
        let text = ENTRIES.replace("10.0.0.2", "10.0.0.256");
        let mut reader = entries(&text, Strictness::Permissive);
        let mut names = Vec::new();
        while let Some(document) = reader.next_document() {
            names.push(RouterStatusEntry::try_from(document.unwrap()).unwrap().nickname);
        }
        assert_eq!(vec!["a", "c"], names);
        assert_eq!(1, reader.stats().skipped);
    }

    #[test]
    fn test_document_size_limit() {
        let options = ParseOptions {
            max_document_size: 100,
            ..ParseOptions::strict()
        };
        let mut reader = DocumentReader::new(ENTRIES.as_bytes(), Dialect::RouterStatusV3, options);
        let err = reader.next_document().unwrap().unwrap_err();
        assert!(err.to_string().contains("exceeds 100 bytes"));
        assert!(reader.next_document().is_none());
    }

    #[test]
    fn test_annotations() {
        let text = format!("@type bridge-network-status 1.2\n{}", ENTRIES);
        let reader = parse_annotated(text.as_bytes(), ParseOptions::strict()).unwrap();
        assert_eq!(Dialect::RouterStatusV3, reader.dialect());
        assert_eq!(vec!["a", "b", "c"], nicknames(reader));

        let options = ParseOptions {
            skip_annotations: false,
            ..ParseOptions::strict()
        };
        let mut reader = parse_annotated(text.as_bytes(), options).unwrap();
        let first = reader.next_document().unwrap().unwrap();
        assert!(first.raw().starts_with("@type bridge-network-status 1.2\nr a "));
    }

    #[test]
    fn test_annotations_count_towards_size_limit() {
        let text = format!("{}{}", "@downloaded-at 2017-05-25 04:46:11\n".repeat(10), ENTRIES);
        let options = ParseOptions {
            max_document_size: 200,
            skip_annotations: false,
            ..ParseOptions::strict()
        };
        let mut reader = DocumentReader::new(text.as_bytes(), Dialect::RouterStatusV3, options);
        let err = reader.next_document().unwrap().unwrap_err();
        assert!(err.to_string().contains("exceeds 200 bytes"), "{}", err);

        let options = ParseOptions {
            max_document_size: 200,
            ..ParseOptions::strict()
        };
        let reader = DocumentReader::new(text.as_bytes(), Dialect::RouterStatusV3, options);
        assert_eq!(vec!["a", "b", "c"], nicknames(reader));
    }

    #[test]
    fn test_unknown_annotation() {
        let err = parse_annotated("@type torperf 1.0\n".as_bytes(), ParseOptions::default()).unwrap_err();
        assert!(err.to_string().contains("torperf"));
        assert!(parse_annotated("r a\n".as_bytes(), ParseOptions::default()).is_err());
    }

    #[test]
    fn test_keyword_of() {
        assert_eq!(b"router", keyword_of(b"router a 1.2.3.4 9001 0 0\n"));
        assert_eq!(b"hibernating", keyword_of(b"opt hibernating 1\r\n"));
        assert_eq!(b"r", keyword_of(b"r\n"));
    }
}
