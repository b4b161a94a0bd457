//! Single-pass page extraction from a MediaWiki export stream.
//!
//! Only the page currently being read is buffered. Tags are matched by local
//! name so a different export namespace still parses.

use std::io::{self, BufRead};
use std::path::PathBuf;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::error::{MalformedRecord, PipelineError};

pub const KNOWN_EXPORT_NAMESPACE: &str = "http://www.mediawiki.org/xml/export-0.10/";

/// Title prefixes of pages that never carry article prose.
pub const RESERVED_PREFIXES: &[&str] = &[
    "File:",
    "Image:",
    "Media:",
    "Template:",
    "Category:",
    "Wikipedia:",
];

const REDIRECT_MARKER: &str = "#REDIRECT";
const REDIRECT_WINDOW_CHARS: usize = 100;
const EVENT_BUFFER_BYTES: usize = 8 * 1024;
const EVENT_BUFFER_SHRINK_AT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub title: String,
    pub raw_body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Namespace,
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Record(RawRecord),
    Skipped { title: String, reason: SkipReason },
    Malformed(MalformedRecord),
}

#[derive(Debug, Default)]
struct PartialRecord {
    title: Option<String>,
    body: Option<String>,
    redirect: bool,
}

impl PartialRecord {
    fn capacity(&self) -> usize {
        self.title.as_ref().map_or(0, String::capacity)
            + self.body.as_ref().map_or(0, String::capacity)
    }

    fn malformed(self, reason: impl Into<String>) -> ParseEvent {
        ParseEvent::Malformed(MalformedRecord {
            title: self.title,
            reason: reason.into(),
        })
    }

    /// Apply the namespace and redirect rules to a closed page.
    fn finish(self) -> ParseEvent {
        let title = match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return self.malformed("record has no title"),
        };
        let Some(raw_body) = self.body else {
            return ParseEvent::Malformed(MalformedRecord {
                title: Some(title),
                reason: "record has no body".into(),
            });
        };

        if is_reserved_title(&title) {
            return ParseEvent::Skipped {
                title,
                reason: SkipReason::Namespace,
            };
        }
        if self.redirect || is_redirect(&raw_body) {
            return ParseEvent::Skipped {
                title,
                reason: SkipReason::Redirect,
            };
        }
        ParseEvent::Record(RawRecord { title, raw_body })
    }
}

pub fn is_reserved_title(title: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| title.starts_with(p))
}

pub fn is_redirect(body: &str) -> bool {
    let head: String = body.chars().take(REDIRECT_WINDOW_CHARS).collect();
    head.to_ascii_uppercase().contains(REDIRECT_MARKER)
}

/// Parser position. Field buffers live inside the states that fill them.
#[derive(Debug)]
enum RecordState {
    Outside,
    InRecord(PartialRecord),
    InTitleField(PartialRecord, String),
    InBodyField(PartialRecord, String),
}

impl RecordState {
    fn is_capturing(&self) -> bool {
        matches!(
            self,
            RecordState::InTitleField(..) | RecordState::InBodyField(..)
        )
    }

    fn push_text(&mut self, text: &str) {
        if let RecordState::InTitleField(_, field) | RecordState::InBodyField(_, field) = self {
            field.push_str(text);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tag {
    Root(Option<String>),
    Page,
    Title,
    Text,
    Redirect,
    Other,
}

#[derive(Debug)]
enum Marker {
    Start(Tag),
    Empty(Tag),
    End(Tag),
    Eof,
    Other,
}

enum Step {
    Continue,
    Emit(ParseEvent),
    Eof,
}

fn tag_name(local: &[u8]) -> Tag {
    match local {
        b"page" => Tag::Page,
        b"title" => Tag::Title,
        b"text" => Tag::Text,
        b"redirect" => Tag::Redirect,
        _ => Tag::Other,
    }
}

fn classify(e: &BytesStart) -> Tag {
    let local = e.local_name();
    if local.as_ref() == b"mediawiki" {
        let xmlns = e
            .try_get_attribute("xmlns")
            .ok()
            .flatten()
            .map(|a| String::from_utf8_lossy(&a.value).into_owned());
        return Tag::Root(xmlns);
    }
    tag_name(local.as_ref())
}

pub struct RecordStream<R: BufRead> {
    reader: Reader<R>,
    path: PathBuf,
    buf: Vec<u8>,
    state: RecordState,
    namespace: Option<String>,
    last_error_at: Option<u64>,
    finished: bool,
}

impl<R: BufRead> RecordStream<R> {
    pub fn new(source: R, path: impl Into<PathBuf>) -> Self {
        let mut reader = Reader::from_reader(source);
        // Mismatched field ends are reported as malformed records, not XML errors.
        reader.config_mut().check_end_names = false;
        Self {
            reader,
            path: path.into(),
            buf: Vec::with_capacity(EVENT_BUFFER_BYTES),
            state: RecordState::Outside,
            namespace: None,
            last_error_at: None,
            finished: false,
        }
    }

    /// Namespace declared on the root element, once seen.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Bytes currently held for the in-flight record plus the event buffer.
    pub fn buffered_bytes(&self) -> usize {
        let record = match &self.state {
            RecordState::Outside => 0,
            RecordState::InRecord(r) => r.capacity(),
            RecordState::InTitleField(r, f) | RecordState::InBodyField(r, f) => {
                r.capacity() + f.capacity()
            }
        };
        self.buf.capacity() + record
    }

    fn step(&mut self) -> Result<Step, PipelineError> {
        self.buf.clear();
        let capturing = self.state.is_capturing();

        let marker = match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) => Marker::Start(classify(&e)),
            Ok(Event::Empty(e)) => Marker::Empty(classify(&e)),
            Ok(Event::End(e)) => Marker::End(tag_name(e.local_name().as_ref())),
            Ok(Event::Text(e)) if capturing => {
                match e.unescape() {
                    Ok(text) => self.state.push_text(&text),
                    Err(_) => self.state.push_text(&String::from_utf8_lossy(&e)),
                }
                Marker::Other
            }
            Ok(Event::CData(e)) if capturing => {
                self.state.push_text(&String::from_utf8_lossy(&e));
                Marker::Other
            }
            Ok(Event::Eof) => Marker::Eof,
            Ok(_) => Marker::Other,
            Err(err) => return self.recover(err),
        };

        Ok(self.transition(marker))
    }

    fn transition(&mut self, marker: Marker) -> Step {
        use RecordState::*;

        let state = std::mem::replace(&mut self.state, Outside);
        let (next, step) = match (state, marker) {
            (Outside, Marker::Start(Tag::Page)) => {
                (InRecord(PartialRecord::default()), Step::Continue)
            }
            (Outside, Marker::Start(Tag::Root(ns)) | Marker::Empty(Tag::Root(ns))) => {
                self.note_namespace(ns);
                (Outside, Step::Continue)
            }
            (Outside, Marker::Eof) => (Outside, Step::Eof),
            (Outside, _) => (Outside, Step::Continue),

            (InRecord(rec), Marker::Start(Tag::Title)) => {
                (InTitleField(rec, String::new()), Step::Continue)
            }
            (InRecord(rec), Marker::Start(Tag::Text)) => {
                (InBodyField(rec, String::new()), Step::Continue)
            }
            (InRecord(mut rec), Marker::Empty(Tag::Title)) => {
                rec.title = Some(String::new());
                (InRecord(rec), Step::Continue)
            }
            (InRecord(mut rec), Marker::Empty(Tag::Text)) => {
                rec.body = Some(String::new());
                (InRecord(rec), Step::Continue)
            }
            (InRecord(mut rec), Marker::Start(Tag::Redirect) | Marker::Empty(Tag::Redirect)) => {
                rec.redirect = true;
                (InRecord(rec), Step::Continue)
            }
            (InRecord(rec), Marker::End(Tag::Page)) => (Outside, Step::Emit(rec.finish())),
            (InRecord(rec), Marker::Start(Tag::Page)) => (
                InRecord(PartialRecord::default()),
                Step::Emit(rec.malformed("record opened before the previous one closed")),
            ),
            (InRecord(rec), Marker::End(Tag::Title | Tag::Text)) => (
                Outside,
                Step::Emit(rec.malformed("field end without matching start")),
            ),
            (InRecord(rec), Marker::Eof) => (
                Outside,
                Step::Emit(rec.malformed("stream ended inside a record")),
            ),
            (InRecord(rec), _) => (InRecord(rec), Step::Continue),

            (InTitleField(mut rec, text), Marker::End(Tag::Title)) => {
                rec.title = Some(text);
                (InRecord(rec), Step::Continue)
            }
            (InBodyField(mut rec, text), Marker::End(Tag::Text)) => {
                rec.body = Some(text);
                (InRecord(rec), Step::Continue)
            }
            (InTitleField(rec, _) | InBodyField(rec, _), Marker::Start(Tag::Page)) => (
                InRecord(PartialRecord::default()),
                Step::Emit(rec.malformed("record opened before the previous one closed")),
            ),
            (InTitleField(rec, _) | InBodyField(rec, _), Marker::End(_)) => (
                Outside,
                Step::Emit(rec.malformed("field closed by a mismatched end tag")),
            ),
            (InTitleField(rec, _) | InBodyField(rec, _), Marker::Eof) => (
                Outside,
                Step::Emit(rec.malformed("stream ended inside a field")),
            ),
            (field @ (InTitleField(..) | InBodyField(..)), _) => (field, Step::Continue),
        };

        self.state = next;
        if matches!(step, Step::Emit(_)) && self.buf.capacity() > EVENT_BUFFER_SHRINK_AT {
            self.buf = Vec::with_capacity(EVENT_BUFFER_BYTES);
        }
        step
    }

    fn note_namespace(&mut self, ns: Option<String>) {
        match ns.as_deref() {
            Some(KNOWN_EXPORT_NAMESPACE) | None => {}
            Some(other) => warn!(
                path = %self.path.display(),
                namespace = other,
                "Unrecognized export namespace; continuing by local tag names"
            ),
        }
        self.namespace = ns;
    }

    /// Abandon the open record on a tokenizer error, or give up on the file
    /// when the reader cannot move past the error.
    fn recover(&mut self, err: quick_xml::Error) -> Result<Step, PipelineError> {
        if let quick_xml::Error::Io(source) = &err {
            let io_err = io::Error::new(source.kind(), source.to_string());
            return Err(PipelineError::file_access(&self.path, io_err));
        }

        let pos = self.reader.buffer_position() as u64;
        if self.last_error_at == Some(pos) {
            let io_err = io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecoverable XML error at byte {pos}: {err}"),
            );
            return Err(PipelineError::file_access(&self.path, io_err));
        }
        self.last_error_at = Some(pos);

        match std::mem::replace(&mut self.state, RecordState::Outside) {
            RecordState::Outside => {
                debug!(
                    path = %self.path.display(),
                    pos,
                    error = %err,
                    "XML error outside a record"
                );
                Ok(Step::Continue)
            }
            RecordState::InRecord(rec)
            | RecordState::InTitleField(rec, _)
            | RecordState::InBodyField(rec, _) => {
                Ok(Step::Emit(rec.malformed(format!("XML error at byte {pos}: {err}"))))
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<ParseEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.step() {
                Ok(Step::Continue) => continue,
                Ok(Step::Emit(event)) => return Some(Ok(event)),
                Ok(Step::Eof) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    fn events(xml: &str) -> Vec<ParseEvent> {
        RecordStream::new(Cursor::new(xml.as_bytes().to_vec()), "test.xml")
            .map(|e| e.unwrap())
            .collect()
    }

    fn titles(events: &[ParseEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Record(r) => Some(r.title.as_str()),
                _ => None,
            })
            .collect()
    }

    fn page(title: &str, body: &str) -> String {
        format!(
            "<page><title>{title}</title><ns>0</ns><revision><id>1</id><text>{body}</text></revision></page>"
        )
    }

    fn dump(pages: &[String]) -> String {
        format!(
            "<mediawiki xmlns=\"{KNOWN_EXPORT_NAMESPACE}\"><siteinfo><sitename>W</sitename></siteinfo>{}</mediawiki>",
            pages.concat()
        )
    }

    #[test]
    fn fixture_pages() {
        let xml = std::fs::read_to_string("tests/fixtures/sample.xml").unwrap();
        let mut stream = RecordStream::new(Cursor::new(xml.into_bytes()), "sample.xml");
        let all: Vec<_> = stream.by_ref().map(|e| e.unwrap()).collect();

        assert_eq!(stream.namespace(), Some(KNOWN_EXPORT_NAMESPACE));
        assert_eq!(titles(&all), vec!["Paris", "Ancient Rome", "Quiet Page"]);

        let skipped: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Skipped { title, reason } => Some((title.as_str(), *reason)),
                _ => None,
            })
            .collect();
        assert!(skipped.contains(&("File:Example.png", SkipReason::Namespace)));
        assert!(skipped.contains(&("Template:Infobox city", SkipReason::Namespace)));
        assert!(skipped.contains(&("City of Light", SkipReason::Redirect)));
        assert!(skipped.contains(&("Lutetia", SkipReason::Redirect)));
    }

    #[test]
    fn body_is_unescaped() {
        let all = events(&dump(&[page("A &amp; B", "x &lt;ref&gt;y&lt;/ref&gt; [[Z]]")]));
        match &all[0] {
            ParseEvent::Record(r) => {
                assert_eq!(r.title, "A & B");
                assert_eq!(r.raw_body, "x <ref>y</ref> [[Z]]");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cdata_and_empty_text() {
        let xml = dump(&[
            "<page><title>C</title><revision><text><![CDATA[''raw'' & more]]></text></revision></page>".into(),
            "<page><title>E</title><revision><text bytes=\"0\" /></revision></page>".into(),
        ]);
        let all = events(&xml);
        assert_eq!(
            all,
            vec![
                ParseEvent::Record(RawRecord {
                    title: "C".into(),
                    raw_body: "''raw'' & more".into()
                }),
                ParseEvent::Record(RawRecord {
                    title: "E".into(),
                    raw_body: String::new()
                }),
            ]
        );
    }

    #[test]
    fn redirect_must_lead_the_body() {
        let late = format!("{}#REDIRECT [[Other]]", "a".repeat(120));
        let all = events(&dump(&[
            page("R1", "#REDIRECT [[Other]]"),
            page("R2", "  #redirect [[Other]]"),
            page("R3", &late),
        ]));
        assert_eq!(titles(&all), vec!["R3"]);
    }

    #[test]
    fn foreign_namespace_still_parses() {
        let xml = "<mw:mediawiki xmlns:mw=\"http://www.mediawiki.org/xml/export-0.11/\">\
                   <mw:page><mw:title>T</mw:title><mw:revision><mw:text>body</mw:text></mw:revision></mw:page>\
                   </mw:mediawiki>";
        assert_eq!(titles(&events(xml)), vec!["T"]);

        let xml = "<mediawiki xmlns=\"http://example.org/export-9/\"><page><title>U</title><text>b</text></page></mediawiki>";
        let mut stream = RecordStream::new(Cursor::new(xml.as_bytes().to_vec()), "t.xml");
        let all: Vec<_> = stream.by_ref().map(|e| e.unwrap()).collect();
        assert_eq!(titles(&all), vec!["U"]);
        assert_eq!(stream.namespace(), Some("http://example.org/export-9/"));
    }

    #[test]
    fn stray_field_end_abandons_record() {
        let xml = dump(&[
            "<page><title>Bad</title></text><text>x</text></page>".into(),
            page("Good", "fine"),
        ]);
        let all = events(&xml);
        assert!(matches!(
            &all[0],
            ParseEvent::Malformed(m) if m.title.as_deref() == Some("Bad")
        ));
        assert_eq!(titles(&all), vec!["Good"]);
    }

    #[test]
    fn unclosed_page_is_reported_and_next_page_survives() {
        let xml = dump(&[
            "<page><title>Open</title><revision><text>never closed</text></revision>".into(),
            page("Next", "ok"),
        ]);
        let all = events(&xml);
        assert!(matches!(&all[0], ParseEvent::Malformed(_)));
        assert_eq!(titles(&all), vec!["Next"]);
    }

    #[test]
    fn eof_inside_record() {
        let xml = "<mediawiki><page><title>Cut</title><revision><text>half";
        let all = events(xml);
        assert_eq!(all.len(), 1);
        assert!(matches!(
            &all[0],
            ParseEvent::Malformed(m) if m.title.as_deref() == Some("Cut")
        ));
    }

    #[test]
    fn missing_title_or_body() {
        let xml = dump(&[
            "<page><revision><text>no title</text></revision></page>".into(),
            "<page><title>NoBody</title></page>".into(),
        ]);
        let all = events(&xml);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|e| matches!(e, ParseEvent::Malformed(_))));
    }

    #[test]
    fn redirect_element_marks_page() {
        let xml = dump(&[
            "<page><title>Alias</title><redirect title=\"Target\" /><revision><text>Plain text</text></revision></page>".into(),
        ]);
        assert_eq!(
            events(&xml),
            vec![ParseEvent::Skipped {
                title: "Alias".into(),
                reason: SkipReason::Redirect
            }]
        );
    }

    /// Produces `count` trivial pages lazily without materializing the dump.
    struct SyntheticDump {
        remaining: usize,
        chunk: Vec<u8>,
        pos: usize,
        stage: u8,
    }

    impl SyntheticDump {
        fn new(count: usize) -> Self {
            Self {
                remaining: count,
                chunk: Vec::new(),
                pos: 0,
                stage: 0,
            }
        }

        fn refill(&mut self) {
            self.pos = 0;
            self.chunk.clear();
            match self.stage {
                0 => {
                    self.chunk.extend_from_slice(b"<mediawiki>");
                    self.stage = 1;
                }
                1 if self.remaining > 0 => {
                    let n = self.remaining;
                    self.remaining -= 1;
                    self.chunk.extend_from_slice(
                        format!("<page><title>P{n}</title><revision><text>Body {n}</text></revision></page>\n")
                            .as_bytes(),
                    );
                }
                1 => {
                    self.chunk.extend_from_slice(b"</mediawiki>");
                    self.stage = 2;
                }
                _ => {}
            }
        }
    }

    impl Read for SyntheticDump {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.chunk.len() {
                self.refill();
            }
            let n = out.len().min(self.chunk.len() - self.pos);
            out[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn synthetic_pass(count: usize) {
        let source = BufReader::new(SyntheticDump::new(count));
        let mut stream = RecordStream::new(source, "synthetic.xml");
        let mut seen = 0usize;
        let mut peak = 0usize;
        while let Some(event) = stream.next() {
            assert!(matches!(event.unwrap(), ParseEvent::Record(_)));
            seen += 1;
            peak = peak.max(stream.buffered_bytes());
        }
        assert_eq!(seen, count);
        assert!(peak < 64 * 1024, "record buffers grew to {peak} bytes");
    }

    #[test]
    fn bounded_buffers_over_many_records() {
        synthetic_pass(50_000);
    }

    #[test]
    #[ignore = "full million-record pass; run with --ignored"]
    fn bounded_buffers_over_a_million_records() {
        synthetic_pass(1_000_000);
    }
}
