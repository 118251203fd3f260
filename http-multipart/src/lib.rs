//! Streaming multipart/form-data parser.
//!
//! A push parser over RFC 2046/7578 bodies: feed it byte slices as they
//! arrive and it fires callbacks for part boundaries, headers and data.
//! Input is buffered only around boundaries and part headers; body bytes
//! are released as soon as no delimiter can still begin inside them, so a
//! large file upload streams through without accumulating.
//!
//! Bodies with bare-LF line endings are tolerated around boundaries, as
//! real-world encoders occasionally produce them.

#![forbid(unsafe_code)]

mod content_disposition;
mod error;

pub use self::error::MultipartError;

use bytes::{Buf, BytesMut};
use memchr::memmem;

use self::content_disposition::ContentDisposition;

/// Marker returned by a callback to abort the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

pub type CbResult = Result<(), Abort>;

/// Event sink for the parser. `on_part_data` may fire several times per
/// part; everything else fires once per part (or once per stream for
/// `on_complete`).
pub trait Callbacks {
    fn on_part_begin(&mut self) -> CbResult {
        Ok(())
    }
    fn on_header_field(&mut self, _name: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_header_value(&mut self, _value: &[u8]) -> CbResult {
        Ok(())
    }
    /// `name` parameter of a `Content-Disposition` header.
    fn on_name(&mut self, _name: &[u8]) -> CbResult {
        Ok(())
    }
    /// `filename` parameter of a `Content-Disposition` header.
    fn on_filename(&mut self, _filename: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_headers_complete(&mut self) -> CbResult {
        Ok(())
    }
    fn on_part_data(&mut self, _chunk: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_part_complete(&mut self) -> CbResult {
        Ok(())
    }
    fn on_complete(&mut self) -> CbResult {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub max_header_size: usize,
    pub max_headers: usize,
    /// Cap on buffered input. The buffer only ever holds part headers and
    /// the bytes around an unresolved boundary; 1 MiB is generous.
    pub buf_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            max_headers: 32,
            buf_limit: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FirstBoundary,
    PartHeaders,
    PartBody,
    Complete,
}

/// How far a body scan got.
enum BodyStep {
    /// A full delimiter was found.
    Delim {
        body_end: usize,
        resume: usize,
        is_end: bool,
    },
    /// No resolvable delimiter; `emit` bytes are safe to release.
    Partial { emit: usize },
}

#[derive(Debug)]
pub struct MultipartParser {
    config: Config,
    /// `--B\r\n`
    first: Vec<u8>,
    /// `--B--\r\n`
    first_end: Vec<u8>,
    /// `\n--B`, the common core of every later delimiter variant.
    finder: memmem::Finder<'static>,
    needle_len: usize,
    /// Length of the longest delimiter variant (`\r\n--B--\r\n`); one byte
    /// less is the holdback window for safe body emission.
    max_delim_len: usize,
    buf: BytesMut,
    phase: Phase,
    header_count: usize,
    error: Option<MultipartError>,
}

impl MultipartParser {
    /// `boundary` is the bare token from the `Content-Type` parameter,
    /// without the leading `--`, between 1 and 70 bytes.
    pub fn new(boundary: &[u8]) -> Result<Self, MultipartError> {
        Self::with_config(boundary, Config::default())
    }

    pub fn with_config(boundary: &[u8], config: Config) -> Result<Self, MultipartError> {
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(MultipartError::InvalidBoundary);
        }

        let mut first = Vec::with_capacity(boundary.len() + 4);
        first.extend_from_slice(b"--");
        first.extend_from_slice(boundary);
        first.extend_from_slice(b"\r\n");

        let mut first_end = Vec::with_capacity(boundary.len() + 6);
        first_end.extend_from_slice(b"--");
        first_end.extend_from_slice(boundary);
        first_end.extend_from_slice(b"--\r\n");

        let mut needle = Vec::with_capacity(boundary.len() + 3);
        needle.extend_from_slice(b"\n--");
        needle.extend_from_slice(boundary);
        let needle_len = needle.len();

        Ok(Self {
            config,
            first,
            first_end,
            finder: memmem::Finder::new(&needle).into_owned(),
            needle_len,
            max_delim_len: boundary.len() + 8,
            buf: BytesMut::new(),
            phase: Phase::FirstBoundary,
            header_count: 0,
            error: None,
        })
    }

    /// Restart for a new stream. The boundary and its precomputed
    /// delimiters persist; buffered input and the sticky error clear.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.phase = Phase::FirstBoundary;
        self.header_count = 0;
        self.error = None;
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn error(&self) -> Option<MultipartError> {
        self.error
    }

    /// Feed bytes. The input is buffered in full; callbacks fire for
    /// everything that can be resolved. A parse error is sticky until
    /// [`MultipartParser::reset`].
    pub fn execute<C: Callbacks>(&mut self, callbacks: &mut C, data: &[u8]) -> Result<(), MultipartError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.phase == Phase::Complete {
            // Epilogue bytes after the final delimiter are ignored.
            return Ok(());
        }

        self.buf.extend_from_slice(data);
        if self.buf.len() > self.config.buf_limit {
            let error = MultipartError::BufferOverflow;
            self.error = Some(error);
            return Err(error);
        }

        match self.drive(callbacks) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.error = Some(error);
                Err(error)
            }
        }
    }

    fn drive<C: Callbacks>(&mut self, cb: &mut C) -> Result<(), MultipartError> {
        loop {
            match self.phase {
                Phase::Complete => {
                    self.buf.clear();
                    return Ok(());
                }

                Phase::FirstBoundary => {
                    // A stray CRLF may precede the first delimiter.
                    while self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                    }
                    if self.buf.starts_with(&self.first) {
                        let advance = self.first.len();
                        self.buf.advance(advance);
                        self.begin_part(cb)?;
                        continue;
                    }
                    if self.buf.starts_with(&self.first_end) {
                        // An immediately terminated multipart has no parts.
                        let advance = self.first_end.len();
                        self.buf.advance(advance);
                        self.complete(cb)?;
                        continue;
                    }
                    if self.first.starts_with(&self.buf[..]) || self.first_end.starts_with(&self.buf[..]) {
                        return Ok(());
                    }
                    if self.buf.len() == 1 && self.buf[0] == b'\r' {
                        // Could still become the optional leading CRLF.
                        return Ok(());
                    }
                    return Err(MultipartError::ExpectedBoundary);
                }

                Phase::PartHeaders => {
                    let Some(newline) = memchr::memchr(b'\n', &self.buf) else {
                        if self.buf.len() > self.config.max_header_size {
                            return Err(MultipartError::HeaderTooLarge);
                        }
                        return Ok(());
                    };
                    let line_len = if newline > 0 && self.buf[newline - 1] == b'\r' {
                        newline - 1
                    } else {
                        newline
                    };
                    if line_len > self.config.max_header_size {
                        return Err(MultipartError::HeaderTooLarge);
                    }

                    if line_len == 0 {
                        self.buf.advance(newline + 1);
                        cb.on_headers_complete().map_err(abort)?;
                        self.phase = Phase::PartBody;
                        continue;
                    }

                    {
                        let line = &self.buf[..line_len];
                        let colon = memchr::memchr(b':', line).ok_or(MultipartError::Header)?;
                        let name = trim(&line[..colon]);
                        if name.is_empty() {
                            return Err(MultipartError::Header);
                        }
                        let value = trim(&line[colon + 1..]);
                        cb.on_header_field(name).map_err(abort)?;
                        cb.on_header_value(value).map_err(abort)?;

                        if name.eq_ignore_ascii_case(b"content-disposition") {
                            let cd = ContentDisposition::from_value(value);
                            if let Some(name) = cd.name {
                                cb.on_name(name).map_err(abort)?;
                            }
                            if let Some(filename) = cd.filename {
                                cb.on_filename(filename).map_err(abort)?;
                            }
                        }
                    }

                    self.header_count += 1;
                    if self.header_count > self.config.max_headers {
                        return Err(MultipartError::TooManyHeaders);
                    }
                    self.buf.advance(newline + 1);
                }

                Phase::PartBody => match self.scan_body() {
                    BodyStep::Delim {
                        body_end,
                        resume,
                        is_end,
                    } => {
                        if body_end > 0 {
                            cb.on_part_data(&self.buf[..body_end]).map_err(abort)?;
                        }
                        cb.on_part_complete().map_err(abort)?;
                        self.buf.advance(resume);
                        if is_end {
                            self.complete(cb)?;
                        } else {
                            self.begin_part(cb)?;
                        }
                    }
                    BodyStep::Partial { emit } => {
                        if emit > 0 {
                            cb.on_part_data(&self.buf[..emit]).map_err(abort)?;
                            self.buf.advance(emit);
                        }
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Find the next delimiter by checking every `\n--<boundary>` core.
    /// Never resolves body bytes that could still turn out to belong to a
    /// delimiter.
    fn scan_body(&self) -> BodyStep {
        let buf = &self.buf[..];
        let mut search = 0;
        loop {
            match self.finder.find(&buf[search..]) {
                Some(found) => {
                    let idx = search + found;
                    // `\r\n--B` when the CR is there, the tolerated
                    // `\n--B` otherwise.
                    let delim_start = if idx > 0 && buf[idx - 1] == b'\r' { idx - 1 } else { idx };
                    let after = idx + self.needle_len;

                    if buf.len() < after + 2 {
                        return BodyStep::Partial { emit: delim_start };
                    }
                    match &buf[after..after + 2] {
                        b"\r\n" => {
                            return BodyStep::Delim {
                                body_end: delim_start,
                                resume: after + 2,
                                is_end: false,
                            };
                        }
                        b"--" => {
                            if buf.len() < after + 4 {
                                return BodyStep::Partial { emit: delim_start };
                            }
                            if &buf[after + 2..after + 4] == b"\r\n" {
                                return BodyStep::Delim {
                                    body_end: delim_start,
                                    resume: after + 4,
                                    is_end: true,
                                };
                            }
                            // A boundary-shaped run inside the body.
                            search = idx + 1;
                        }
                        _ => search = idx + 1,
                    }
                }
                None => {
                    let holdback = self.max_delim_len - 1;
                    let emit = buf.len().saturating_sub(holdback);
                    return BodyStep::Partial { emit };
                }
            }
        }
    }

    fn begin_part<C: Callbacks>(&mut self, cb: &mut C) -> Result<(), MultipartError> {
        self.phase = Phase::PartHeaders;
        self.header_count = 0;
        cb.on_part_begin().map_err(abort)
    }

    fn complete<C: Callbacks>(&mut self, cb: &mut C) -> Result<(), MultipartError> {
        self.phase = Phase::Complete;
        self.buf.clear();
        cb.on_complete().map_err(abort)
    }
}

fn abort(_: Abort) -> MultipartError {
    MultipartError::Callback
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        PartBegin,
        Field(Vec<u8>),
        Value(Vec<u8>),
        Name(Vec<u8>),
        Filename(Vec<u8>),
        HeadersComplete,
        Data(Vec<u8>),
        PartComplete,
        Complete,
    }

    #[derive(Default)]
    struct Trace {
        events: Vec<Event>,
    }

    impl Trace {
        fn normalized(&self) -> Vec<Event> {
            let mut out: Vec<Event> = Vec::new();
            for event in &self.events {
                match (out.last_mut(), event) {
                    (Some(Event::Data(a)), Event::Data(b)) => a.extend_from_slice(b),
                    _ => out.push(event.clone()),
                }
            }
            out
        }

        fn part_data(&self) -> Vec<u8> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Data(d) => Some(d.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    impl Callbacks for Trace {
        fn on_part_begin(&mut self) -> CbResult {
            self.events.push(Event::PartBegin);
            Ok(())
        }
        fn on_header_field(&mut self, name: &[u8]) -> CbResult {
            self.events.push(Event::Field(name.to_vec()));
            Ok(())
        }
        fn on_header_value(&mut self, value: &[u8]) -> CbResult {
            self.events.push(Event::Value(value.to_vec()));
            Ok(())
        }
        fn on_name(&mut self, name: &[u8]) -> CbResult {
            self.events.push(Event::Name(name.to_vec()));
            Ok(())
        }
        fn on_filename(&mut self, filename: &[u8]) -> CbResult {
            self.events.push(Event::Filename(filename.to_vec()));
            Ok(())
        }
        fn on_headers_complete(&mut self) -> CbResult {
            self.events.push(Event::HeadersComplete);
            Ok(())
        }
        fn on_part_data(&mut self, chunk: &[u8]) -> CbResult {
            self.events.push(Event::Data(chunk.to_vec()));
            Ok(())
        }
        fn on_part_complete(&mut self) -> CbResult {
            self.events.push(Event::PartComplete);
            Ok(())
        }
        fn on_complete(&mut self) -> CbResult {
            self.events.push(Event::Complete);
            Ok(())
        }
    }

    fn ev(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    const TWO_PARTS: &str = "--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nAAA\r\n--X\r\nContent-Disposition: form-data; name=\"b\"; filename=\"f.txt\"\r\n\r\nBBB\r\n--X--\r\n";

    #[test]
    fn two_part_form() {
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        parser.execute(&mut trace, TWO_PARTS.as_bytes()).unwrap();
        assert!(parser.is_complete());

        assert_eq!(
            trace.normalized(),
            vec![
                Event::PartBegin,
                Event::Field(ev("Content-Disposition")),
                Event::Value(ev("form-data; name=\"a\"")),
                Event::Name(ev("a")),
                Event::HeadersComplete,
                Event::Data(ev("AAA")),
                Event::PartComplete,
                Event::PartBegin,
                Event::Field(ev("Content-Disposition")),
                Event::Value(ev("form-data; name=\"b\"; filename=\"f.txt\"")),
                Event::Name(ev("b")),
                Event::Filename(ev("f.txt")),
                Event::HeadersComplete,
                Event::Data(ev("BBB")),
                Event::PartComplete,
                Event::Complete,
            ]
        );
    }

    #[test]
    fn split_feeding_produces_the_same_trace() {
        let mut whole = Trace::default();
        let mut parser = MultipartParser::new(b"X").unwrap();
        parser.execute(&mut whole, TWO_PARTS.as_bytes()).unwrap();

        for split in 1..10 {
            let mut trace = Trace::default();
            let mut parser = MultipartParser::new(b"X").unwrap();
            for chunk in TWO_PARTS.as_bytes().chunks(split) {
                parser.execute(&mut trace, chunk).unwrap();
            }
            assert!(parser.is_complete(), "split {split}");
            assert_eq!(trace.normalized(), whole.normalized(), "split {split}");
        }
    }

    #[test]
    fn immediate_terminator_has_no_parts() {
        let mut parser = MultipartParser::new(b"B").unwrap();
        let mut trace = Trace::default();
        parser.execute(&mut trace, b"--B--\r\n").unwrap();
        assert!(parser.is_complete());
        assert_eq!(trace.normalized(), vec![Event::Complete]);
    }

    #[test]
    fn bare_lf_delimiters_are_tolerated() {
        let body = "--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nline1\n--X\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nBB\n--X--\r\n";
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        parser.execute(&mut trace, body.as_bytes()).unwrap();
        assert!(parser.is_complete());
        assert_eq!(trace.part_data(), b"line1BB");
    }

    #[test]
    fn body_bytes_survive_boundary_lookalikes() {
        let body = "--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\ndata\r\n--Xnot a boundary\r\n--X--\r\n";
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        parser.execute(&mut trace, body.as_bytes()).unwrap();
        assert!(parser.is_complete());
        assert_eq!(trace.part_data(), b"data\r\n--Xnot a boundary");
    }

    #[test]
    fn no_premature_emission_around_a_split_boundary() {
        let mut parser = MultipartParser::new(b"LONGBOUND").unwrap();
        let mut trace = Trace::default();

        parser
            .execute(&mut trace, b"--LONGBOUND\r\n\r\npayload\r\n--LONGB")
            .unwrap();
        // The tail could still turn into the delimiter: whatever was
        // flushed so far must be a prefix of the real payload, with none
        // of the pending delimiter bytes in it.
        let flushed = trace.part_data();
        assert!(b"payload".starts_with(&flushed[..]), "flushed: {flushed:?}");

        parser.execute(&mut trace, b"OUND--\r\n").unwrap();
        assert!(parser.is_complete());
        assert_eq!(trace.part_data(), b"payload");
    }

    #[test]
    fn part_data_concatenation_is_exact() {
        let payload: Vec<u8> = (0u32..4096).flat_map(|i| i.to_le_bytes()).collect();
        let mut body = Vec::new();
        body.extend_from_slice(b"--bound\r\nContent-Disposition: form-data; name=\"blob\"\r\n\r\n");
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--bound--\r\n");

        for split in [1, 3, 7, 64, 1024] {
            let mut parser = MultipartParser::new(b"bound").unwrap();
            let mut trace = Trace::default();
            for chunk in body.chunks(split) {
                parser.execute(&mut trace, chunk).unwrap();
            }
            assert!(parser.is_complete(), "split {split}");
            assert_eq!(trace.part_data(), payload, "split {split}");
        }
    }

    #[test]
    fn boundary_length_is_validated() {
        assert_eq!(
            MultipartParser::new(b"").unwrap_err(),
            MultipartError::InvalidBoundary
        );
        assert_eq!(
            MultipartParser::new(&[b'a'; 71]).unwrap_err(),
            MultipartError::InvalidBoundary
        );
        assert!(MultipartParser::new(&[b'a'; 70]).is_ok());
    }

    #[test]
    fn garbage_instead_of_first_boundary_is_an_error() {
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        let err = parser.execute(&mut trace, b"not multipart").unwrap_err();
        assert_eq!(err, MultipartError::ExpectedBoundary);
        // Sticky until reset.
        assert_eq!(parser.execute(&mut trace, b"--X\r\n").unwrap_err(), err);
        parser.reset();
        parser.execute(&mut trace, b"--X--\r\n").unwrap();
        assert!(parser.is_complete());
    }

    #[test]
    fn malformed_part_header_is_an_error() {
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        let err = parser
            .execute(&mut trace, b"--X\r\nno colon here\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, MultipartError::Header);
    }

    #[test]
    fn header_limits_are_enforced() {
        let mut parser = MultipartParser::with_config(
            b"X",
            Config {
                max_headers: 1,
                ..Config::default()
            },
        )
        .unwrap();
        let mut trace = Trace::default();
        let err = parser
            .execute(&mut trace, b"--X\r\na: 1\r\nb: 2\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, MultipartError::TooManyHeaders);

        let mut parser = MultipartParser::with_config(
            b"X",
            Config {
                max_header_size: 8,
                ..Config::default()
            },
        )
        .unwrap();
        let mut trace = Trace::default();
        let err = parser
            .execute(&mut trace, b"--X\r\nx-very-long-header: value\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, MultipartError::HeaderTooLarge);
    }

    #[test]
    fn epilogue_after_the_final_boundary_is_ignored() {
        let mut parser = MultipartParser::new(b"X").unwrap();
        let mut trace = Trace::default();
        parser
            .execute(&mut trace, b"--X--\r\nthis is an epilogue")
            .unwrap();
        assert!(parser.is_complete());
        parser.execute(&mut trace, b"more epilogue").unwrap();
        assert_eq!(trace.normalized(), vec![Event::Complete]);
    }
}
