//! Resumable push parser for HTTP/1.x message streams.
//!
//! `execute` consumes as many bytes as it can and reports how many, leaving
//! the machine mid-state for the next call; data callbacks receive slices
//! of the caller's input and may fire several times for one logical token
//! when it spans calls. The parser owns only small accumulators for the
//! tokens it must understand itself (method, semantic header values), never
//! the message body.

use http::Method;

use super::chunk::{ChunkError, ChunkedDecoder};

/// Marker returned by a callback to abort the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

pub type CbResult = Result<(), Abort>;

/// Event sink for the parser. Data callbacks may fire multiple times per
/// token; structural callbacks fire at most once per message.
pub trait Callbacks {
    fn on_message_begin(&mut self) -> CbResult {
        Ok(())
    }
    fn on_url(&mut self, _raw: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_status(&mut self, _raw: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_header_field(&mut self, _raw: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_header_value(&mut self, _raw: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_headers_complete(&mut self, _head: &Head) -> CbResult {
        Ok(())
    }
    fn on_body(&mut self, _chunk: &[u8]) -> CbResult {
        Ok(())
    }
    fn on_message_complete(&mut self) -> CbResult {
        Ok(())
    }
    fn on_error(&mut self, _error: &ParseError) {}
}

/// What the parser expects on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    Request,
    Response,
    /// Detect per message: a line starting with `HTTP/` is a response,
    /// anything else a request.
    Either,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kind: Kind,
    /// Byte budget for a single header line (name plus value).
    pub max_header_size: usize,
    pub max_headers: usize,
    pub max_url_size: usize,
    /// Reject tolerated deviations such as bare LF line endings and extra
    /// spaces in the start line.
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: Kind::Request,
            max_header_size: 8 * 1024,
            max_headers: 100,
            max_url_size: 8 * 1024,
            strict: false,
        }
    }
}

impl Config {
    pub fn request() -> Self {
        Self::default()
    }

    pub fn response() -> Self {
        Self {
            kind: Kind::Response,
            ..Self::default()
        }
    }

    pub fn either() -> Self {
        Self {
            kind: Kind::Either,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Method,
    Url,
    UrlTooLarge,
    Version,
    Status,
    HeaderName,
    HeaderValue,
    HeaderTooLarge,
    TooManyHeaders,
    ContentLength,
    Chunk,
    Callback,
    UnexpectedEof,
}

impl ParseError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Method => "invalid or unknown request method",
            Self::Url => "invalid character in url",
            Self::UrlTooLarge => "url exceeds configured limit",
            Self::Version => "malformed http version",
            Self::Status => "malformed status line",
            Self::HeaderName => "invalid header name",
            Self::HeaderValue => "invalid header value",
            Self::HeaderTooLarge => "header line exceeds configured limit",
            Self::TooManyHeaders => "too many headers",
            Self::ContentLength => "invalid or conflicting content-length",
            Self::Chunk => "invalid chunked framing",
            Self::Callback => "aborted by callback",
            Self::UnexpectedEof => "connection closed mid-message",
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ParseError {}

/// Parsed start line and semantic header state, handed to
/// [`Callbacks::on_headers_complete`] and readable through the parser's
/// accessors afterwards.
#[derive(Debug, Clone, Default)]
pub struct Head {
    pub method: Option<Method>,
    pub status: u16,
    pub major: u8,
    pub minor: u8,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub upgrade: bool,
    pub keep_alive: bool,
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Decide,
    Method,
    Url,
    ReqVersion { pos: u8 },
    ReqMajor,
    ReqDot,
    ReqMinor,
    ReqLineEnd,
    ReqLineLf,
    RespVersion { pos: u8 },
    RespMajor,
    RespDot,
    RespMinor,
    RespStatusSp,
    RespStatus { digits: u8 },
    RespAfterStatus,
    RespReason,
    RespLineLf,
    HeaderFieldStart,
    HeaderField,
    HeaderBeforeColon,
    HeaderOws,
    HeaderValue,
    HeaderLineLf,
    HeadersAlmostDone,
    Body,
    Done,
}

enum Framing {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    None,
    ContentLength,
    TransferEncoding,
    Connection,
    Upgrade,
}

const VERSION_PREFIX: &[u8] = b"HTTP/";
/// Longest method token plus slack; anything bigger is garbage.
const METHOD_CAP: usize = 10;
const NAME_CAP: usize = 40;
const VALUE_CAP: usize = 256;

pub struct Parser {
    config: Config,
    state: State,
    resolved: Kind,
    head: Head,
    framing: Framing,
    error: Option<ParseError>,
    complete: bool,
    /// Method bytes, also the `Either` lookahead.
    token: Vec<u8>,
    /// Lowercased current header name, capped at `NAME_CAP`.
    name_buf: Vec<u8>,
    name_overflow: bool,
    /// Value accumulator for headers the parser itself interprets.
    value_buf: Vec<u8>,
    /// Value whitespace held back until it turns out not to be trailing.
    ws_buf: Vec<u8>,
    /// Whether the current header line produced any `on_header_value`.
    value_emitted: bool,
    interest: Interest,
    conn_close: bool,
    conn_keep_alive: bool,
    url_len: usize,
    header_line_len: usize,
    header_count: usize,
}

impl Parser {
    pub fn new(config: Config) -> Self {
        let resolved = config.kind;
        Self {
            config,
            state: State::Start,
            resolved,
            head: Head::default(),
            framing: Framing::None,
            error: None,
            complete: false,
            token: Vec::new(),
            name_buf: Vec::new(),
            name_overflow: false,
            value_buf: Vec::new(),
            ws_buf: Vec::new(),
            value_emitted: false,
            interest: Interest::None,
            conn_close: false,
            conn_keep_alive: false,
            url_len: 0,
            header_line_len: 0,
            header_count: 0,
        }
    }

    /// Restart for the next message on the same stream. Configuration is
    /// kept; buffers are reused without reallocation.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.resolved = self.config.kind;
        self.head = Head::default();
        self.framing = Framing::None;
        self.error = None;
        self.complete = false;
        self.token.clear();
        self.name_buf.clear();
        self.name_overflow = false;
        self.value_buf.clear();
        self.ws_buf.clear();
        self.value_emitted = false;
        self.interest = Interest::None;
        self.conn_close = false;
        self.conn_keep_alive = false;
        self.url_len = 0;
        self.header_line_len = 0;
        self.header_count = 0;
    }

    /// Feed bytes. Returns how many were consumed, which is less than
    /// `buf.len()` only when a message completed mid-buffer; the caller
    /// feeds the tail to the next message after [`Parser::reset`].
    ///
    /// A parse error is sticky: every later call returns it again.
    pub fn execute<C: Callbacks>(&mut self, callbacks: &mut C, buf: &[u8]) -> Result<usize, ParseError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match self.run(callbacks, buf) {
            Ok(consumed) => Ok(consumed),
            Err(error) => {
                self.error = Some(error);
                callbacks.on_error(&error);
                Err(error)
            }
        }
    }

    /// Signal end of stream. Completes a read-until-close response body;
    /// errors when the stream ends mid-message.
    pub fn finish<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<(), ParseError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let result = match (self.state, &self.framing) {
            (State::Done, _) | (State::Start, _) => Ok(()),
            (State::Body, Framing::UntilClose) => self.complete_message(callbacks),
            _ => Err(ParseError::UnexpectedEof),
        };
        if let Err(error) = result {
            self.error = Some(error);
            callbacks.on_error(&error);
            return Err(error);
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn method(&self) -> Option<&Method> {
        self.head.method.as_ref()
    }

    pub fn status_code(&self) -> u16 {
        self.head.status
    }

    pub fn version(&self) -> (u8, u8) {
        (self.head.major, self.head.minor)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.head.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.head.chunked
    }

    pub fn is_upgrade(&self) -> bool {
        self.head.upgrade
    }

    pub fn is_keep_alive(&self) -> bool {
        self.head.keep_alive
    }

    pub fn should_close(&self) -> bool {
        self.head.close
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    fn run<C: Callbacks>(&mut self, cb: &mut C, buf: &[u8]) -> Result<usize, ParseError> {
        let strict = self.config.strict;
        let mut i = 0;

        while i < buf.len() {
            match self.state {
                State::Done => return Ok(i),

                State::Start => {
                    let byte = buf[i];
                    if (byte == b'\r' || byte == b'\n') && !strict {
                        // Stray newlines between pipelined messages.
                        i += 1;
                        continue;
                    }
                    cb.on_message_begin().map_err(abort)?;
                    self.state = match self.config.kind {
                        Kind::Request => {
                            self.resolved = Kind::Request;
                            State::Method
                        }
                        Kind::Response => {
                            self.resolved = Kind::Response;
                            State::RespVersion { pos: 0 }
                        }
                        Kind::Either => State::Decide,
                    };
                }

                State::Decide => {
                    let byte = buf[i];
                    let matched = self.token.len();
                    if matched < VERSION_PREFIX.len() && byte == VERSION_PREFIX[matched] {
                        self.token.push(byte);
                        i += 1;
                        if self.token.len() == VERSION_PREFIX.len() {
                            self.resolved = Kind::Response;
                            self.token.clear();
                            self.state = State::RespMajor;
                        }
                    } else {
                        // The accumulated prefix was method bytes after all
                        // ("HEAD" shares three with "HTTP/").
                        self.resolved = Kind::Request;
                        self.state = State::Method;
                    }
                }

                State::Method => {
                    let byte = buf[i];
                    if byte == b' ' {
                        let method = parse_method(&self.token).ok_or(ParseError::Method)?;
                        self.head.method = Some(method);
                        self.token.clear();
                        i += 1;
                        self.state = State::Url;
                    } else if byte.is_ascii_uppercase() && self.token.len() < METHOD_CAP {
                        self.token.push(byte);
                        i += 1;
                    } else {
                        return Err(ParseError::Method);
                    }
                }

                State::Url => {
                    if !strict && self.url_len == 0 {
                        while i < buf.len() && buf[i] == b' ' {
                            i += 1;
                        }
                    }
                    let start = i;
                    while i < buf.len() {
                        let byte = buf[i];
                        if byte == b' ' {
                            break;
                        }
                        if byte == b'\r' || byte == b'\n' || byte < 0x20 || byte == 0x7f {
                            return Err(ParseError::Url);
                        }
                        if byte >= 0x80 && strict {
                            return Err(ParseError::Url);
                        }
                        i += 1;
                    }
                    let segment = &buf[start..i];
                    if !segment.is_empty() {
                        self.url_len += segment.len();
                        if self.url_len > self.config.max_url_size {
                            return Err(ParseError::UrlTooLarge);
                        }
                        cb.on_url(segment).map_err(abort)?;
                    }
                    if i < buf.len() {
                        if self.url_len == 0 {
                            return Err(ParseError::Url);
                        }
                        i += 1;
                        self.state = State::ReqVersion { pos: 0 };
                    }
                }

                State::ReqVersion { pos } => {
                    let byte = buf[i];
                    if pos == 0 && byte == b' ' && !strict {
                        i += 1;
                        continue;
                    }
                    if byte == VERSION_PREFIX[pos as usize] {
                        i += 1;
                        self.state = if pos as usize + 1 == VERSION_PREFIX.len() {
                            State::ReqMajor
                        } else {
                            State::ReqVersion { pos: pos + 1 }
                        };
                    } else {
                        return Err(ParseError::Version);
                    }
                }

                State::ReqMajor | State::RespMajor => {
                    let byte = buf[i];
                    if !byte.is_ascii_digit() {
                        return Err(ParseError::Version);
                    }
                    self.head.major = byte - b'0';
                    i += 1;
                    self.state = if self.state == State::ReqMajor {
                        State::ReqDot
                    } else {
                        State::RespDot
                    };
                }

                State::ReqDot | State::RespDot => {
                    if buf[i] != b'.' {
                        return Err(ParseError::Version);
                    }
                    i += 1;
                    self.state = if self.state == State::ReqDot {
                        State::ReqMinor
                    } else {
                        State::RespMinor
                    };
                }

                State::ReqMinor | State::RespMinor => {
                    let byte = buf[i];
                    if !byte.is_ascii_digit() {
                        return Err(ParseError::Version);
                    }
                    self.head.minor = byte - b'0';
                    i += 1;
                    self.state = if self.state == State::ReqMinor {
                        State::ReqLineEnd
                    } else {
                        State::RespStatusSp
                    };
                }

                State::ReqLineEnd => match buf[i] {
                    b'\r' => {
                        i += 1;
                        self.state = State::ReqLineLf;
                    }
                    b'\n' if !strict => {
                        i += 1;
                        self.state = State::HeaderFieldStart;
                    }
                    _ => return Err(ParseError::Version),
                },

                State::ReqLineLf | State::RespLineLf => {
                    if buf[i] != b'\n' {
                        return Err(ParseError::Version);
                    }
                    i += 1;
                    self.state = State::HeaderFieldStart;
                }

                State::HeaderLineLf => {
                    if buf[i] != b'\n' {
                        return Err(ParseError::HeaderValue);
                    }
                    i += 1;
                    self.state = State::HeaderFieldStart;
                }

                State::RespVersion { pos } => {
                    if buf[i] == VERSION_PREFIX[pos as usize] {
                        i += 1;
                        self.state = if pos as usize + 1 == VERSION_PREFIX.len() {
                            State::RespMajor
                        } else {
                            State::RespVersion { pos: pos + 1 }
                        };
                    } else {
                        return Err(ParseError::Version);
                    }
                }

                State::RespStatusSp => {
                    if buf[i] != b' ' {
                        return Err(ParseError::Status);
                    }
                    i += 1;
                    self.state = State::RespStatus { digits: 0 };
                }

                State::RespStatus { digits } => {
                    let byte = buf[i];
                    if !byte.is_ascii_digit() {
                        return Err(ParseError::Status);
                    }
                    self.head.status = self.head.status * 10 + u16::from(byte - b'0');
                    i += 1;
                    if digits == 2 {
                        if self.head.status < 100 {
                            return Err(ParseError::Status);
                        }
                        self.state = State::RespAfterStatus;
                    } else {
                        self.state = State::RespStatus { digits: digits + 1 };
                    }
                }

                State::RespAfterStatus => match buf[i] {
                    b' ' => {
                        i += 1;
                        self.state = State::RespReason;
                    }
                    b'\r' => {
                        i += 1;
                        self.state = State::RespLineLf;
                    }
                    b'\n' if !strict => {
                        i += 1;
                        self.state = State::HeaderFieldStart;
                    }
                    _ => return Err(ParseError::Status),
                },

                State::RespReason => {
                    let start = i;
                    while i < buf.len() {
                        let byte = buf[i];
                        if byte == b'\r' || byte == b'\n' {
                            break;
                        }
                        if byte < 0x20 && byte != b'\t' {
                            return Err(ParseError::Status);
                        }
                        i += 1;
                    }
                    if i > start {
                        cb.on_status(&buf[start..i]).map_err(abort)?;
                    }
                    if i < buf.len() {
                        let byte = buf[i];
                        if byte == b'\n' && strict {
                            return Err(ParseError::Status);
                        }
                        i += 1;
                        self.state = if byte == b'\r' {
                            State::RespLineLf
                        } else {
                            State::HeaderFieldStart
                        };
                    }
                }

                State::HeaderFieldStart => {
                    let byte = buf[i];
                    if byte == b'\r' {
                        i += 1;
                        self.state = State::HeadersAlmostDone;
                    } else if byte == b'\n' {
                        if strict {
                            return Err(ParseError::HeaderName);
                        }
                        i += 1;
                        if self.finish_headers(cb)? {
                            return Ok(i);
                        }
                    } else if byte == b' ' || byte == b'\t' {
                        // Obsolete line folding is ambiguous; rejected in
                        // both modes.
                        return Err(ParseError::HeaderName);
                    } else {
                        self.state = State::HeaderField;
                    }
                }

                State::HeaderField => {
                    let start = i;
                    while i < buf.len() {
                        let byte = buf[i];
                        if byte == b':' || byte == b' ' || byte == b'\t' {
                            break;
                        }
                        if !is_token_char(byte) {
                            return Err(ParseError::HeaderName);
                        }
                        i += 1;
                    }
                    let segment = &buf[start..i];
                    if !segment.is_empty() {
                        self.bump_header_line(segment.len())?;
                        for &byte in segment {
                            if self.name_buf.len() < NAME_CAP {
                                self.name_buf.push(byte.to_ascii_lowercase());
                            } else {
                                self.name_overflow = true;
                            }
                        }
                        cb.on_header_field(segment).map_err(abort)?;
                    }
                    if i < buf.len() {
                        match buf[i] {
                            b':' => {
                                if self.name_buf.is_empty() {
                                    return Err(ParseError::HeaderName);
                                }
                                i += 1;
                                self.classify_header();
                                self.state = State::HeaderOws;
                            }
                            _ if strict => return Err(ParseError::HeaderName),
                            _ => {
                                i += 1;
                                self.state = State::HeaderBeforeColon;
                            }
                        }
                    }
                }

                State::HeaderBeforeColon => match buf[i] {
                    b' ' | b'\t' => i += 1,
                    b':' => {
                        if self.name_buf.is_empty() {
                            return Err(ParseError::HeaderName);
                        }
                        i += 1;
                        self.classify_header();
                        self.state = State::HeaderOws;
                    }
                    _ => return Err(ParseError::HeaderName),
                },

                State::HeaderOws => match buf[i] {
                    b' ' | b'\t' => i += 1,
                    b'\r' => {
                        i += 1;
                        self.end_header_line(cb)?;
                        self.state = State::HeaderLineLf;
                    }
                    b'\n' if !strict => {
                        i += 1;
                        self.end_header_line(cb)?;
                        self.state = State::HeaderFieldStart;
                    }
                    _ => self.state = State::HeaderValue,
                },

                State::HeaderValue => {
                    let byte = buf[i];
                    if byte == b'\r' || byte == b'\n' {
                        if byte == b'\n' && strict {
                            return Err(ParseError::HeaderValue);
                        }
                        // Whatever whitespace was held back is trailing.
                        self.ws_buf.clear();
                        i += 1;
                        self.end_header_line(cb)?;
                        self.state = if byte == b'\r' {
                            State::HeaderLineLf
                        } else {
                            State::HeaderFieldStart
                        };
                        continue;
                    }
                    if byte == b' ' || byte == b'\t' {
                        self.bump_header_line(1)?;
                        self.ws_buf.push(byte);
                        i += 1;
                        continue;
                    }
                    if byte == 0 || (strict && (byte < 0x20 || byte == 0x7f)) {
                        return Err(ParseError::HeaderValue);
                    }
                    if !self.ws_buf.is_empty() {
                        let ws = std::mem::take(&mut self.ws_buf);
                        self.push_value(cb, &ws)?;
                        self.ws_buf = ws;
                        self.ws_buf.clear();
                    }
                    let start = i;
                    while i < buf.len() {
                        let byte = buf[i];
                        if byte == b'\r' || byte == b'\n' || byte == b' ' || byte == b'\t' || byte == 0 {
                            break;
                        }
                        if strict && (byte < 0x20 || byte == 0x7f) {
                            break;
                        }
                        i += 1;
                    }
                    let segment = &buf[start..i];
                    self.bump_header_line(segment.len())?;
                    self.push_value(cb, segment)?;
                }

                State::HeadersAlmostDone => {
                    if buf[i] != b'\n' {
                        return Err(ParseError::HeaderName);
                    }
                    i += 1;
                    if self.finish_headers(cb)? {
                        return Ok(i);
                    }
                }

                State::Body => {
                    enum BodyStep {
                        Consumed,
                        Complete,
                    }
                    let step = match &mut self.framing {
                        Framing::Length(rem) => {
                            let take = (*rem).min((buf.len() - i) as u64) as usize;
                            if take > 0 {
                                cb.on_body(&buf[i..i + take]).map_err(abort)?;
                                i += take;
                                *rem -= take as u64;
                            }
                            if *rem == 0 { BodyStep::Complete } else { BodyStep::Consumed }
                        }
                        Framing::UntilClose => {
                            cb.on_body(&buf[i..]).map_err(abort)?;
                            i = buf.len();
                            BodyStep::Consumed
                        }
                        Framing::Chunked(decoder) => {
                            let done = decoder
                                .advance(buf, &mut i, &mut |start, end| cb.on_body(&buf[start..end]))
                                .map_err(|e| match e {
                                    ChunkError::Aborted => ParseError::Callback,
                                    _ => ParseError::Chunk,
                                })?;
                            if done { BodyStep::Complete } else { BodyStep::Consumed }
                        }
                        Framing::None => BodyStep::Complete,
                    };
                    if let BodyStep::Complete = step {
                        self.complete_message(cb)?;
                        return Ok(i);
                    }
                }
            }
        }
        Ok(i)
    }

    fn bump_header_line(&mut self, n: usize) -> Result<(), ParseError> {
        self.header_line_len += n;
        if self.header_line_len > self.config.max_header_size {
            return Err(ParseError::HeaderTooLarge);
        }
        Ok(())
    }

    fn push_value<C: Callbacks>(&mut self, cb: &mut C, segment: &[u8]) -> Result<(), ParseError> {
        if segment.is_empty() {
            return Ok(());
        }
        self.value_emitted = true;
        if self.interest != Interest::None {
            if self.value_buf.len() + segment.len() > VALUE_CAP {
                return Err(ParseError::HeaderValue);
            }
            self.value_buf.extend_from_slice(segment);
        }
        cb.on_header_value(segment).map_err(abort)
    }

    fn classify_header(&mut self) {
        self.interest = if self.name_overflow {
            Interest::None
        } else {
            match self.name_buf.as_slice() {
                b"content-length" => Interest::ContentLength,
                b"transfer-encoding" => Interest::TransferEncoding,
                b"connection" => Interest::Connection,
                b"upgrade" => Interest::Upgrade,
                _ => Interest::None,
            }
        };
        self.value_buf.clear();
    }

    fn end_header_line<C: Callbacks>(&mut self, cb: &mut C) -> Result<(), ParseError> {
        if !self.value_emitted {
            // A valueless header still pairs its field callback with one
            // (empty) value callback, so sinks can delimit headers.
            cb.on_header_value(&[]).map_err(abort)?;
        }
        self.header_count += 1;
        if self.header_count > self.config.max_headers {
            return Err(ParseError::TooManyHeaders);
        }
        match self.interest {
            Interest::ContentLength => {
                if self.head.content_length.is_some() || self.value_buf.is_empty() {
                    return Err(ParseError::ContentLength);
                }
                let mut length: u64 = 0;
                for &byte in &self.value_buf {
                    if !byte.is_ascii_digit() {
                        return Err(ParseError::ContentLength);
                    }
                    length = length
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(u64::from(byte - b'0')))
                        .ok_or(ParseError::ContentLength)?;
                }
                self.head.content_length = Some(length);
            }
            Interest::TransferEncoding => {
                for token in self.value_buf.split(|&b| b == b',') {
                    if trim(token).eq_ignore_ascii_case(b"chunked") {
                        self.head.chunked = true;
                    }
                }
            }
            Interest::Connection => {
                for token in self.value_buf.split(|&b| b == b',') {
                    let token = trim(token);
                    if token.eq_ignore_ascii_case(b"keep-alive") {
                        self.conn_keep_alive = true;
                        self.conn_close = false;
                    } else if token.eq_ignore_ascii_case(b"close") {
                        self.conn_close = true;
                        self.conn_keep_alive = false;
                    }
                }
            }
            Interest::Upgrade => self.head.upgrade = true,
            Interest::None => {}
        }
        self.interest = Interest::None;
        self.name_buf.clear();
        self.name_overflow = false;
        self.value_buf.clear();
        self.ws_buf.clear();
        self.value_emitted = false;
        self.header_line_len = 0;
        Ok(())
    }

    /// Returns true when the message completed at the header boundary.
    fn finish_headers<C: Callbacks>(&mut self, cb: &mut C) -> Result<bool, ParseError> {
        if self.head.method == Some(Method::CONNECT) {
            self.head.upgrade = true;
        }

        let http11 = self.head.major > 1 || (self.head.major == 1 && self.head.minor >= 1);
        self.head.keep_alive = !self.conn_close && (http11 || self.conn_keep_alive);
        self.head.close = !self.head.keep_alive;

        let is_response = self.resolved == Kind::Response;
        let framing = if self.head.upgrade {
            Framing::None
        } else if self.head.chunked {
            Framing::Chunked(ChunkedDecoder::new())
        } else if let Some(length) = self.head.content_length {
            if length == 0 { Framing::None } else { Framing::Length(length) }
        } else if is_response && response_has_body(self.head.status) {
            Framing::UntilClose
        } else {
            Framing::None
        };

        if matches!(framing, Framing::UntilClose) {
            self.head.keep_alive = false;
            self.head.close = true;
        }

        cb.on_headers_complete(&self.head).map_err(abort)?;

        match framing {
            Framing::None => {
                self.complete_message(cb)?;
                Ok(true)
            }
            framing => {
                self.framing = framing;
                self.state = State::Body;
                Ok(false)
            }
        }
    }

    fn complete_message<C: Callbacks>(&mut self, cb: &mut C) -> Result<(), ParseError> {
        self.state = State::Done;
        self.complete = true;
        cb.on_message_complete().map_err(abort)
    }
}

fn abort(_: Abort) -> ParseError {
    ParseError::Callback
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

fn response_has_body(status: u16) -> bool {
    !(status < 200 || status == 204 || status == 304)
}

fn parse_method(token: &[u8]) -> Option<Method> {
    match token {
        b"GET" => Some(Method::GET),
        b"HEAD" => Some(Method::HEAD),
        b"POST" => Some(Method::POST),
        b"PUT" => Some(Method::PUT),
        b"DELETE" => Some(Method::DELETE),
        b"CONNECT" => Some(Method::CONNECT),
        b"OPTIONS" => Some(Method::OPTIONS),
        b"TRACE" => Some(Method::TRACE),
        b"PATCH" => Some(Method::PATCH),
        _ => None,
    }
}

fn is_token_char(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Begin,
        Url(Vec<u8>),
        Status(Vec<u8>),
        Field(Vec<u8>),
        Value(Vec<u8>),
        HeadersComplete,
        Body(Vec<u8>),
        Complete,
    }

    #[derive(Default)]
    struct Trace {
        events: Vec<Event>,
        head: Option<Head>,
    }

    impl Trace {
        /// Collapse adjacent data events of the same kind so traces are
        /// comparable across arbitrary input splits.
        fn normalized(&self) -> Vec<Event> {
            let mut out: Vec<Event> = Vec::new();
            for event in &self.events {
                match (out.last_mut(), event) {
                    (Some(Event::Url(a)), Event::Url(b)) => a.extend_from_slice(b),
                    (Some(Event::Status(a)), Event::Status(b)) => a.extend_from_slice(b),
                    (Some(Event::Field(a)), Event::Field(b)) => a.extend_from_slice(b),
                    (Some(Event::Value(a)), Event::Value(b)) => a.extend_from_slice(b),
                    (Some(Event::Body(a)), Event::Body(b)) => a.extend_from_slice(b),
                    _ => out.push(event.clone()),
                }
            }
            out
        }
    }

    impl Callbacks for Trace {
        fn on_message_begin(&mut self) -> CbResult {
            self.events.push(Event::Begin);
            Ok(())
        }
        fn on_url(&mut self, raw: &[u8]) -> CbResult {
            self.events.push(Event::Url(raw.to_vec()));
            Ok(())
        }
        fn on_status(&mut self, raw: &[u8]) -> CbResult {
            self.events.push(Event::Status(raw.to_vec()));
            Ok(())
        }
        fn on_header_field(&mut self, raw: &[u8]) -> CbResult {
            self.events.push(Event::Field(raw.to_vec()));
            Ok(())
        }
        fn on_header_value(&mut self, raw: &[u8]) -> CbResult {
            self.events.push(Event::Value(raw.to_vec()));
            Ok(())
        }
        fn on_headers_complete(&mut self, head: &Head) -> CbResult {
            self.head = Some(head.clone());
            self.events.push(Event::HeadersComplete);
            Ok(())
        }
        fn on_body(&mut self, chunk: &[u8]) -> CbResult {
            self.events.push(Event::Body(chunk.to_vec()));
            Ok(())
        }
        fn on_message_complete(&mut self) -> CbResult {
            self.events.push(Event::Complete);
            Ok(())
        }
    }

    fn ev(bytes: &str) -> Vec<u8> {
        bytes.as_bytes().to_vec()
    }

    const REQUEST: &str = "GET /a?x=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn request_with_body() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();

        let consumed = parser.execute(&mut trace, REQUEST.as_bytes()).unwrap();
        assert_eq!(consumed, REQUEST.len());
        assert!(parser.is_complete());

        assert_eq!(
            trace.normalized(),
            vec![
                Event::Begin,
                Event::Url(ev("/a?x=1")),
                Event::Field(ev("Host")),
                Event::Value(ev("h")),
                Event::Field(ev("Content-Length")),
                Event::Value(ev("5")),
                Event::HeadersComplete,
                Event::Body(ev("hello")),
                Event::Complete,
            ]
        );

        let head = trace.head.unwrap();
        assert_eq!(head.method, Some(Method::GET));
        assert_eq!((head.major, head.minor), (1, 1));
        assert_eq!(head.content_length, Some(5));
        assert!(head.keep_alive);
        assert!(!head.chunked);
    }

    #[test]
    fn streaming_equivalence_byte_by_byte() {
        let mut whole = Trace::default();
        let mut parser = Parser::new(Config::request());
        parser.execute(&mut whole, REQUEST.as_bytes()).unwrap();

        for split in 1..8 {
            let mut split_trace = Trace::default();
            let mut parser = Parser::new(Config::request());
            let mut consumed = 0;
            for chunk in REQUEST.as_bytes().chunks(split) {
                consumed += parser.execute(&mut split_trace, chunk).unwrap();
            }
            assert_eq!(consumed, REQUEST.len());
            assert!(parser.is_complete());
            assert_eq!(split_trace.normalized(), whole.normalized(), "split {split}");
        }
    }

    #[test]
    fn chunked_response() {
        let input =
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        let mut parser = Parser::new(Config::response());
        let mut trace = Trace::default();

        let consumed = parser.execute(&mut trace, input.as_bytes()).unwrap();
        assert_eq!(consumed, input.len());
        assert!(parser.is_complete());
        assert!(parser.is_chunked());
        assert_eq!(parser.status_code(), 200);

        let body: Vec<u8> = trace
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Body(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"Hello World");
        assert!(trace.events.contains(&Event::Complete));
    }

    #[test]
    fn empty_chunked_body_is_valid() {
        let input = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        let mut parser = Parser::new(Config::response());
        let mut trace = Trace::default();
        let consumed = parser.execute(&mut trace, input.as_bytes()).unwrap();
        assert_eq!(consumed, input.len());
        assert!(parser.is_complete());
        assert!(!trace.events.iter().any(|e| matches!(e, Event::Body(_))));
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        assert_eq!(parser.execute(&mut trace, &[]).unwrap(), 0);
        assert!(trace.events.is_empty());
    }

    #[test]
    fn pipelined_messages_need_reset() {
        let input = "GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();

        let consumed = parser.execute(&mut trace, input.as_bytes()).unwrap();
        assert!(parser.is_complete());
        assert!(consumed < input.len());

        // Feeding more without reset consumes nothing.
        assert_eq!(parser.execute(&mut trace, &input.as_bytes()[consumed..]).unwrap(), 0);

        parser.reset();
        let second = parser.execute(&mut trace, &input.as_bytes()[consumed..]).unwrap();
        assert_eq!(consumed + second, input.len());
        assert!(parser.is_complete());
        assert!(trace.normalized().contains(&Event::Url(ev("/two"))));
    }

    #[test]
    fn either_kind_detects_both() {
        let mut parser = Parser::new(Config::either());
        let mut trace = Trace::default();
        parser.execute(&mut trace, b"HEAD / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(parser.method(), Some(&Method::HEAD));

        let mut parser = Parser::new(Config::either());
        let mut trace = Trace::default();
        parser.execute(&mut trace, b"HTTP/1.0 204 No Content\r\n\r\n").unwrap();
        assert_eq!(parser.status_code(), 204);
        assert!(parser.is_complete());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser.execute(&mut trace, b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!parser.is_keep_alive());
        assert!(parser.should_close());

        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser
            .execute(&mut trace, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(parser.is_keep_alive());
    }

    #[test]
    fn connection_close_wins_last() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser
            .execute(&mut trace, b"GET / HTTP/1.1\r\nConnection: keep-alive, close, upgrade\r\n\r\n")
            .unwrap();
        assert!(parser.should_close());

        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser
            .execute(&mut trace, b"GET / HTTP/1.1\r\nConnection: close, keep-alive\r\n\r\n")
            .unwrap();
        assert!(parser.is_keep_alive());
    }

    #[test]
    fn negative_or_garbled_content_length_is_an_error() {
        for value in ["-1", "5x", "", "18446744073709551616"] {
            let input = format!("GET / HTTP/1.1\r\nContent-Length: {value}\r\n\r\n");
            let mut parser = Parser::new(Config::request());
            let mut trace = Trace::default();
            let err = parser.execute(&mut trace, input.as_bytes()).unwrap_err();
            assert_eq!(err, ParseError::ContentLength, "value {value:?}");
        }
    }

    #[test]
    fn duplicate_content_length_is_an_error() {
        let input = "GET / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        let err = parser.execute(&mut trace, input.as_bytes()).unwrap_err();
        assert_eq!(err, ParseError::ContentLength);
    }

    #[test]
    fn chunked_overrides_content_length() {
        let input = "POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n0\r\n\r\n";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser.execute(&mut trace, input.as_bytes()).unwrap();
        assert!(parser.is_complete());
        assert!(parser.is_chunked());
    }

    #[test]
    fn errors_are_sticky() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        let err = parser.execute(&mut trace, b"BOGUS\x01 / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(parser.execute(&mut trace, b"GET / HTTP/1.1\r\n\r\n").unwrap_err(), err);
        parser.reset();
        parser.execute(&mut trace, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(parser.is_complete());
    }

    #[test]
    fn callback_abort_is_sticky() {
        struct AbortOnUrl;
        impl Callbacks for AbortOnUrl {
            fn on_url(&mut self, _: &[u8]) -> CbResult {
                Err(Abort)
            }
        }
        let mut parser = Parser::new(Config::request());
        let err = parser.execute(&mut AbortOnUrl, b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::Callback);
        assert_eq!(parser.execute(&mut AbortOnUrl, b"x").unwrap_err(), ParseError::Callback);
    }

    #[test]
    fn strict_mode_rejects_bare_lf() {
        let input = b"GET / HTTP/1.1\nHost: h\n\n";
        let mut lenient = Parser::new(Config::request());
        let mut trace = Trace::default();
        lenient.execute(&mut trace, input).unwrap();
        assert!(lenient.is_complete());

        let mut strict = Parser::new(Config {
            strict: true,
            ..Config::request()
        });
        let mut trace = Trace::default();
        assert!(strict.execute(&mut trace, input).is_err());
    }

    #[test]
    fn upgrade_stops_at_the_header_boundary() {
        let input = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\r\n\x00\x01binary";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        let consumed = parser.execute(&mut trace, input).unwrap();
        assert!(parser.is_complete());
        assert!(parser.is_upgrade());
        // The opaque upgrade payload is left for the caller.
        assert_eq!(&input[consumed..], b"\x00\x01binary");
    }

    #[test]
    fn response_until_close_body_ends_at_finish() {
        let input = b"HTTP/1.0 200 OK\r\n\r\npartial body";
        let mut parser = Parser::new(Config::response());
        let mut trace = Trace::default();
        let consumed = parser.execute(&mut trace, input).unwrap();
        assert_eq!(consumed, input.len());
        assert!(!parser.is_complete());

        parser.finish(&mut trace).unwrap();
        assert!(parser.is_complete());
        assert!(parser.should_close());
        assert!(trace.normalized().contains(&Event::Body(ev("partial body"))));
    }

    #[test]
    fn finish_mid_headers_is_an_error() {
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser.execute(&mut trace, b"GET / HT").unwrap();
        assert_eq!(parser.finish(&mut trace).unwrap_err(), ParseError::UnexpectedEof);
    }

    #[test]
    fn header_limits_are_enforced() {
        let mut parser = Parser::new(Config {
            max_headers: 2,
            ..Config::request()
        });
        let mut trace = Trace::default();
        let input = b"GET / HTTP/1.1\r\na: 1\r\nb: 2\r\nc: 3\r\n\r\n";
        assert_eq!(parser.execute(&mut trace, input).unwrap_err(), ParseError::TooManyHeaders);

        let mut parser = Parser::new(Config {
            max_header_size: 8,
            ..Config::request()
        });
        let mut trace = Trace::default();
        let input = b"GET / HTTP/1.1\r\nx-long-header-name: value\r\n\r\n";
        assert_eq!(parser.execute(&mut trace, input).unwrap_err(), ParseError::HeaderTooLarge);

        let mut parser = Parser::new(Config {
            max_url_size: 4,
            ..Config::request()
        });
        let mut trace = Trace::default();
        assert_eq!(
            parser.execute(&mut trace, b"GET /abcdef HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::UrlTooLarge
        );
    }

    #[test]
    fn valueless_header_still_pairs_field_and_value() {
        let input = b"GET / HTTP/1.1\r\nX-Empty:\r\nHost: h\r\n\r\n";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser.execute(&mut trace, input).unwrap();
        assert_eq!(
            trace.normalized(),
            vec![
                Event::Begin,
                Event::Url(ev("/")),
                Event::Field(ev("X-Empty")),
                Event::Value(ev("")),
                Event::Field(ev("Host")),
                Event::Value(ev("h")),
                Event::HeadersComplete,
                Event::Complete,
            ]
        );
    }

    #[test]
    fn value_whitespace_is_trimmed_only_at_the_edges() {
        let input = b"GET / HTTP/1.1\r\nX-Note:   spaced   out   \r\n\r\n";
        let mut parser = Parser::new(Config::request());
        let mut trace = Trace::default();
        parser.execute(&mut trace, input).unwrap();
        assert!(trace.normalized().contains(&Event::Value(ev("spaced   out"))));
    }
}
