//! Request line, header parsing, and the buffered non-blocking line reader.
//!
//! Request bodies are out of scope for this crate — only the request line
//! and headers are parsed. See the crate-level documentation.

use crate::{
    errors::ErrorKind,
    http::types::{self, Header, HeaderMap, Method, Url, Version},
    limits::ReqLimits,
    query::{Query, QueryCollector},
};
use memchr::memchr;
use mio::net::TcpStream;
use std::{io, io::Read, mem};

/// A single parsed HTTP request: method, target URL, version, and headers.
///
/// Reused across requests on the same connection — see [`Request::reset`].
#[derive(Debug, Clone, PartialEq)]
#[repr(align(128))]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: HeaderMap,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method::Get,
            url: Url::default(),
            version: Version::Http11,
            headers: HeaderMap::new(limits.header_count),
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.version = Version::Http11;
        self.headers.reset();
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    /// Uses linear search.
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Parses the request's raw query string into a collection, on demand.
    ///
    /// Returns an empty collection if the request target had no query string.
    #[inline]
    pub fn parse_query<'a, C: QueryCollector<'a>>(
        &'a self,
        limit: usize,
    ) -> Result<C, crate::query::Error> {
        match self.url.query_raw() {
            Some(raw) => Query::parse(raw, limit),
            None => Ok(C::with_capacity(0)),
        }
    }
}

/// How far a connection has gotten through parsing one request.
///
/// Carried per-connection so a request line or header block that arrives
/// split across several non-blocking readiness events resumes exactly
/// where the last event left off, instead of restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    RequestLine,
    Headers,
}

/// Result of one `read_request` attempt.
pub(crate) enum ReadOutcome {
    /// `request` is fully populated.
    Complete,
    /// The peer closed the connection before sending anything — a clean
    /// end, not an error.
    Closed,
    /// The socket would block before a full request arrived. `progress`
    /// and the reader's buffer are left intact; call again once the
    /// connection is next ready.
    Pending,
}

/// Reads a full request (request line + headers) into `request`, using
/// `reader` as the buffered line source over `stream`.
///
/// Resumable: on [`ReadOutcome::Pending`] nothing parsed so far is lost,
/// and `progress` records whether the request line has already landed.
/// Returns `Err(UnexpectedEof)` if the peer closes mid-request.
pub(crate) fn read_request(
    reader: &mut Reader,
    stream: &mut TcpStream,
    request: &mut Request,
    progress: &mut ReadProgress,
    req_limits: &ReqLimits,
) -> Result<ReadOutcome, ErrorKind> {
    if *progress == ReadProgress::RequestLine {
        let line = match reader.read_line(stream)? {
            LineStatus::Line(line) => line,
            LineStatus::Pending => return Ok(ReadOutcome::Pending),
            LineStatus::Eof => return Ok(ReadOutcome::Closed),
        };

        let (method, url, version) = parse_request_line(line, req_limits)?;
        request.method = method;
        request.url = url;
        request.version = version;
        *progress = ReadProgress::Headers;
    }

    loop {
        let line = match reader.read_line(stream)? {
            LineStatus::Line(line) => line,
            LineStatus::Pending => return Ok(ReadOutcome::Pending),
            LineStatus::Eof => return Err(ErrorKind::UnexpectedEof),
        };

        match parse_header_line(line, req_limits)? {
            Some(header) => {
                if request.headers.headers.len() >= req_limits.header_count {
                    return Err(ErrorKind::TooManyHeaders);
                }
                request.headers.headers.push(header);
            }
            None => break,
        }
    }

    Ok(ReadOutcome::Complete)
}

#[inline]
fn parse_request_line(
    line: &'static [u8],
    req_limits: &ReqLimits,
) -> Result<(Method, Url, Version), ErrorKind> {
    let (method, method_len) = Method::from_bytes(line)?;

    let end = match (line.ends_with(b"\r\n"), line.ends_with(b"\n")) {
        (true, _) => line.len() - 2,
        (false, true) => line.len() - 1,
        _ => return Err(ErrorKind::InvalidRequestLine),
    };

    // Shortest legal tail after the method: "/ HTTP/1.x" (10 bytes).
    if end < method_len + 10 || line[end - 9] != b' ' {
        return Err(ErrorKind::InvalidRequestLine);
    }

    let version_start = end - 8;
    let target = &line[method_len..version_start - 1];

    let version_bytes = &line[version_start..end];
    if &version_bytes[..5] != b"HTTP/" || version_bytes[6] != b'.' {
        return Err(ErrorKind::InvalidVersion);
    }
    let version = Version::from_bytes(version_bytes)?;

    if target.is_empty() || target[0] != b'/' {
        return Err(ErrorKind::InvalidRequestLine);
    }
    if target.len() > req_limits.url_size {
        return Err(ErrorKind::UrlTooLong);
    }

    let (path, query) = match memchr(b'?', target) {
        Some(q) => (&target[..q], Some(&target[q + 1..])),
        None => (target, None),
    };

    Ok((method, Url { target, path, query }, version))
}

#[inline]
fn parse_header_line(
    line: &'static [u8],
    req_limits: &ReqLimits,
) -> Result<Option<Header>, ErrorKind> {
    let end = match (line.ends_with(b"\r\n"), line.ends_with(b"\n")) {
        (true, _) => line.len() - 2,
        (false, true) => line.len() - 1,
        _ => return Err(ErrorKind::InvalidHeader),
    };

    if end == 0 {
        return Ok(None);
    }
    let body = &line[..end];

    let colon = memchr(b':', body).ok_or(ErrorKind::InvalidHeader)?;
    if colon == 0 || body.get(colon + 1) != Some(&b' ') {
        return Err(ErrorKind::InvalidHeader);
    }

    let value = &body[colon + 2..];
    if colon > req_limits.header_name_size || value.len() > req_limits.header_value_size {
        return Err(ErrorKind::InvalidHeader);
    }

    // SAFETY: `body` is a view into the worker's read buffer, which the
    // owning Reader never shares while a request is mid-parse. Lowercasing
    // in place here, before the name is handed out, is the same trick
    // `Reader::into_static` relies on for the rest of the buffer.
    let name_mut = unsafe { std::slice::from_raw_parts_mut(body.as_ptr() as *mut u8, colon) };
    types::to_lower_case(name_mut);
    let name: &'static [u8] = unsafe { mem::transmute(&*name_mut) };

    Ok(Some(Header::new(name, value)))
}

/// Outcome of one [`Reader::read_line`] call.
pub(crate) enum LineStatus {
    Line(&'static [u8]),
    Pending,
    Eof,
}

/// Buffered, non-blocking, zero-copy line reader.
///
/// Owns a single fixed-size buffer for the lifetime of the worker thread
/// that created it. Lines are handed out as `'static` slices into that
/// buffer — sound because the buffer outlives every `Request` built from
/// it, and is only ever read by the worker that owns this `Reader`.
#[derive(Debug)]
pub(crate) struct Reader {
    buffer: Box<[u8]>,
    /// One past the last byte filled by a socket read.
    len: usize,
    /// Where the next delimiter scan resumes — avoids rescanning bytes
    /// already known not to contain one.
    pos: usize,
    /// Start of the line currently being accumulated.
    start: usize,
}

impl Reader {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Reader {
            buffer: vec![0; limits.precalc.buffer].into_boxed_slice(),
            len: 0,
            pos: 0,
            start: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_bytes<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let mut buffer = vec![0; limits.precalc.buffer];
        let value = value.as_ref();
        buffer[..value.len()].copy_from_slice(value);

        Reader {
            buffer: buffer.into_boxed_slice(),
            len: value.len(),
            pos: 0,
            start: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.pos = 0;
        self.start = 0;
        self.buffer.fill(0);
    }

    /// Reads one line (including its `\n` terminator) from `stream`,
    /// performing non-blocking socket reads until a full line is available.
    ///
    /// A `WouldBlock` read never errors, whether or not a line is already
    /// partially buffered — it always yields [`LineStatus::Pending`] so the
    /// caller can retry on the next readiness event without losing what's
    /// already been read. Only a real zero-byte read (the peer's FIN) can
    /// end the line: cleanly as [`LineStatus::Eof`] with nothing pending,
    /// or as `Err(UnexpectedEof)` when it cuts a line in half.
    pub(crate) fn read_line(&mut self, stream: &mut TcpStream) -> Result<LineStatus, ErrorKind> {
        loop {
            if let Some(line) = self.scan_line() {
                return Ok(LineStatus::Line(line));
            }

            if self.start > 0 && self.start * 4 >= self.buffer.len() * 3 {
                self.compact();
            }
            if self.len == self.buffer.len() {
                return Err(ErrorKind::LineTooLong);
            }

            match stream.read(&mut self.buffer[self.len..]) {
                Ok(0) if self.start == self.len => return Ok(LineStatus::Eof),
                Ok(0) => return Err(ErrorKind::UnexpectedEof),
                Ok(n) => self.len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(LineStatus::Pending),
                Err(e) => return Err(ErrorKind::from(e)),
            }
        }
    }

    // Pure buffer scan — no I/O. Returns a line if one is already fully
    // present between `start` and `len`.
    fn scan_line(&mut self) -> Option<&'static [u8]> {
        let nl = memchr(b'\n', &self.buffer[self.pos..self.len])?;
        let nl = self.pos + nl;

        let line = &self.buffer[self.start..=nl];
        let line = unsafe { Self::into_static(line) };

        self.start = nl + 1;
        self.pos = self.start;
        Some(line)
    }

    // Shifts the unconsumed tail down to index 0, reclaiming space without
    // growing the buffer. Triggered once `start` crosses the 75% watermark.
    fn compact(&mut self) {
        self.buffer.copy_within(self.start..self.len, 0);
        self.len -= self.start;
        self.pos -= self.start;
        self.start = 0;
    }

    #[inline(always)]
    // SAFETY: the buffer is heap-allocated once and lives for the entire
    // worker thread; nothing else mutates it while a line is in flight.
    const unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        unsafe { mem::transmute(src) }
    }
}

#[cfg(test)]
mod reader_tests {
    use super::*;
    use crate::tools::str_op;

    #[test]
    fn scans_single_line() {
        let limits = ReqLimits::default().precalculate();
        let mut r = Reader::from_bytes(&limits, b"GET / HTTP/1.1\r\n");

        assert_eq!(str_op(r.scan_line().unwrap()), "GET / HTTP/1.1\r\n");
        assert_eq!(r.scan_line(), None);
    }

    #[test]
    fn scans_pipelined_lines_without_rescanning() {
        let limits = ReqLimits::default().precalculate();
        let mut r = Reader::from_bytes(&limits, b"one\ntwo\nthree\n");

        assert_eq!(str_op(r.scan_line().unwrap()), "one\n");
        assert_eq!(str_op(r.scan_line().unwrap()), "two\n");
        assert_eq!(str_op(r.scan_line().unwrap()), "three\n");
        assert_eq!(r.scan_line(), None);
    }

    #[test]
    fn no_line_until_delimiter_present() {
        let limits = ReqLimits::default().precalculate();
        let mut r = Reader::from_bytes(&limits, b"no newline here");
        assert_eq!(r.scan_line(), None);
    }

    #[test]
    fn compact_moves_tail_to_front() {
        let limits = ReqLimits::default().precalculate();
        let mut r = Reader::from_bytes(&limits, b"first\nsecond");

        assert_eq!(str_op(r.scan_line().unwrap()), "first\n");
        assert_eq!(r.start, 6);

        r.compact();

        assert_eq!(r.start, 0);
        assert_eq!(r.len, 6);
        assert_eq!(&r.buffer[..6], b"second");
    }

    #[test]
    fn reset_clears_cursors_and_buffer() {
        let limits = ReqLimits::default().precalculate();
        let mut r = Reader::from_bytes(&limits, b"abc\n");
        r.scan_line();

        r.reset();

        assert_eq!(r.len, 0);
        assert_eq!(r.pos, 0);
        assert_eq!(r.start, 0);
        assert!(r.buffer.iter().all(|&b| b == 0));
    }

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        use mio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        };

        (server, client.join().unwrap())
    }

    #[test]
    fn would_block_with_a_partial_line_is_pending_not_an_error() {
        use std::io::Write;

        let limits = ReqLimits::default().precalculate();
        let (mut server, mut client) = connected_pair();
        let mut r = Reader::new(&limits);

        client.write_all(b"GET / HTT").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        match r.read_line(&mut server) {
            Ok(LineStatus::Pending) => {}
            other => panic!("expected Pending on a not-yet-terminated line, got a different outcome: {}", other.is_ok()),
        }
        assert!(r.start < r.len, "the partial bytes already read must stay buffered");
    }

    #[test]
    fn a_real_eof_mid_line_is_unexpected_eof() {
        use std::io::Write;

        let limits = ReqLimits::default().precalculate();
        let (mut server, mut client) = connected_pair();
        let mut r = Reader::new(&limits);

        client.write_all(b"GET / HTT").unwrap();
        drop(client);

        loop {
            match r.read_line(&mut server) {
                Ok(LineStatus::Pending) => continue,
                Err(ErrorKind::UnexpectedEof) => break,
                other => panic!("expected UnexpectedEof once the peer's FIN lands, got: {}", other.is_ok()),
            }
        }
    }

    #[test]
    fn a_clean_close_with_nothing_buffered_is_eof() {
        let limits = ReqLimits::default().precalculate();
        let (mut server, client) = connected_pair();
        let mut r = Reader::new(&limits);

        drop(client);

        loop {
            match r.read_line(&mut server) {
                Ok(LineStatus::Pending) => continue,
                Ok(LineStatus::Eof) => break,
                other => panic!("expected a clean Eof, got: {}", other.is_ok()),
            }
        }
    }
}


#[cfg(test)]
mod header_line_tests {
    use super::*;
    use crate::tools::{str, str_op};

    fn line(s: &'static str) -> &'static [u8] {
        s.as_bytes()
    }

    #[test]
    fn parses_name_value() {
        let limits = ReqLimits::default().precalculate();

        #[rustfmt::skip]
        let cases = [
            ("Host: 127.0.0.1\r\n", "host", "127.0.0.1"),
            ("HOST: 127.0.0.1\n",   "host", "127.0.0.1"),
            ("X-Empty: \r\n",       "x-empty", ""),
        ];

        for (input, name, value) in cases {
            let header = parse_header_line(line(input), &limits).unwrap().unwrap();
            assert_eq!(str_op(header.name), name);
            assert_eq!(str_op(header.value), value);
        }
    }

    #[test]
    fn blank_line_ends_headers() {
        let limits = ReqLimits::default().precalculate();
        assert_eq!(parse_header_line(line("\r\n"), &limits), Ok(None));
        assert_eq!(parse_header_line(line("\n"), &limits), Ok(None));
    }

    #[test]
    fn rejects_malformed_headers() {
        let limits = ReqLimits::default().precalculate();

        #[rustfmt::skip]
        let cases = [
            "NoColon value\r\n",
            ": empty-name\r\n",
            "Header:value\r\n",
            "Header: value",
        ];

        for input in cases {
            assert_eq!(
                parse_header_line(line(input), &limits),
                Err(ErrorKind::InvalidHeader)
            );
        }
    }

    #[test]
    fn enforces_name_and_value_limits() {
        let limits = ReqLimits {
            header_name_size: 4,
            header_value_size: 4,
            ..ReqLimits::default()
        }
        .precalculate();

        assert!(parse_header_line(line("Name: abcd\r\n"), &limits).is_ok());
        assert_eq!(
            parse_header_line(line("Toolong: abcd\r\n"), &limits),
            Err(ErrorKind::InvalidHeader)
        );
        assert_eq!(
            parse_header_line(line("Name: abcde\r\n"), &limits),
            Err(ErrorKind::InvalidHeader)
        );
    }

    #[test]
    fn name_is_lowercased_in_place() {
        let limits = ReqLimits::default().precalculate();
        let header = parse_header_line(line("X-Custom-Header: v\r\n"), &limits)
            .unwrap()
            .unwrap();
        assert_eq!(str(Some(header.name)), Some("x-custom-header"));
    }
}

// Drives `Reader::scan_line` directly against a fully-buffered request,
// bypassing the socket — usable by any test in the crate that needs a
// populated `Request` without a live connection.
#[cfg(test)]
pub(crate) fn test_parse_buffered(
    limits: &ReqLimits,
    raw: &'static str,
) -> Result<Request, ErrorKind> {
    let mut reader = Reader::from_bytes(limits, raw);
    let mut request = Request::new(limits);

    let line = reader.scan_line().ok_or(ErrorKind::InvalidRequestLine)?;
    let (method, url, version) = parse_request_line(line, limits)?;
    request.method = method;
    request.url = url;
    request.version = version;

    loop {
        let line = reader.scan_line().ok_or(ErrorKind::UnexpectedEof)?;
        match parse_header_line(line, limits)? {
            Some(header) => request.headers.headers.push(header),
            None => break,
        }
    }

    Ok(request)
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::tools::str_op;

    fn parse_buffered(limits: &ReqLimits, raw: &'static str) -> Result<Request, ErrorKind> {
        test_parse_buffered(limits, raw)
    }

    #[test]
    fn parses_full_request() {
        let limits = ReqLimits::default().precalculate();
        let request = parse_buffered(
            &limits,
            "PUT /qwe HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: curl\r\n\r\n",
        )
        .unwrap();

        assert_eq!(request.method(), Method::Put);
        assert_eq!(str_op(request.url().target()), "/qwe");
        assert_eq!(request.version(), Version::Http11);
        assert_eq!(
            request.header(b"host").map(str_op),
            Some("127.0.0.1")
        );
        assert_eq!(
            request.header(b"user-agent").map(str_op),
            Some("curl")
        );
        assert_eq!(request.header(b"missing"), None);
    }

    #[test]
    fn reset_restores_defaults() {
        let limits = ReqLimits::default().precalculate();
        let mut request =
            parse_buffered(&limits, "GET /a?b=1 HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

        request.reset();

        assert_eq!(request, Request::new(&limits));
    }

    #[test]
    fn parse_query_returns_query_params() {
        let limits = ReqLimits::default().precalculate();
        let request = parse_buffered(&limits, "GET /a?x=1&y=2 HTTP/1.1\r\n\r\n").unwrap();

        let params: Vec<(&[u8], &[u8])> = request.parse_query(8).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], (b"x" as &[u8], b"1" as &[u8]));
        assert_eq!(params[1], (b"y" as &[u8], b"2" as &[u8]));
    }

    #[test]
    fn parse_query_empty_when_no_query_string() {
        let limits = ReqLimits::default().precalculate();
        let request = parse_buffered(&limits, "GET /a HTTP/1.1\r\n\r\n").unwrap();

        let params: Vec<(&[u8], &[u8])> = request.parse_query(8).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn too_many_headers_is_rejected_by_read_request_layer() {
        // `parse_buffered` exercises only the pure parsers above; the
        // header-count limit is enforced one layer up in `read_request`,
        // which requires a live stream and is covered by integration tests.
        let limits = ReqLimits {
            header_count: 1,
            ..ReqLimits::default()
        }
        .precalculate();

        let request = parse_buffered(&limits, "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n").unwrap();
        assert_eq!(request.headers.headers.len(), 2);
    }
}
