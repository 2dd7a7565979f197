//! Incremental HTTP/1.x request extraction.
//!
//! Bytes are pushed in as the reassembler delivers them; the parser never
//! waits on a reader. Request bodies are counted, never buffered, so memory
//! stays bounded by the longest header line regardless of body size.
//!
//! Recovery from malformed input is best-effort: the broken request is
//! dropped and parsing restarts at the next line terminator. A direction that
//! keeps producing garbage is abandoned.

use core::mem;
use core::net::SocketAddr;
use core::str;
use memchr::memchr;
use std::time::SystemTime;
use tracing::{debug, trace};

use super::event::{BodySize, RequestEvent};
use crate::packet::Direction;

const MAX_LINE_SIZE: usize = 16 * 1024;
const MAX_HEADER_BLOCK_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_MALFORMED_LINES: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitRequestLine,
    AwaitHeaders,
    ReadingBody { remaining: u64 },
    /// Discard up to the next line terminator. `unframed` returns to
    /// `SkipUnframed` afterwards instead of `AwaitRequestLine`.
    SkipLine { unframed: bool },
    /// Skip a body we cannot frame until something parses as a request line.
    SkipUnframed,
    Abandoned,
    Finished,
}

enum Framing {
    Length(u64),
    Chunked,
}

#[derive(Debug)]
struct PartialRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body_bytes: u64,
}

impl PartialRequest {
    fn header(&self, name: &str) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body framing from `Transfer-Encoding` and `Content-Length`.
    /// Conflicting or unparsable lengths make the request invalid.
    fn framing(&self) -> Option<Framing> {
        let chunked = self
            .header("transfer-encoding")
            .flat_map(|v| v.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Some(Framing::Chunked);
        }

        let mut length = None;
        for value in self.header("content-length") {
            let parsed = value.trim().parse::<u64>().ok()?;
            if length.is_some_and(|l| l != parsed) {
                return None;
            }
            length = Some(parsed);
        }
        Some(Framing::Length(length.unwrap_or(0)))
    }
}

/// Extracts HTTP requests from the client-to-server byte stream of one
/// connection. Server-to-client bytes are consumed and discarded.
#[derive(Debug)]
pub struct HttpRequestExtractor {
    client: SocketAddr,
    server: SocketAddr,
    state: ParseState,
    line: Vec<u8>,
    request: Option<PartialRequest>,
    header_bytes: usize,
    malformed_streak: u32,
    requests: u64,
    discarded: u64,
}

impl HttpRequestExtractor {
    pub fn new(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            client,
            server,
            state: ParseState::AwaitRequestLine,
            line: Vec::new(),
            request: None,
            header_bytes: 0,
            malformed_streak: 0,
            requests: 0,
            discarded: 0,
        }
    }

    /// Feed newly delivered bytes of one direction. Completed requests are
    /// pushed onto `events`, stamped with `timestamp`.
    pub fn on_bytes(
        &mut self,
        direction: Direction,
        bytes: &[u8],
        timestamp: SystemTime,
        events: &mut Vec<RequestEvent>,
    ) {
        if direction == Direction::ServerToClient {
            self.discarded += bytes.len() as u64;
            return;
        }

        let mut input = bytes;
        while !input.is_empty() {
            match self.state {
                ParseState::Abandoned | ParseState::Finished => return,
                ParseState::ReadingBody { remaining } => {
                    let take = remaining.min(input.len() as u64);
                    input = &input[usize::try_from(take).unwrap_or(input.len())..];
                    if let Some(request) = self.request.as_mut() {
                        request.body_bytes += take;
                    }
                    if remaining == take {
                        self.complete(BodySize::Known(self.body_bytes()), timestamp, events);
                    } else {
                        self.state = ParseState::ReadingBody {
                            remaining: remaining - take,
                        };
                    }
                }
                _ => {
                    let Some(pos) = memchr(b'\n', input) else {
                        self.buffer_partial_line(input);
                        return;
                    };
                    let (part, rest) = input.split_at(pos + 1);
                    input = rest;
                    self.on_line_end(&part[..pos], timestamp, events);
                }
            }
        }
    }

    /// No more bytes will arrive for `direction`. An unfinished request is
    /// discarded.
    pub fn on_end_of_stream(&mut self, direction: Direction) {
        if direction == Direction::ServerToClient {
            return;
        }

        if let Some(request) = self.request.take() {
            debug!(
                client = %self.client,
                server = %self.server,
                method = %request.method,
                target = %request.target,
                "discarding incomplete request at end of stream"
            );
        }
        self.line.clear();
        self.state = ParseState::Finished;
    }

    /// Requests emitted so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Server-to-client bytes consumed without parsing.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    pub fn is_abandoned(&self) -> bool {
        self.state == ParseState::Abandoned
    }

    fn body_bytes(&self) -> u64 {
        self.request.as_ref().map_or(0, |r| r.body_bytes)
    }

    fn buffer_partial_line(&mut self, part: &[u8]) {
        match self.state {
            ParseState::SkipLine { .. } => {}
            ParseState::SkipUnframed if self.line.len() + part.len() > MAX_LINE_SIZE => {
                self.line.clear();
                self.state = ParseState::SkipLine { unframed: true };
            }
            _ if self.line.len() + part.len() > MAX_LINE_SIZE => {
                trace!(client = %self.client, "line too long");
                self.malformed();
                if self.state != ParseState::Abandoned {
                    self.state = ParseState::SkipLine { unframed: false };
                }
            }
            _ => self.line.extend_from_slice(part),
        }
    }

    fn on_line_end(&mut self, part: &[u8], timestamp: SystemTime, events: &mut Vec<RequestEvent>) {
        if let ParseState::SkipLine { unframed } = self.state {
            self.line.clear();
            self.state = if unframed {
                ParseState::SkipUnframed
            } else {
                ParseState::AwaitRequestLine
            };
            return;
        }

        let mut line = mem::take(&mut self.line);
        if line.len() + part.len() > MAX_LINE_SIZE {
            if self.state != ParseState::SkipUnframed {
                trace!(client = %self.client, "line too long");
                self.malformed();
            }
            return;
        }
        line.extend_from_slice(part);
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        match self.state {
            ParseState::SkipUnframed => {
                if let Some(request) = parse_request_line(&line) {
                    self.start_request(request, line.len());
                }
            }
            ParseState::AwaitRequestLine => {
                if line.is_empty() {
                    return;
                }
                match parse_request_line(&line) {
                    Some(request) => self.start_request(request, line.len()),
                    None => {
                        trace!(client = %self.client, "malformed request line");
                        self.malformed();
                    }
                }
            }
            ParseState::AwaitHeaders => self.on_header_line(&line, timestamp, events),
            _ => {}
        }
        // Hand the allocation back for the next partial line
        line.clear();
        self.line = line;
    }

    fn start_request(&mut self, request: PartialRequest, line_len: usize) {
        self.request = Some(request);
        self.header_bytes = line_len;
        self.malformed_streak = 0;
        self.state = ParseState::AwaitHeaders;
    }

    fn on_header_line(
        &mut self,
        line: &[u8],
        timestamp: SystemTime,
        events: &mut Vec<RequestEvent>,
    ) {
        self.header_bytes += line.len();
        if self.header_bytes > MAX_HEADER_BLOCK_SIZE {
            trace!(client = %self.client, "header block too large");
            self.malformed();
            return;
        }

        if line.is_empty() {
            self.headers_complete(timestamp, events);
            return;
        }

        let Some(request) = self.request.as_mut() else {
            self.malformed();
            return;
        };
        let Ok(line) = str::from_utf8(line) else {
            self.malformed();
            return;
        };

        // Obsolete line folding continues the previous header value
        if line.starts_with([' ', '\t']) {
            match request.headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => self.malformed(),
            }
            return;
        }

        let Some((name, value)) = line.split_once(':') else {
            self.malformed();
            return;
        };
        if name.is_empty() || !name.bytes().all(is_tchar) || request.headers.len() >= MAX_HEADERS {
            self.malformed();
            return;
        }
        request
            .headers
            .push((name.to_owned(), value.trim().to_owned()));
    }

    fn headers_complete(&mut self, timestamp: SystemTime, events: &mut Vec<RequestEvent>) {
        let framing = self.request.as_ref().and_then(PartialRequest::framing);
        match framing {
            None => {
                trace!(client = %self.client, "invalid body framing");
                self.malformed();
            }
            Some(Framing::Chunked) => {
                self.complete(BodySize::Unknown, timestamp, events);
                self.state = ParseState::SkipUnframed;
            }
            Some(Framing::Length(0)) => self.complete(BodySize::Known(0), timestamp, events),
            Some(Framing::Length(remaining)) => {
                self.state = ParseState::ReadingBody { remaining };
            }
        }
    }

    fn complete(
        &mut self,
        body_size: BodySize,
        timestamp: SystemTime,
        events: &mut Vec<RequestEvent>,
    ) {
        self.state = ParseState::AwaitRequestLine;
        let Some(request) = self.request.take() else {
            return;
        };

        let host = request.header("host").next().map(ToOwned::to_owned);
        self.requests += 1;
        events.push(RequestEvent {
            source: self.client,
            destination: self.server,
            method: request.method,
            target: request.target,
            host,
            body_size,
            timestamp,
        });
    }

    /// Drop the request in progress and resume at the next line.
    fn malformed(&mut self) {
        self.request = None;
        self.line.clear();
        self.header_bytes = 0;
        self.malformed_streak += 1;
        if self.malformed_streak >= MAX_MALFORMED_LINES {
            debug!(
                client = %self.client,
                server = %self.server,
                "too many malformed lines, abandoning request parsing"
            );
            self.state = ParseState::Abandoned;
        } else {
            self.state = ParseState::AwaitRequestLine;
        }
    }
}

/// Parse `METHOD SP TARGET SP HTTP/1.x`.
fn parse_request_line(line: &[u8]) -> Option<PartialRequest> {
    let line = str::from_utf8(line).ok()?;
    let mut parts = line.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if method.is_empty() || !method.bytes().all(is_tchar) {
        return None;
    }
    if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
        return None;
    }
    if !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return None;
    }

    Some(PartialRequest {
        method: method.to_owned(),
        target: target.to_owned(),
        headers: Vec::new(),
        body_bytes: 0,
    })
}

/// RFC 9110 token characters.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const C2S: Direction = Direction::ClientToServer;
    const S2C: Direction = Direction::ServerToClient;

    fn extractor() -> HttpRequestExtractor {
        HttpRequestExtractor::new(
            "192.168.1.100:51234".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
        )
    }

    fn feed_all(extractor: &mut HttpRequestExtractor, chunks: &[&[u8]]) -> Vec<RequestEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            extractor.on_bytes(C2S, chunk, SystemTime::UNIX_EPOCH, &mut events);
        }
        events
    }

    #[test]
    fn test_simple_get() {
        let mut extractor = extractor();
        let events = feed_all(&mut extractor, &[b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n"]);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.method, "GET");
        assert_eq!(event.target, "/foo");
        assert_eq!(event.host.as_deref(), Some("x"));
        assert_eq!(event.body_size, BodySize::Known(0));
        assert_eq!(event.source, "192.168.1.100:51234".parse().unwrap());
        assert_eq!(event.destination, "10.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn test_request_split_at_every_offset() {
        let request: &[u8] = b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n";
        for split in 1..request.len() {
            let mut extractor = extractor();
            let (head, tail) = request.split_at(split);

            let events = feed_all(&mut extractor, &[head, tail]);

            assert_eq!(events.len(), 1, "split at {split}");
            assert_eq!(events[0].method, "GET");
            assert_eq!(events[0].target, "/foo");
            assert_eq!(events[0].body_size, BodySize::Known(0));
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let request = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut extractor = extractor();
        let chunks: Vec<&[u8]> = request.chunks(1).collect();

        let events = feed_all(&mut extractor, &chunks);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].body_size, BodySize::Known(5));
    }

    #[test]
    fn test_pipelined_requests_in_order() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n"],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].target, "/a");
        assert_eq!(events[0].body_size, BodySize::Known(3));
        assert_eq!(events[1].target, "/b");
        assert_eq!(events[1].body_size, BodySize::Known(0));
        assert_eq!(extractor.requests(), 2);
    }

    #[test]
    fn test_body_is_counted_across_chunks() {
        let mut extractor = extractor();
        let body = vec![b'x'; 100_000];

        let mut events = feed_all(
            &mut extractor,
            &[b"PUT /blob HTTP/1.1\r\nContent-Length: 100000\r\n\r\n"],
        );
        assert!(events.is_empty());
        for chunk in body.chunks(1460) {
            extractor.on_bytes(C2S, chunk, SystemTime::UNIX_EPOCH, &mut events);
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body_size, BodySize::Known(100_000));
    }

    #[test]
    fn test_incomplete_body_is_discarded_at_end_of_stream() {
        let mut extractor = extractor();
        let mut events = feed_all(
            &mut extractor,
            &[b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"],
        );
        extractor.on_end_of_stream(C2S);
        extractor.on_bytes(C2S, b"defghij", SystemTime::UNIX_EPOCH, &mut events);

        assert!(events.is_empty());
        assert_eq!(extractor.requests(), 0);
    }

    #[test]
    fn test_chunked_body_reports_unknown_size() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[
                b"POST /c HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
                b"5\r\nhello\r\n0\r\n\r\n",
                b"GET /next HTTP/1.1\r\n\r\n",
            ],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].target, "/c");
        assert_eq!(events[0].body_size, BodySize::Unknown);
        assert_eq!(events[1].target, "/next");
        assert!(!extractor.is_abandoned());
    }

    #[test]
    fn test_resynchronizes_after_garbage() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[b"\x16\x03\x01garbage\r\nnot a request\r\nGET /ok HTTP/1.0\r\n\r\n"],
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, "/ok");
    }

    #[test]
    fn test_leading_empty_lines_are_skipped() {
        let mut extractor = extractor();
        let events = feed_all(&mut extractor, &[b"\r\n\r\nGET / HTTP/1.1\r\n\r\n"]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_folded_header_value() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[b"GET /path HTTP/1.1\r\nHost: replay404\r\n .valve.net\r\n\r\n"],
        );

        assert_eq!(events[0].host.as_deref(), Some("replay404 .valve.net"));
    }

    #[rstest]
    #[case(b"POST /x HTTP/1.1\r\nContent-Length: ten\r\n\r\n")]
    #[case(b"POST /x HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n")]
    #[case(b"GET /x HTTP/1.1\r\nno colon here\r\n\r\n")]
    #[case(b"GET /x HTTP/1.1\r\n folded first\r\n\r\n")]
    #[case(b"GET /x HTTP/2.0\r\n\r\n")]
    #[case(b"GET  /x HTTP/1.1\r\n\r\n")]
    fn test_malformed_requests_are_not_emitted(#[case] request: &[u8]) {
        let mut extractor = extractor();
        let events = feed_all(&mut extractor, &[request]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_repeated_content_length_with_same_value() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[b"POST /x HTTP/1.1\r\nContent-Length: 2\r\ncontent-length: 2\r\n\r\nok"],
        );
        assert_eq!(events[0].body_size, BodySize::Known(2));
    }

    #[test]
    fn test_overlong_line_is_skipped() {
        let mut extractor = extractor();
        let long = vec![b'a'; MAX_LINE_SIZE + 10];

        let events = feed_all(
            &mut extractor,
            &[&long, b"tail of the long line\r\n", b"GET /after HTTP/1.1\r\n\r\n"],
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, "/after");
    }

    #[test]
    fn test_abandons_after_repeated_garbage() {
        let mut extractor = extractor();
        let garbage = b"\x00\x01\x02 binary noise\n".repeat(200);

        let events = feed_all(&mut extractor, &[&garbage, b"GET / HTTP/1.1\r\n\r\n"]);

        assert!(extractor.is_abandoned());
        assert!(events.is_empty());
    }

    #[test]
    fn test_server_to_client_bytes_are_discarded() {
        let mut extractor = extractor();
        let mut events = Vec::new();

        extractor.on_bytes(
            S2C,
            b"GET /looks-like-a-request HTTP/1.1\r\n\r\n",
            SystemTime::UNIX_EPOCH,
            &mut events,
        );
        extractor.on_end_of_stream(S2C);

        assert!(events.is_empty());
        assert_eq!(extractor.discarded_bytes(), 38);

        // The request direction is unaffected
        extractor.on_bytes(C2S, b"GET / HTTP/1.1\r\n\r\n", SystemTime::UNIX_EPOCH, &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_absolute_form_target() {
        let mut extractor = extractor();
        let events = feed_all(
            &mut extractor,
            &[b"GET http://example.com/a?b=c HTTP/1.1\r\nHost: example.com\r\n\r\n"],
        );
        assert_eq!(events[0].target, "http://example.com/a?b=c");
    }
}
