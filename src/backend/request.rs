//! In-flight requests.
//!
//! A [`Request`] is created from a header frame and lives until two
//! completion votes have been cast: one when the caller is done with the
//! last frame delivered for it, one when a response has been sent. An abort
//! cancels the response vote if no response was claimed yet. When the count
//! reaches zero the body is released (crediting the buffer budget) and the
//! request leaves its session's stream table.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::warn;

use super::buffer::{Buffer, BufferBudget, BufferError, Charge};
use super::header_cache::HeaderCacheRecv;
use super::session::{lock, Session};
use crate::error::{usage_error, DecodeError};
use crate::protocol::{HeaderLine, HttpVersion, StreamKey};

const CONTENT_LENGTH: &[u8] = b"Content-Length";

#[derive(Debug, Clone, Copy)]
struct Line {
    start: usize,
    key_len: usize,
    value_len: usize,
}

/// All header lines of a request packed into one immutable block.
///
/// Line 0 is the request line: method as the key, URI as the value.
#[derive(Debug)]
pub(crate) struct HeaderBlock {
    block: Box<[u8]>,
    lines: Vec<Line>,
}

impl HeaderBlock {
    /// Resolve dictionary references and pack the lines of a header frame.
    ///
    /// A line with a non-zero id and a non-empty key is stored in the
    /// dictionary first; every line with a non-zero id is then read back
    /// from it.
    pub(crate) fn build(
        lines: &[HeaderLine<'_>],
        cache: &mut HeaderCacheRecv,
    ) -> Result<Self, DecodeError> {
        if lines.is_empty() {
            return Err(DecodeError::MissingRequestLine);
        }

        let mut block = Vec::new();
        let mut packed = Vec::with_capacity(lines.len());
        for line in lines {
            let (key, value) = if line.id == 0 {
                (line.key, line.value)
            } else {
                if !line.key.is_empty() {
                    cache.insert(line.id, line.key, line.value);
                }
                cache.get(line.id)
            };
            packed.push(Line {
                start: block.len(),
                key_len: key.len(),
                value_len: value.len(),
            });
            block.extend_from_slice(key);
            block.extend_from_slice(value);
        }

        Ok(Self {
            block: block.into_boxed_slice(),
            lines: packed,
        })
    }

    fn line(&self, idx: usize) -> Option<(&[u8], &[u8])> {
        let line = self.lines.get(idx)?;
        let value_start = line.start + line.key_len;
        Some((
            &self.block[line.start..value_start],
            &self.block[value_start..value_start + line.value_len],
        ))
    }

    fn len(&self) -> usize {
        self.lines.len()
    }
}

/// Outcome of claiming the right to send a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Granted,
    /// The request was aborted; nobody is listening.
    Aborted,
    AlreadySent,
}

/// What became of body bytes handed to a request.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    /// Streaming: pass the bytes on at `offset`.
    Streamed { offset: u64, last: bool },
    /// Buffered; more to come.
    Pending,
    /// Buffered and now complete.
    Complete(Bytes),
    /// The body was already finished or abandoned.
    Ignored,
    /// More bytes than the declared body length.
    Overflow,
    /// The body buffer could not grow.
    OutOfMemory(BufferError),
}

#[derive(Debug)]
enum Body {
    Streaming,
    Buffering(Buffer),
    Complete { bytes: Bytes, _charge: Option<Charge> },
    Released,
}

#[derive(Debug)]
struct Liveness {
    remaining: u8,
    delivery_cast: bool,
    response_claimed: bool,
    response_cancelled: bool,
    /// Connection torn down; outstanding votes no longer count.
    drained: bool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            remaining: 2,
            delivery_cast: false,
            response_claimed: false,
            response_cancelled: false,
            drained: false,
        }
    }
}

#[derive(Debug)]
struct RequestState {
    liveness: Liveness,
    received: u64,
    finished: bool,
    aborted: bool,
    /// The caller has seen the header frame of this streamed request.
    announced: bool,
    buffering_requested: bool,
    body: Body,
}

impl RequestState {
    /// Cast one completion vote. Returns `true` when it was the last one.
    fn vote(&mut self) -> bool {
        if self.liveness.drained {
            return false;
        }
        if self.liveness.remaining == 0 {
            usage_error("request released more times than it was owned");
        }
        self.liveness.remaining -= 1;
        if self.liveness.remaining == 0 {
            self.body = Body::Released;
            true
        } else {
            false
        }
    }
}

/// One request received from the front-end.
pub struct Request {
    key: StreamKey,
    version: HttpVersion,
    headers: HeaderBlock,
    body_length: u64,
    session: Weak<Session>,
    state: Mutex<RequestState>,
}

impl Request {
    /// A request whose header frame carried `received` body bytes.
    pub(crate) fn new(
        key: StreamKey,
        version: HttpVersion,
        headers: HeaderBlock,
        session: Weak<Session>,
        received: u64,
    ) -> Self {
        let body_length = content_length(&headers, key);
        Self {
            key,
            version,
            headers,
            body_length,
            session,
            state: Mutex::new(RequestState {
                liveness: Liveness::new(),
                received,
                finished: false,
                aborted: false,
                announced: false,
                buffering_requested: false,
                body: Body::Streaming,
            }),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn channel(&self) -> u64 {
        self.key.channel
    }

    pub fn stream(&self) -> u64 {
        self.key.stream
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn method(&self) -> &[u8] {
        self.headers.line(0).map_or(&[][..], |(method, _)| method)
    }

    pub fn uri(&self) -> &[u8] {
        self.headers.line(0).map_or(&[][..], |(_, uri)| uri)
    }

    /// Body length announced by `Content-Length`, 0 if absent.
    pub fn body_length(&self) -> u64 {
        self.body_length
    }

    /// Value of the first header named exactly `name`.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.header_nth(name, 0)
    }

    /// Value of the `n`th header named exactly `name`, counting from 0.
    pub fn header_nth(&self, name: &[u8], n: usize) -> Option<&[u8]> {
        self.headers()
            .filter(|(key, _)| *key == name)
            .nth(n)
            .map(|(_, value)| value)
    }

    /// Like [`header`](Self::header), but ignoring ASCII case. HTTP/2
    /// front-ends pass header names in lower case.
    pub fn header_ignore_case(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Header at `idx`, not counting the request line.
    pub fn header_at(&self, idx: usize) -> Option<(&[u8], &[u8])> {
        self.headers.line(idx.checked_add(1)?)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len().saturating_sub(1)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.header_count()).filter_map(move |i| self.header_at(i))
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.state).aborted
    }

    /// The whole body, once it has been received in one piece.
    pub fn body(&self) -> Option<Bytes> {
        match &lock(&self.state).body {
            Body::Complete { bytes, .. } => Some(bytes.clone()),
            _ => None,
        }
    }

    /// The whole body arrived in the header frame.
    pub(crate) fn complete_inline(&self, bytes: Bytes) {
        let mut state = lock(&self.state);
        state.received = bytes.len() as u64;
        state.finished = true;
        state.body = Body::Complete {
            bytes,
            _charge: None,
        };
    }

    /// The header frame went to the caller un-buffered; `complete` when
    /// it carried the whole body.
    pub(crate) fn announce(&self, complete: bool) {
        let mut state = lock(&self.state);
        state.announced = true;
        state.finished = complete;
    }

    pub(crate) fn is_announced(&self) -> bool {
        lock(&self.state).announced
    }

    /// Switch to accumulating the body, seeded with `already`.
    ///
    /// The whole body length is charged to `budget` here, so a request that
    /// is admitted never runs out of budget while its body arrives. Returns
    /// the complete body if `already` is all of it.
    pub(crate) fn start_buffering(
        &self,
        already: &[u8],
        budget: &Arc<BufferBudget>,
        initial_size: usize,
    ) -> Result<Option<Bytes>, BufferError> {
        let mut state = lock(&self.state);
        if state.buffering_requested {
            drop(state);
            usage_error("body buffering requested twice for the same request");
        }
        state.buffering_requested = true;

        let max = usize::try_from(self.body_length).map_err(|_| BufferError::CapacityExceeded)?;
        let initial = max.min(initial_size).max(already.len());

        let mut buffer = Buffer::charged(budget, max, initial)?;
        buffer.try_extend(already, max)?;

        if state.received >= self.body_length {
            let (bytes, charge) = buffer.freeze();
            state.finished = true;
            state.body = Body::Complete {
                bytes: bytes.clone(),
                _charge: charge,
            };
            return Ok(Some(bytes));
        }

        state.body = Body::Buffering(buffer);
        Ok(None)
    }

    /// Account for body bytes from a body frame.
    pub(crate) fn accept_body(&self, data: &[u8], is_final: bool) -> BodyEvent {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.finished {
            return BodyEvent::Ignored;
        }
        let offset = state.received;
        let received = offset + data.len() as u64;
        if received > self.body_length {
            return BodyEvent::Overflow;
        }
        let done = is_final || received == self.body_length;

        match &mut state.body {
            Body::Streaming => {
                state.received = received;
                state.finished = done;
                return BodyEvent::Streamed { offset, last: done };
            }
            Body::Buffering(buffer) => {
                // body_length fits usize: start_buffering checked it
                if let Err(e) = buffer.try_extend(data, self.body_length as usize) {
                    return BodyEvent::OutOfMemory(e);
                }
            }
            Body::Complete { .. } | Body::Released => return BodyEvent::Ignored,
        }

        state.received = received;
        if !done {
            return BodyEvent::Pending;
        }
        let Body::Buffering(buffer) = std::mem::replace(&mut state.body, Body::Released) else {
            return BodyEvent::Ignored;
        };
        let (bytes, charge) = buffer.freeze();
        state.finished = true;
        state.body = Body::Complete {
            bytes: bytes.clone(),
            _charge: charge,
        };
        BodyEvent::Complete(bytes)
    }

    /// Stop accepting body bytes and free any buffered ones. The request
    /// then looks aborted to the caller.
    pub(crate) fn abandon(&self) {
        let mut state = lock(&self.state);
        state.finished = true;
        state.aborted = true;
        state.body = Body::Released;
    }

    /// Take the right to send the one response this request gets.
    pub(crate) fn claim_response(&self) -> Claim {
        let mut state = lock(&self.state);
        let liveness = &mut state.liveness;
        if liveness.response_cancelled {
            Claim::Aborted
        } else if liveness.response_claimed {
            Claim::AlreadySent
        } else {
            liveness.response_claimed = true;
            Claim::Granted
        }
    }

    /// Claim the response for an error the backend answers itself. A
    /// response the caller sends later is then discarded.
    pub(crate) fn claim_rejection(&self) -> bool {
        let mut state = lock(&self.state);
        let liveness = &mut state.liveness;
        if liveness.response_claimed {
            return false;
        }
        liveness.response_claimed = true;
        liveness.response_cancelled = true;
        true
    }

    /// Cast the response vote, after a claimed response went out.
    pub(crate) fn finish_response(self: &Arc<Self>) {
        let dead = lock(&self.state).vote();
        if dead {
            self.retire();
        }
    }

    /// Cast the delivery vote.
    pub(crate) fn release_delivery(self: &Arc<Self>) {
        let dead = {
            let mut state = lock(&self.state);
            if state.liveness.delivery_cast {
                drop(state);
                usage_error("request delivery released twice");
            }
            state.liveness.delivery_cast = true;
            state.vote()
        };
        if dead {
            self.retire();
        }
    }

    pub(crate) fn delivery_pending(&self) -> bool {
        !lock(&self.state).liveness.delivery_cast
    }

    /// Cast the delivery vote unless it has been cast already.
    pub(crate) fn release_delivery_if_pending(self: &Arc<Self>) {
        if self.delivery_pending() {
            self.release_delivery();
        }
    }

    /// The client went away. Cancels the response vote if nobody claimed
    /// it, and returns whether the delivery vote is still outstanding.
    pub(crate) fn abort(self: &Arc<Self>) -> bool {
        let (dead, delivery_pending) = {
            let mut state = lock(&self.state);
            state.aborted = true;
            state.finished = true;
            if !matches!(state.body, Body::Complete { .. }) {
                state.body = Body::Released;
            }
            let mut dead = false;
            if !state.liveness.response_claimed {
                state.liveness.response_claimed = true;
                state.liveness.response_cancelled = true;
                dead = state.vote();
            }
            (dead, !state.liveness.delivery_cast)
        };
        if dead {
            self.retire();
        }
        delivery_pending
    }

    /// Connection teardown: release everything regardless of votes.
    pub(crate) fn drain(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            state.aborted = true;
            state.finished = true;
            state.body = Body::Released;
            state.liveness.remaining = 0;
            state.liveness.drained = true;
            if !state.liveness.response_claimed {
                state.liveness.response_claimed = true;
                state.liveness.response_cancelled = true;
            }
        }
        self.retire();
    }

    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    fn retire(self: &Arc<Self>) {
        if let Some(session) = self.session.upgrade() {
            session.unregister(self);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("method", &String::from_utf8_lossy(self.method()))
            .field("uri", &String::from_utf8_lossy(self.uri()))
            .field("body_length", &self.body_length)
            .finish_non_exhaustive()
    }
}

fn content_length(headers: &HeaderBlock, key: StreamKey) -> u64 {
    let Some((_, value)) = (1..headers.len())
        .filter_map(|i| headers.line(i))
        .find(|(k, _)| k.eq_ignore_ascii_case(CONTENT_LENGTH))
    else {
        return 0;
    };
    match std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        Some(len) => len,
        None => {
            warn!(
                stream = %key,
                value = %String::from_utf8_lossy(value),
                "Invalid Content-Length, assuming empty body"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(lines: &[HeaderLine<'_>]) -> Arc<Request> {
        let mut cache = HeaderCacheRecv::new();
        let headers = HeaderBlock::build(lines, &mut cache).unwrap();
        Arc::new(Request::new(
            StreamKey::new(1, 1),
            HttpVersion::Http11,
            headers,
            Weak::new(),
            0,
        ))
    }

    fn post(len: &'static [u8]) -> Arc<Request> {
        request(&[
            HeaderLine::literal(b"POST", b"/upload"),
            HeaderLine::literal(b"Content-Length", len),
        ])
    }

    #[test]
    fn test_header_access() {
        let req = request(&[
            HeaderLine::literal(b"GET", b"/a?b=c"),
            HeaderLine::literal(b"Accept", b"text/html"),
            HeaderLine::literal(b"X-Tag", b"one"),
            HeaderLine::literal(b"x-tag", b"two"),
        ]);

        assert_eq!(req.method(), b"GET");
        assert_eq!(req.uri(), b"/a?b=c");
        assert_eq!(req.header_count(), 3);
        assert_eq!(req.header(b"Accept"), Some(&b"text/html"[..]));
        assert_eq!(req.header(b"accept"), None);
        assert_eq!(req.header_ignore_case(b"accept"), Some(&b"text/html"[..]));
        assert_eq!(req.header_nth(b"X-Tag", 0), Some(&b"one"[..]));
        assert_eq!(req.header_nth(b"X-Tag", 1), None);
        assert_eq!(req.header_nth(b"x-tag", 0), Some(&b"two"[..]));
        assert_eq!(req.header_at(0), Some((&b"Accept"[..], &b"text/html"[..])));
        assert_eq!(req.header_at(3), None);
        assert_eq!(req.headers().count(), 3);
        // the request line is not a header
        assert_eq!(req.header(b"GET"), None);
        assert_eq!(req.body_length(), 0);
    }

    #[test]
    fn test_missing_request_line() {
        let mut cache = HeaderCacheRecv::new();
        assert_eq!(
            HeaderBlock::build(&[], &mut cache).unwrap_err(),
            DecodeError::MissingRequestLine
        );
    }

    #[test]
    fn test_dictionary_lines() {
        let mut cache = HeaderCacheRecv::new();
        let first = [
            HeaderLine::literal(b"GET", b"/"),
            HeaderLine {
                id: 4,
                key: b"User-Agent",
                value: b"bench/1",
            },
        ];
        HeaderBlock::build(&first, &mut cache).unwrap();

        // second request refers to id 4 only, plus an id that was never sent
        let second = [
            HeaderLine::literal(b"GET", b"/next"),
            HeaderLine {
                id: 4,
                key: b"",
                value: b"",
            },
            HeaderLine {
                id: 9,
                key: b"",
                value: b"",
            },
        ];
        let block = HeaderBlock::build(&second, &mut cache).unwrap();
        assert_eq!(block.line(1), Some((&b"User-Agent"[..], &b"bench/1"[..])));
        assert_eq!(block.line(2), Some((&b""[..], &b""[..])));
    }

    #[test]
    fn test_content_length() {
        assert_eq!(post(b"5000").body_length(), 5000);
        assert_eq!(post(b" 12 ").body_length(), 12);
        assert_eq!(post(b"-1").body_length(), 0);
        assert_eq!(post(b"lots").body_length(), 0);

        // HTTP/2 front-ends send lower-case names
        let req = request(&[
            HeaderLine::literal(b"POST", b"/"),
            HeaderLine::literal(b"content-length", b"7"),
        ]);
        assert_eq!(req.body_length(), 7);
    }

    #[test]
    fn test_streaming_body() {
        let req = post(b"10");
        match req.accept_body(b"12345", false) {
            BodyEvent::Streamed { offset: 0, last: false } => {}
            other => panic!("unexpected {other:?}"),
        }
        match req.accept_body(b"67890", false) {
            BodyEvent::Streamed { offset: 5, last: true } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(req.accept_body(b"x", false), BodyEvent::Ignored));
    }

    #[test]
    fn test_overflow() {
        let req = post(b"4");
        assert!(matches!(req.accept_body(b"12345", false), BodyEvent::Overflow));
        // the rejected bytes were not counted
        assert!(matches!(
            req.accept_body(b"1234", false),
            BodyEvent::Streamed { offset: 0, last: true }
        ));
    }

    #[test]
    fn test_buffering_reassembles() {
        let budget = Arc::new(BufferBudget::new(1 << 20));
        let req = post(b"9");
        assert!(req.start_buffering(b"", &budget, 4).unwrap().is_none());
        // the whole body is committed up front
        assert_eq!(budget.used(), 9);

        assert!(matches!(req.accept_body(b"abc", false), BodyEvent::Pending));
        assert!(matches!(req.accept_body(b"def", false), BodyEvent::Pending));
        match req.accept_body(b"ghi", false) {
            BodyEvent::Complete(bytes) => assert_eq!(&bytes[..], b"abcdefghi"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(req.body().as_deref(), Some(&b"abcdefghi"[..]));
        assert_eq!(budget.used(), 9);
    }

    #[test]
    fn test_buffering_over_budget() {
        let budget = Arc::new(BufferBudget::new(100));
        let req = post(b"101");
        assert_eq!(
            req.start_buffering(b"", &budget, 64).unwrap_err(),
            BufferError::BudgetExhausted
        );
        assert_eq!(budget.used(), 0);
    }

    #[test]
    #[should_panic(expected = "requested twice")]
    fn test_buffering_twice_panics() {
        let budget = Arc::new(BufferBudget::new(1 << 20));
        let req = post(b"100");
        let _ = req.start_buffering(b"", &budget, 64);
        let _ = req.start_buffering(b"", &budget, 64);
    }

    #[test]
    fn test_votes_release_body() {
        let budget = Arc::new(BufferBudget::new(1 << 20));
        let req = post(b"3");
        let body = req.start_buffering(b"", &budget, 64).unwrap();
        assert!(body.is_none());
        assert!(matches!(req.accept_body(b"xyz", false), BodyEvent::Complete(_)));
        assert_eq!(budget.used(), 3);

        req.release_delivery();
        assert_eq!(budget.used(), 3);
        assert_eq!(req.claim_response(), Claim::Granted);
        assert_eq!(req.claim_response(), Claim::AlreadySent);
        req.finish_response();
        assert_eq!(budget.used(), 0);
        assert!(req.body().is_none());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_delivery_release_panics() {
        let req = post(b"0");
        req.release_delivery();
        req.release_delivery();
    }

    #[test]
    fn test_abort_cancels_response() {
        let req = post(b"100");
        assert!(req.abort());
        assert!(req.is_aborted());
        assert_eq!(req.claim_response(), Claim::Aborted);
        // the delivery vote is the last one
        req.release_delivery();
    }

    #[test]
    fn test_abort_after_claim_keeps_response_vote() {
        let req = post(b"100");
        assert_eq!(req.claim_response(), Claim::Granted);
        assert!(req.abort());
        req.release_delivery();
        req.finish_response();
    }

    #[test]
    fn test_drain_ignores_outstanding_votes() {
        let req = post(b"0");
        assert_eq!(req.claim_response(), Claim::Granted);
        req.drain();
        // a responder finishing after teardown must not trip the count
        req.finish_response();
        assert_eq!(req.claim_response(), Claim::AlreadySent);
    }

    #[test]
    fn test_rejection_discards_later_response() {
        let req = post(b"10");
        req.abandon();
        assert!(req.claim_rejection());
        req.finish_response();
        assert!(req.is_aborted());
        assert_eq!(req.claim_response(), Claim::Aborted);
        assert!(!req.claim_rejection());
    }
}
