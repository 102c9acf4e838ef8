//! Response construction and encoding.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::request::{Claim, Request};
use crate::error::usage_error;
use crate::protocol::{flags, Frame, FrameType, HeaderLine, StatusCode};
use crate::transport::SendResult;

/// Largest header key or value accepted.
pub const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Largest response body accepted.
pub const MAX_BODY_LEN: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct HeaderSpan {
    start: usize,
    key_len: usize,
    value_len: usize,
}

/// A response to one request.
///
/// Can be built and sent from any thread. Each request accepts exactly one
/// response; sending a second is a usage error.
#[derive(Debug)]
pub struct Response {
    request: Arc<Request>,
    status: StatusCode,
    header_buf: Vec<u8>,
    header_index: Vec<HeaderSpan>,
    body: Bytes,
}

impl Response {
    pub fn new(request: &Arc<Request>, status: StatusCode) -> Self {
        Self {
            request: Arc::clone(request),
            status,
            header_buf: Vec::new(),
            header_index: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Append a header line.
    ///
    /// # Panics
    /// Panics if `key` is empty or either part exceeds [`MAX_HEADER_LEN`].
    pub fn write_header(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.is_empty() {
            usage_error("response header key is empty");
        }
        if key.len() > MAX_HEADER_LEN || value.len() > MAX_HEADER_LEN {
            usage_error("response header exceeds the maximum length");
        }
        self.header_index.push(HeaderSpan {
            start: self.header_buf.len(),
            key_len: key.len(),
            value_len: value.len(),
        });
        self.header_buf.extend_from_slice(key);
        self.header_buf.extend_from_slice(value);
    }

    pub fn header_count(&self) -> usize {
        self.header_index.len()
    }

    fn header_line(&self, span: &HeaderSpan) -> HeaderLine<'_> {
        let value_start = span.start + span.key_len;
        HeaderLine::literal(
            &self.header_buf[span.start..value_start],
            &self.header_buf[value_start..value_start + span.value_len],
        )
    }

    /// # Panics
    /// Panics if the body exceeds [`MAX_BODY_LEN`].
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            usage_error("response body exceeds the maximum length");
        }
        self.body = body;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Encode the response as one wire frame.
    ///
    /// The status goes first as a header line whose key is the three-digit
    /// code and whose value is empty.
    pub fn finish(self) -> Vec<u8> {
        self.encode()
    }

    fn encode(&self) -> Vec<u8> {
        let digits = self.status.digits();
        let mut headers = Vec::with_capacity(self.header_index.len() + 1);
        headers.push(HeaderLine::literal(&digits, b""));
        headers.extend(self.header_index.iter().map(|span| self.header_line(span)));

        let key = self.request.key();
        Frame {
            frame_type: FrameType::Header,
            version: self.request.version(),
            flags: flags::FINAL,
            channel: key.channel,
            stream: key.stream,
            headers,
            body: &self.body,
            body_offset: 0,
            body_total_length: self.body.len() as u64,
        }
        .encode()
    }

    /// Send the response and release the request's response vote.
    ///
    /// A response to an aborted request, or to one the backend already
    /// answered with an error, is discarded and reported as `Closed`.
    ///
    /// # Panics
    /// Panics if a response was already sent for this request.
    pub fn send(self) -> SendResult {
        let request = Arc::clone(&self.request);
        match request.claim_response() {
            Claim::Granted => {}
            Claim::Aborted => {
                debug!(stream = %request.key(), "Dropping response to abandoned request");
                return SendResult::Closed;
            }
            Claim::AlreadySent => usage_error("a response was already sent for this request"),
        }

        let frame = self.finish();
        let result = match request.session() {
            Some(session) => session.send_frame(&frame),
            None => SendResult::Closed,
        };
        trace!(stream = %request.key(), bytes = frame.len(), ?result, "Sent response");
        request.finish_response();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::header_cache::HeaderCacheRecv;
    use crate::backend::request::HeaderBlock;
    use crate::protocol::{HttpVersion, StreamKey, FRAME_PREFIX_SIZE};
    use std::sync::Weak;

    fn request() -> Arc<Request> {
        let mut cache = HeaderCacheRecv::new();
        let headers =
            HeaderBlock::build(&[HeaderLine::literal(b"GET", b"/")], &mut cache).unwrap();
        Arc::new(Request::new(
            StreamKey::new(4, 2),
            HttpVersion::Http2,
            headers,
            Weak::new(),
            0,
        ))
    }

    #[test]
    fn test_finish_layout() {
        let req = request();
        let mut resp = Response::new(&req, StatusCode::NOT_FOUND);
        resp.write_header("Content-Type", "text/plain");
        resp.write_header(b"X-Empty", b"");
        resp.set_body("nope");
        assert_eq!(resp.header_count(), 2);

        let encoded = resp.finish();
        let frame = Frame::decode(&encoded[FRAME_PREFIX_SIZE..]).unwrap();

        assert_eq!(frame.frame_type, FrameType::Header);
        assert_eq!(frame.version, HttpVersion::Http2);
        assert!(frame.is_final());
        assert_eq!(frame.key(), StreamKey::new(4, 2));
        assert_eq!(
            frame.headers,
            vec![
                HeaderLine::literal(b"404", b""),
                HeaderLine::literal(b"Content-Type", b"text/plain"),
                HeaderLine::literal(b"X-Empty", b""),
            ]
        );
        assert_eq!(frame.body, b"nope");
        assert_eq!(frame.body_offset, 0);
        assert_eq!(frame.body_total_length, 4);
    }

    #[test]
    fn test_set_status() {
        let req = request();
        let mut resp = Response::new(&req, StatusCode::OK);
        resp.set_status(StatusCode::CREATED);
        assert_eq!(resp.status(), StatusCode::CREATED);

        let encoded = resp.finish();
        let frame = Frame::decode(&encoded[FRAME_PREFIX_SIZE..]).unwrap();
        assert_eq!(frame.headers[0].key, b"201");
        assert!(frame.body.is_empty());
    }

    #[test]
    #[should_panic(expected = "key is empty")]
    fn test_empty_header_key_panics() {
        let req = request();
        Response::new(&req, StatusCode::OK).write_header("", "x");
    }

    #[test]
    #[should_panic(expected = "maximum length")]
    fn test_oversized_header_panics() {
        let req = request();
        let value = vec![b'v'; MAX_HEADER_LEN + 1];
        Response::new(&req, StatusCode::OK).write_header("X-Big", value);
    }

    #[test]
    fn test_send_to_aborted_request_is_dropped() {
        let req = request();
        req.abort();
        let resp = Response::new(&req, StatusCode::OK);
        assert_eq!(resp.send(), SendResult::Closed);
    }
}
