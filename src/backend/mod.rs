//! The backend: one connection to the front-end, the receive loop, and
//! reassembly of multi-frame requests.
//!
//! ## Body delivery
//!
//! Each request is in one of two modes:
//! - buffered: body frames accumulate in a charged buffer and the caller
//!   sees the request once, as a header frame flagged last, carrying the
//!   whole body. Requests whose `Content-Length` is at most
//!   [`BackendConfig::max_auto_buffer_size`] are buffered automatically; a
//!   larger one is buffered when the caller calls
//!   [`InFrame::resend_when_body_is_done`] on its header frame.
//! - streamed: the header frame and every body frame are delivered as they
//!   arrive, and the caller consumes the bytes itself.
//!
//! Buffering a request charges its whole declared body length against one
//! budget ([`BackendConfig::max_waiting_buffer_total`]) up front; a request
//! that does not fit is answered with 503 and dropped. A streamed request
//! the backend has to drop is reported to the caller as an aborted frame.
//!
//! ## Threading
//!
//! [`Backend::recv`] runs on one thread. Responses may be sent from any
//! thread; the connection serializes them.

mod buffer;
mod header_cache;
mod request;
mod response;
mod session;

pub use buffer::{Buffer, BufferBudget, BufferError, Charge};
pub use request::Request;
pub use response::{Response, MAX_BODY_LEN, MAX_HEADER_LEN};

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use self::header_cache::HeaderCacheRecv;
use self::request::{BodyEvent, HeaderBlock};
use self::session::Session;
use crate::error::{usage_error, BackendError};
use crate::protocol::{
    Frame, FrameType, StatusCode, StreamKey, FRAME_PREFIX_SIZE, MAX_FRAME_SIZE,
};
use crate::transport::{RecvResult, TcpTransport, Transport};

/// Bytes read from the transport per call.
const RECV_CHUNK_SIZE: usize = 64 * 1024;

/// Backend tuning.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Bodies up to this size are buffered without asking the caller.
    pub max_auto_buffer_size: u64,
    /// Limit on bytes held in body buffers across all requests.
    pub max_waiting_buffer_total: usize,
    /// First allocation for a body buffer; it doubles from there.
    pub initial_buffer_size: usize,
    /// How long one transport read may wait.
    pub recv_timeout: Duration,
    /// Largest frame accepted before the connection is closed.
    pub max_frame_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_auto_buffer_size: 16 * 1024 * 1024,
            max_waiting_buffer_total: 1024 * 1024 * 1024,
            initial_buffer_size: 64 * 1024,
            recv_timeout: Duration::from_millis(500),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Receiving end of the bridge.
pub struct Backend {
    config: BackendConfig,
    budget: Arc<BufferBudget>,
    conn: Option<Connection>,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Self {
        let budget = Arc::new(BufferBudget::new(config.max_waiting_buffer_total));
        Self {
            config,
            budget,
            conn: None,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn set_max_auto_buffer_size(&mut self, size: u64) {
        self.config.max_auto_buffer_size = size;
    }

    /// Connect through `transport`, closing any previous connection first.
    pub fn connect<T: Transport + 'static>(
        &mut self,
        mut transport: T,
        addr: &str,
    ) -> Result<(), BackendError> {
        self.close();
        transport.connect(addr)?;
        info!(addr, "Connected to front-end");
        self.conn = Some(Connection {
            session: Session::new(Box::new(transport), Arc::clone(&self.budget)),
            recv_buf: BytesMut::with_capacity(RECV_CHUNK_SIZE),
            scratch: vec![0; RECV_CHUNK_SIZE].into_boxed_slice(),
            header_cache: HeaderCacheRecv::new(),
            owner: thread::current().id(),
        });
        Ok(())
    }

    /// Connect over TCP.
    pub fn connect_tcp(&mut self, addr: &str) -> Result<(), BackendError> {
        let transport = TcpTransport::with_recv_timeout(self.config.recv_timeout);
        self.connect(transport, addr)
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| !conn.session.is_closed())
    }

    /// Drop the connection and every request on it.
    ///
    /// # Panics
    /// Panics if buffered bytes are still charged afterwards.
    pub fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let requests = conn.session.requests();
        if !requests.is_empty() {
            debug!(count = requests.len(), "Abandoning in-flight requests");
        }
        for request in requests {
            request.drain();
        }
        conn.session.shutdown();
        info!("Connection closed");

        if self.budget.used() != 0 && !thread::panicking() {
            usage_error("buffered bytes still charged after closing the connection");
        }
    }

    /// Bytes currently held in body buffers.
    pub fn buffered_bytes(&self) -> usize {
        self.budget.used()
    }

    /// Requests that have not yet finished both delivery and response.
    pub fn active_streams(&self) -> usize {
        self.conn
            .as_ref()
            .map_or(0, |conn| conn.session.active_streams())
    }

    /// Receive the next frame for the caller.
    ///
    /// Frames already read are processed first; otherwise this does at most
    /// one bounded transport read. `Ok(None)` means nothing is ready yet.
    /// An error closes the connection.
    pub fn recv(&mut self) -> Result<Option<InFrame<'_>>, BackendError> {
        let conn = self.conn.as_mut().ok_or(BackendError::NotConnected)?;
        conn.owner = thread::current().id();

        let delivery = match conn.poll(&self.config) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Ok(None),
            Err(e) => {
                match &e {
                    BackendError::Closed => info!("Front-end closed the connection"),
                    e => warn!(error = %e, "Closing connection"),
                }
                self.close();
                return Err(e);
            }
        };

        let conn = self.conn.as_ref().ok_or(BackendError::NotConnected)?;
        Ok(Some(InFrame {
            config: &self.config,
            conn,
            delivery,
        }))
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.close();
    }
}

struct Connection {
    session: Arc<Session>,
    recv_buf: BytesMut,
    /// Transport reads land here before they are appended to `recv_buf`.
    scratch: Box<[u8]>,
    header_cache: HeaderCacheRecv,
    /// Thread driving the receive loop.
    owner: ThreadId,
}

impl Connection {
    fn poll(&mut self, config: &BackendConfig) -> Result<Option<Delivery>, BackendError> {
        if let Some(delivery) = self.process_buffered(config)? {
            return Ok(Some(delivery));
        }
        if !self.fill()? {
            return Ok(None);
        }
        self.process_buffered(config)
    }

    /// Handle complete frames in the receive buffer until one is for the caller.
    fn process_buffered(
        &mut self,
        config: &BackendConfig,
    ) -> Result<Option<Delivery>, BackendError> {
        while let Some(payload) = self.next_frame(config)? {
            if let Some(delivery) = self.dispatch(config, &payload)? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// One transport read. Returns whether any bytes arrived.
    fn fill(&mut self) -> Result<bool, BackendError> {
        match self.session.recv(&mut self.scratch) {
            RecvResult::Data(n) => {
                self.recv_buf.extend_from_slice(&self.scratch[..n]);
                Ok(true)
            }
            RecvResult::NoData => Ok(false),
            RecvResult::Closed => Err(BackendError::Closed),
        }
    }

    /// Split the next complete frame payload off the receive buffer.
    fn next_frame(&mut self, config: &BackendConfig) -> Result<Option<Bytes>, BackendError> {
        if self.recv_buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = &self.recv_buf[..FRAME_PREFIX_SIZE];
        let len = prefix.get_u32_le() as usize;
        if len > config.max_frame_size {
            return Err(BackendError::FrameTooLarge {
                size: len,
                limit: config.max_frame_size,
            });
        }
        if self.recv_buf.len() < FRAME_PREFIX_SIZE + len {
            return Ok(None);
        }
        self.recv_buf.advance(FRAME_PREFIX_SIZE);
        Ok(Some(self.recv_buf.split_to(len).freeze()))
    }

    fn dispatch(
        &mut self,
        config: &BackendConfig,
        payload: &Bytes,
    ) -> Result<Option<Delivery>, BackendError> {
        let frame = Frame::decode(payload)?;
        trace!(
            stream = %frame.key(),
            frame_type = ?frame.frame_type,
            flags = frame.flags,
            body = frame.body.len(),
            "Frame"
        );
        match frame.frame_type {
            FrameType::Header => self.on_header(config, &frame, payload),
            FrameType::Body => Ok(self.on_body(&frame, payload)),
            FrameType::Abort => Ok(self.on_abort(frame.key())),
        }
    }

    fn on_header(
        &mut self,
        config: &BackendConfig,
        frame: &Frame<'_>,
        payload: &Bytes,
    ) -> Result<Option<Delivery>, BackendError> {
        let key = frame.key();
        let headers = HeaderBlock::build(&frame.headers, &mut self.header_cache)?;
        let body = payload.slice_ref(frame.body);
        let request = Arc::new(Request::new(
            key,
            frame.version,
            headers,
            Arc::downgrade(&self.session),
            body.len() as u64,
        ));
        if !self.session.register(&request) {
            return Err(BackendError::DuplicateStream(key));
        }

        let body_length = request.body_length();
        debug!(
            stream = %key,
            method = %String::from_utf8_lossy(request.method()),
            uri = %String::from_utf8_lossy(request.uri()),
            body_length,
            "Request"
        );

        if body.len() as u64 > body_length {
            return Ok(reject_stream(
                &self.session,
                request,
                StatusCode::BAD_REQUEST,
                "header frame body exceeds Content-Length",
            ));
        }

        if frame.is_final() {
            request.complete_inline(body.clone());
            return Ok(Some(Delivery::complete(request, body)));
        }

        if body_length <= config.max_auto_buffer_size {
            let buffered =
                request.start_buffering(&body, self.session.budget(), config.initial_buffer_size);
            return Ok(match buffered {
                Ok(Some(whole)) => Some(Delivery::complete(request, whole)),
                Ok(None) => None,
                Err(e) => reject_stream(
                    &self.session,
                    request,
                    StatusCode::SERVICE_UNAVAILABLE,
                    buffer_error_reason(e),
                ),
            });
        }

        let last = body.len() as u64 == body_length;
        request.announce(last);
        Ok(Some(Delivery {
            request,
            is_header: true,
            is_last: last,
            is_aborted: false,
            owns_delivery: last,
            body,
            body_offset: 0,
        }))
    }

    fn on_body(&self, frame: &Frame<'_>, payload: &Bytes) -> Option<Delivery> {
        let key = frame.key();
        let Some(request) = self.session.lookup(key) else {
            warn!(stream = %key, "Body frame for unknown stream, discarding");
            return None;
        };

        let body = payload.slice_ref(frame.body);
        match request.accept_body(&body, frame.is_final()) {
            BodyEvent::Streamed { offset, last } => Some(Delivery {
                request,
                is_header: false,
                is_last: last,
                is_aborted: false,
                owns_delivery: last,
                body,
                body_offset: offset,
            }),
            BodyEvent::Pending => None,
            BodyEvent::Complete(whole) => Some(Delivery::complete(request, whole)),
            BodyEvent::Ignored => {
                debug!(stream = %key, "Body frame after end of body, discarding");
                None
            }
            BodyEvent::Overflow => reject_stream(
                &self.session,
                request,
                StatusCode::BAD_REQUEST,
                "body exceeds Content-Length",
            ),
            BodyEvent::OutOfMemory(e) => reject_stream(
                &self.session,
                request,
                StatusCode::SERVICE_UNAVAILABLE,
                buffer_error_reason(e),
            ),
        }
    }

    fn on_abort(&self, key: StreamKey) -> Option<Delivery> {
        let Some(request) = self.session.lookup(key) else {
            debug!(stream = %key, "Abort for unknown stream");
            return None;
        };
        debug!(stream = %key, "Stream aborted by front-end");
        let owns_delivery = request.abort();
        Some(Delivery::aborted(request, owns_delivery))
    }
}

fn buffer_error_reason(e: BufferError) -> &'static str {
    match e {
        BufferError::BudgetExhausted => "body buffer budget exhausted",
        BufferError::AllocFailed => "body buffer allocation failed",
        BufferError::CapacityExceeded => "body larger than addressable memory",
    }
}

/// Answer a stream with an error status and forget it. The connection and
/// every other stream carry on.
///
/// If the caller has already seen the request's header frame, the returned
/// aborted frame tells it the stream is gone.
fn reject_stream(
    session: &Session,
    request: Arc<Request>,
    status: StatusCode,
    reason: &str,
) -> Option<Delivery> {
    warn!(stream = %request.key(), %status, reason, "Dropping stream");
    request.abandon();
    if request.claim_rejection() {
        let frame = Response::new(&request, status).finish();
        session.send_frame(&frame);
        request.finish_response();
    }
    if request.is_announced() {
        let owns_delivery = request.delivery_pending();
        return Some(Delivery::aborted(request, owns_delivery));
    }
    request.release_delivery_if_pending();
    None
}

/// What one `recv` hands to the caller.
struct Delivery {
    request: Arc<Request>,
    is_header: bool,
    is_last: bool,
    is_aborted: bool,
    /// Dropping this casts the request's delivery vote.
    owns_delivery: bool,
    body: Bytes,
    body_offset: u64,
}

impl Delivery {
    /// A request with its whole body.
    fn complete(request: Arc<Request>, body: Bytes) -> Self {
        Self {
            request,
            is_header: true,
            is_last: true,
            is_aborted: false,
            owns_delivery: true,
            body,
            body_offset: 0,
        }
    }

    /// The request is gone; nothing more follows.
    fn aborted(request: Arc<Request>, owns_delivery: bool) -> Self {
        Self {
            request,
            is_header: false,
            is_last: true,
            is_aborted: true,
            owns_delivery,
            body: Bytes::new(),
            body_offset: 0,
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.owns_delivery {
            self.request.release_delivery();
        }
    }
}

/// One unit of work from [`Backend::recv`].
///
/// Borrows the backend, so it must be dropped before the next `recv`.
pub struct InFrame<'a> {
    config: &'a BackendConfig,
    conn: &'a Connection,
    delivery: Delivery,
}

impl<'a> InFrame<'a> {
    pub fn request(&self) -> &Arc<Request> {
        &self.delivery.request
    }

    /// First frame of the request: method, URI and headers are new.
    pub fn is_header(&self) -> bool {
        self.delivery.is_header
    }

    /// No more frames follow for this request.
    pub fn is_last(&self) -> bool {
        self.delivery.is_last
    }

    pub fn is_aborted(&self) -> bool {
        self.delivery.is_aborted
    }

    /// Body bytes carried by this frame; the whole body for a buffered request.
    pub fn body(&self) -> &Bytes {
        &self.delivery.body
    }

    /// Position of [`body`](Self::body) within the request body.
    pub fn body_offset(&self) -> u64 {
        self.delivery.body_offset
    }

    /// Buffer the rest of this request's body and deliver it again, whole,
    /// once it has arrived.
    ///
    /// If the buffer budget cannot hold the body the request is answered
    /// with 503 and dropped instead; this frame's request then reports
    /// [`is_aborted`](Request::is_aborted).
    ///
    /// # Panics
    /// Panics unless this is the header frame of a request whose body is
    /// still incomplete, if called twice for one request, or if called
    /// from a thread other than the one running [`Backend::recv`].
    pub fn resend_when_body_is_done(&self) {
        let delivery = &self.delivery;
        if !delivery.is_header || delivery.is_last || delivery.is_aborted {
            usage_error("resend_when_body_is_done called on a frame that is not an incomplete request header");
        }
        // later frames for this stream may already have been consumed
        if thread::current().id() != self.conn.owner {
            usage_error("resend_when_body_is_done called from a thread other than the receiving thread");
        }

        let request = &delivery.request;
        let session = &self.conn.session;
        match request.start_buffering(
            &delivery.body,
            session.budget(),
            self.config.initial_buffer_size,
        ) {
            Ok(_) => debug!(stream = %request.key(), "Buffering remaining body"),
            Err(e) => {
                // the caller holds this header frame; dropping the aborted
                // one casts the delivery vote
                drop(reject_stream(
                    session,
                    Arc::clone(request),
                    StatusCode::SERVICE_UNAVAILABLE,
                    buffer_error_reason(e),
                ));
            }
        }
    }
}

impl std::fmt::Debug for InFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFrame")
            .field("stream", &self.delivery.request.key())
            .field("is_header", &self.delivery.is_header)
            .field("is_last", &self.delivery.is_last)
            .field("is_aborted", &self.delivery.is_aborted)
            .field("body_len", &self.delivery.body.len())
            .field("body_offset", &self.delivery.body_offset)
            .finish()
    }
}
