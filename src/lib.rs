//! bridge-backend: the backend half of a framed HTTP bridge.
//!
//! A front-end HTTP server accepts real HTTP traffic and forwards each request
//! to this backend as a sequence of length-prefixed frames over one persistent
//! connection. This crate decodes those frames, reassembles request bodies,
//! and encodes responses back onto the same connection.
//!
//! Components:
//! - `protocol`: wire format (FlatBuffers tables behind a `u32` length prefix)
//! - `transport`: byte-stream abstraction plus a TCP implementation
//! - `backend`: receive loop, stream reassembly, body buffering under a
//!   global memory budget, request lifetime, and response encoding
//!
//! # Example
//!
//! ```ignore
//! use bridge_backend::{Backend, BackendConfig, Response, StatusCode};
//!
//! let mut backend = Backend::new(BackendConfig::default());
//! backend.connect_tcp("127.0.0.1:8081")?;
//! loop {
//!     if let Some(frame) = backend.recv()? {
//!         if frame.is_last() && !frame.is_aborted() {
//!             let mut response = Response::new(frame.request(), StatusCode::OK);
//!             response.set_body(frame.body().clone());
//!             response.send();
//!         }
//!     }
//! }
//! ```

pub mod backend;
pub mod error;
pub mod protocol;
pub mod transport;

pub use backend::{
    Backend, BackendConfig, Buffer, BufferBudget, InFrame, Request, Response,
};
pub use error::{BackendError, DecodeError};
pub use protocol::{HttpVersion, StatusCode, StreamKey};
pub use transport::{RecvResult, SendResult, TcpTransport, Transport};
