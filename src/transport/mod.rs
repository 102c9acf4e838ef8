//! Byte-stream transport used by the backend.
//!
//! The backend only needs a connected, ordered byte stream. [`TcpTransport`]
//! is the stock implementation; tests plug in an in-memory one.

mod tcp;

pub use tcp::TcpTransport;

use std::io;

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Every byte was handed to the transport.
    All,
    /// The transport cannot take more right now; the value is how many
    /// bytes were accepted before that happened.
    BufferFull(usize),
    /// The connection is gone.
    Closed,
}

/// Outcome of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvResult {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// Nothing arrived within the transport's wait bound.
    NoData,
    /// The peer closed the connection or the transport failed.
    Closed,
}

/// A connected byte stream.
///
/// `send` may be called from several threads at once; callers serialize
/// whole frames themselves, so implementations only need to be thread-safe,
/// not frame-aware. `recv` is only ever called from the receive loop and
/// must return within a bounded time.
pub trait Transport: Send + Sync {
    /// Connect to `addr`.
    fn connect(&mut self, addr: &str) -> io::Result<()>;

    /// Send as much of `data` as the transport will take.
    fn send(&self, data: &[u8]) -> SendResult;

    /// Receive up to `buf.len()` bytes, waiting a bounded time.
    fn recv(&self, buf: &mut [u8]) -> RecvResult;

    /// Tear the connection down. Further calls report `Closed`.
    fn shutdown(&self) {}
}
