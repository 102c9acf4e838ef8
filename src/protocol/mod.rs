//! Wire protocol between the front-end and this backend.

pub(crate) mod flatbuf;
mod frame;
mod status;

pub use frame::{
    flags, Frame, FrameType, HeaderLine, HttpVersion, StreamKey, FRAME_PREFIX_SIZE,
    MAX_FRAME_SIZE,
};
pub use status::StatusCode;
