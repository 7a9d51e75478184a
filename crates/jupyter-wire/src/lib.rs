//! Jupyter messages as they travel over a kernel WebSocket.
//!
//! Jupyter servers expose each kernel at `/api/kernels/{id}/channels`, with
//! all four kernel channels multiplexed onto one socket. Every message
//! carries a `channel` field naming where it belongs.
//!
//! # Features
//!
//! - [`WireMessage`], the envelope with typed content keyed by `msg_type`
//! - JSON text frames, with an empty parent header written as `{}`
//! - The binary framing servers use for messages that carry buffers
//! - Conversion from `jupyter_protocol::JupyterMessage` for outbound requests

mod channel;
mod framing;
mod message;

pub use channel::Channel;
pub use framing::{decode_binary, encode_binary};
pub use message::{RawWireMessage, WireError, WireMessage};
