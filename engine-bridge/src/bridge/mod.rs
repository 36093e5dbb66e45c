//! Wire layer for bridge-engine communication over stdio.
//!
//! # Architecture
//!
//! - **framer**: reassembles newline-delimited lines from raw output chunks
//! - **protocol**: message envelope and type vocabulary
//! - **codec**: envelope validation, JSON encode/decode

pub mod codec;
pub mod framer;
pub mod protocol;

pub use codec::{DecodeError, EncodingError, decode, encode};
pub use framer::LineFramer;
pub use protocol::{Message, MessageType};
