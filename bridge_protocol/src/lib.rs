//! # Bridge Protocol
//!
//! Wire format spoken between the live-bridge engine and the control-surface
//! script running inside the host application.
//!
//! This crate provides:
//! - Message definitions (commands, responses, cache replies)
//! - The datagram codec: compression, chunk framing and reassembly
//!
//! ## Example Usage
//!
//! ```rust
//! use bridge_protocol::{codec, Command, Reassembler};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let command = Command::new("song", "get_prop").with_args(json!({ "prop": "tempo" }));
//!
//! // Compress and split into datagram-sized frames
//! let bytes = codec::encode(&command)?;
//! let frames = codec::frame(&bytes, 7, 1024)?;
//!
//! // The receiving side puts them back together
//! let mut reassembler = Reassembler::new();
//! let mut complete = None;
//! for frame in frames {
//!     complete = reassembler.push(frame);
//! }
//!
//! let decoded: Command = codec::decode(&complete.unwrap())?;
//! assert_eq!(decoded, command);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod protocol;

// Re-export commonly used types
pub use codec::{CodecError, FrameHeader, MessageFrame, Reassembler};
pub use protocol::{CacheResponse, Command, Response, ResponseKind};
