//! Compression, datagram framing and reassembly.
//!
//! Every datagram is `[message_id: u8][chunk_index: u8][total_chunks: u8][payload]`.
//! The payloads of all chunks of one message, concatenated in index order, form a
//! compressed JSON document.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Size of the frame header in bytes
pub const HEADER_LEN: usize = 3;

/// Largest number of chunks a single message can be split into
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// Ceiling on the inflated size of one message
pub const MAX_DECOMPRESSED: usize = 64 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Invalid frame header: chunk {chunk_index} of {total_chunks}")]
    InvalidHeader { chunk_index: u8, total_chunks: u8 },

    #[error("Message needs {chunks} chunks, at most {max} are allowed", max = MAX_CHUNKS)]
    TooManyChunks { chunks: usize },

    #[error("Chunk payload size must be greater than zero")]
    InvalidChunkSize,

    #[error("Message inflates past {limit} bytes")]
    TooLarge { limit: usize },
}

/// Serialize to JSON and deflate-compress (zlib framing)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(message)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress (gzip, zlib or raw deflate) and parse JSON
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let json = decompress(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Inflate a payload, detecting the container format from its first bytes
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    decompress_limited(bytes, MAX_DECOMPRESSED)
}

fn decompress_limited(bytes: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        return inflate(GzDecoder::new(bytes), limit);
    }

    // Raw deflate can start with two bytes that pass the zlib header check
    if has_zlib_header(bytes) {
        match inflate(ZlibDecoder::new(bytes), limit) {
            Err(CodecError::Io(e)) => {
                log::trace!("Not a zlib stream ({}), trying raw deflate", e);
            }
            result => return result,
        }
    }

    inflate(DeflateDecoder::new(bytes), limit)
}

fn inflate<R: Read>(decoder: R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    decoder.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::TooLarge { limit });
    }
    Ok(out)
}

// RFC 1950: CM must be 8 (deflate) and CMF/FLG must be a multiple of 31
fn has_zlib_header(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: u8,
    pub chunk_index: u8,
    pub total_chunks: u8,
}

/// One datagram worth of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl MessageFrame {
    /// Serialize frame to datagram bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.header.message_id);
        bytes.push(self.header.chunk_index);
        bytes.push(self.header.total_chunks);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a received datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, CodecError> {
        let [message_id, chunk_index, total_chunks, payload @ ..] = datagram else {
            return Err(CodecError::FrameTooShort(datagram.len()));
        };

        if *total_chunks == 0 || chunk_index >= total_chunks {
            return Err(CodecError::InvalidHeader {
                chunk_index: *chunk_index,
                total_chunks: *total_chunks,
            });
        }

        Ok(Self {
            header: FrameHeader {
                message_id: *message_id,
                chunk_index: *chunk_index,
                total_chunks: *total_chunks,
            },
            payload: payload.to_vec(),
        })
    }
}

/// Split an encoded message into frames of at most `max_payload` bytes each
pub fn frame(
    bytes: &[u8],
    message_id: u8,
    max_payload: usize,
) -> Result<Vec<MessageFrame>, CodecError> {
    if max_payload == 0 {
        return Err(CodecError::InvalidChunkSize);
    }

    let chunks = bytes.len().div_ceil(max_payload).max(1);
    if chunks > MAX_CHUNKS {
        return Err(CodecError::TooManyChunks { chunks });
    }

    // An empty message still occupies one (empty) frame
    if bytes.is_empty() {
        return Ok(vec![MessageFrame {
            header: FrameHeader {
                message_id,
                chunk_index: 0,
                total_chunks: 1,
            },
            payload: Vec::new(),
        }]);
    }

    let total_chunks = chunks as u8;
    Ok(bytes
        .chunks(max_payload)
        .enumerate()
        .map(|(index, chunk)| MessageFrame {
            header: FrameHeader {
                message_id,
                chunk_index: index as u8,
                total_chunks,
            },
            payload: chunk.to_vec(),
        })
        .collect())
}

/// Partially received message, slots addressed by chunk index
struct PartialMessage {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl PartialMessage {
    fn new(total_chunks: u8) -> Self {
        Self {
            slots: vec![None; usize::from(total_chunks)],
            filled: 0,
        }
    }

    fn insert(&mut self, index: u8, payload: Vec<u8>) {
        let slot = &mut self.slots[usize::from(index)];
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(payload);
    }

    fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn concat(self) -> Vec<u8> {
        self.slots.into_iter().flatten().flatten().collect()
    }
}

/// Collects frames per message id until every chunk has arrived.
///
/// Buffers have no timeout of their own; a message whose remaining chunks never
/// arrive stays buffered until a frame with the same id replaces it.
#[derive(Default)]
pub struct Reassembler {
    buffers: HashMap<u8, PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame; returns the whole message once all its chunks are present
    pub fn push(&mut self, frame: MessageFrame) -> Option<Vec<u8>> {
        let FrameHeader {
            message_id,
            chunk_index,
            total_chunks,
        } = frame.header;

        if total_chunks == 1 {
            self.buffers.remove(&message_id);
            return Some(frame.payload);
        }

        let buffer = self
            .buffers
            .entry(message_id)
            .or_insert_with(|| PartialMessage::new(total_chunks));

        // Leftover from an earlier message that used the same id
        if buffer.slots.len() != usize::from(total_chunks) {
            log::debug!(
                "Discarding stale buffer for message {} ({} of {} chunks)",
                message_id,
                buffer.filled,
                buffer.slots.len()
            );
            *buffer = PartialMessage::new(total_chunks);
        }

        buffer.insert(chunk_index, frame.payload);

        if !buffer.is_complete() {
            return None;
        }

        self.buffers.remove(&message_id).map(PartialMessage::concat)
    }

    /// Number of messages currently waiting for chunks
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Response};
    use flate2::write::GzEncoder;
    use serde_json::{json, Value};

    fn large_payload() -> Value {
        // Pseudo-random text so compression cannot collapse it
        let mut state: u32 = 17;
        let words: Vec<String> = (0..4000)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                format!("{:08x}", state)
            })
            .collect();
        json!({ "clips": words })
    }

    #[test]
    fn test_encode_decode_command() {
        let command = Command::new("song", "get_prop").with_args(json!({ "prop": "tempo" }));
        let bytes = encode(&command).unwrap();

        // zlib framing
        assert!(has_zlib_header(&bytes));

        let decoded: Command = decode(&bytes).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_decode_accepts_gzip() {
        let json = br#"{"event":"result","uuid":null,"data":1}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json).unwrap();
        let gzipped = encoder.finish().unwrap();

        let response: Response = decode(&gzipped).unwrap();
        assert_eq!(response.data, json!(1));
    }

    #[test]
    fn test_decode_accepts_raw_deflate() {
        let json = br#"{"event":"connect","data":{"port":39041}}"#;
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json).unwrap();
        let deflated = encoder.finish().unwrap();

        let response: Response = decode(&deflated).unwrap();
        assert_eq!(response.data["port"], json!(39041));
    }

    #[test]
    fn test_raw_deflate_that_looks_like_zlib() {
        let json = br#"{"event":"result","data":123}"#;
        assert_eq!(json.len(), 0x1d);

        // Non-final stored block with a set padding bit: 0x08 0x1d passes the
        // zlib header check, then a final empty stored block
        let mut deflated = vec![0x08, 0x1d, 0x00, 0xe2, 0xff];
        deflated.extend_from_slice(json);
        deflated.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
        assert!(has_zlib_header(&deflated));

        let response: Response = decode(&deflated).unwrap();
        assert_eq!(response.data, json!(123));
    }

    #[test]
    fn test_inflated_size_is_capped() {
        let zeros = vec![0u8; 64 * 1024];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&zeros).unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < 1024);

        assert!(matches!(
            decompress_limited(&bomb, 4096),
            Err(CodecError::TooLarge { limit: 4096 })
        ));
        assert_eq!(decompress_limited(&bomb, zeros.len()).unwrap(), zeros);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Response, _> = decode(b"definitely not compressed json");
        assert!(result.is_err());

        // Valid compression, invalid JSON
        let bytes = {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(b"{ nope").unwrap();
            encoder.finish().unwrap()
        };
        let result: Result<Response, _> = decode(&bytes);
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_frame_header_layout() {
        let frames = frame(&[1, 2, 3, 4, 5], 9, 2).unwrap();
        assert_eq!(frames.len(), 3);

        let bytes = frames[2].to_bytes();
        assert_eq!(bytes, vec![9, 2, 3, 5]);

        let parsed = MessageFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frames[2]);
    }

    #[test]
    fn test_frame_exact_multiple() {
        let frames = frame(&[0u8; 8], 1, 4).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.header.total_chunks == 2));
    }

    #[test]
    fn test_frame_empty_message() {
        let frames = frame(&[], 3, 100).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.total_chunks, 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_frame_rejects_too_many_chunks() {
        let bytes = vec![0u8; 256];
        assert!(frame(&bytes, 0, 1).is_err());
        assert_eq!(frame(&bytes[..255], 0, 1).unwrap().len(), 255);
        assert!(matches!(
            frame(&bytes, 0, 0),
            Err(CodecError::InvalidChunkSize)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert!(matches!(
            MessageFrame::parse(&[1, 0]),
            Err(CodecError::FrameTooShort(2))
        ));
        assert!(MessageFrame::parse(&[1, 0, 0]).is_err());
        assert!(MessageFrame::parse(&[1, 3, 3, 0xaa]).is_err());
        assert!(MessageFrame::parse(&[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_reassembly_in_order() {
        let bytes = encode(&large_payload()).unwrap();
        let frames = frame(&bytes, 200, 1000).unwrap();
        assert!(frames.len() > 1);

        let mut reassembler = Reassembler::new();
        let last = frames.len() - 1;
        for (i, f) in frames.into_iter().enumerate() {
            let result = reassembler.push(f);
            if i < last {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), bytes);
            }
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_reassembly_is_order_independent() {
        let payload = large_payload();
        let bytes = encode(&payload).unwrap();
        let frames = frame(&bytes, 4, 700).unwrap();
        let n = frames.len();
        assert!(n >= 4);

        // Several permutations: reversed, odd-then-even, rotated
        let reversed: Vec<usize> = (0..n).rev().collect();
        let interleaved: Vec<usize> = (0..n).filter(|i| i % 2 == 1).chain((0..n).filter(|i| i % 2 == 0)).collect();
        let rotated: Vec<usize> = (0..n).map(|i| (i + n / 2) % n).collect();

        for order in [reversed, interleaved, rotated] {
            let mut reassembler = Reassembler::new();
            let mut complete = None;
            for (position, &index) in order.iter().enumerate() {
                let result = reassembler.push(frames[index].clone());
                if position + 1 < n {
                    assert!(result.is_none());
                } else {
                    complete = result;
                }
            }

            let decoded: Value = decode(&complete.unwrap()).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_reassembly_ignores_duplicates() {
        let frames = frame(&[1, 2, 3, 4], 5, 2).unwrap();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.push(frames[0].clone()).is_none());
        assert!(reassembler.push(frames[0].clone()).is_none());
        assert_eq!(reassembler.push(frames[1].clone()).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reassembly_separates_message_ids() {
        let a = frame(&[1, 1, 1, 1], 1, 2).unwrap();
        let b = frame(&[2, 2, 2, 2], 2, 2).unwrap();
        let mut reassembler = Reassembler::new();

        assert!(reassembler.push(a[0].clone()).is_none());
        assert!(reassembler.push(b[1].clone()).is_none());
        assert_eq!(reassembler.pending(), 2);

        assert_eq!(reassembler.push(b[0].clone()).unwrap(), vec![2, 2, 2, 2]);
        assert_eq!(reassembler.push(a[1].clone()).unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_reassembly_replaces_stale_buffer() {
        let old = frame(&[9u8; 6], 8, 2).unwrap(); // 3 chunks
        let new = frame(&[7u8; 4], 8, 2).unwrap(); // 2 chunks, same id

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(old[0].clone()).is_none());
        assert!(reassembler.push(new[1].clone()).is_none());
        assert_eq!(reassembler.push(new[0].clone()).unwrap(), vec![7u8; 4]);
    }

    #[test]
    fn test_single_chunk_clears_partial() {
        let partial = frame(&[1, 2, 3, 4], 6, 2).unwrap();
        let single = frame(&[5], 6, 2).unwrap();

        let mut reassembler = Reassembler::new();
        reassembler.push(partial[0].clone());
        assert_eq!(reassembler.push(single[0].clone()).unwrap(), vec![5]);
        assert_eq!(reassembler.pending(), 0);
    }
}
