//! Wire codec: `uint32_be(length) || "PY" || body[length]` (spec §3, §4.1, §6).
//!
//! `FrameDecoder` holds a persistent byte buffer and incrementally yields
//! complete frames as bytes arrive, matching the teacher's
//! `socket::framing::FrameDecoder::feed` shape but generalized to the
//! `"PY"`-marker byte-resync parser specified in §4.1.

use anyhow::{Context, Result};

use super::message::ProtocolMessage;
use crate::constants::FRAME_MARKER;

/// Header size: 4-byte big-endian length + 2-byte `"PY"` marker.
const HEADER_LEN: usize = 6;

/// Incremental frame decoder over a persistent byte buffer.
///
/// `feed` appends newly read bytes and returns every complete
/// `ProtocolMessage` that can be parsed out of the accumulated buffer,
/// leaving any trailing partial frame buffered for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append `data` to the internal buffer and decode as many complete
    /// frames as possible. Never panics on malformed input; corrupt or
    /// oversize frames are skipped per the §4.1 resync algorithm.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ProtocolMessage> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            if self.buffer[4..6] != FRAME_MARKER {
                match find_marker(&self.buffer) {
                    Some(marker_pos) if marker_pos >= 4 => {
                        self.buffer.drain(0..marker_pos - 4);
                        continue;
                    }
                    Some(_) => {
                        // Marker found but too close to the front to have a
                        // valid 4-byte length prefix ahead of it; drop one
                        // byte and rescan.
                        self.buffer.remove(0);
                        continue;
                    }
                    None => {
                        // No marker anywhere in the buffer: keep only the
                        // last few bytes in case a marker is split across
                        // feed() calls, drop the rest as garbage.
                        let keep_from = self.buffer.len().saturating_sub(HEADER_LEN - 1);
                        self.buffer.drain(0..keep_from);
                        break;
                    }
                }
            }

            let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;

            if len > self.max_frame_size {
                self.buffer.remove(0);
                continue;
            }

            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            let body = &self.buffer[HEADER_LEN..HEADER_LEN + len];
            match serde_json::from_slice::<ProtocolMessage>(body) {
                Ok(msg) => out.push(msg),
                Err(e) => {
                    log::debug!("dropping frame with undecodable body: {e}");
                }
            }
            self.buffer.drain(0..HEADER_LEN + len);
        }

        out
    }
}

/// Find the byte offset of the next `"PY"` occurrence in `buf`, if any.
fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == FRAME_MARKER)
}

/// Encode a single `ProtocolMessage` into its wire frame.
pub fn encode_frame(msg: &ProtocolMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).context("failed to serialize ProtocolMessage")?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&FRAME_MARKER);
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::max_frame_size;

    fn sample_message(n: u64) -> ProtocolMessage {
        ProtocolMessage::new("mouse", "server", n, 1.0)
    }

    #[test]
    fn roundtrip_single_frame() {
        let msg = sample_message(1);
        let bytes = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sequence_id, 1);
    }

    #[test]
    fn partial_frame_buffers_until_complete() {
        let msg = sample_message(2);
        let bytes = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new(max_frame_size(1024));

        assert!(decoder.feed(&bytes[..4]).is_empty());
        assert!(decoder.feed(&bytes[4..bytes.len() - 2]).is_empty());
        let decoded = decoder.feed(&bytes[bytes.len() - 2..]);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn byte_at_a_time_still_decodes() {
        let msg = sample_message(3);
        let bytes = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let mut decoded = Vec::new();
        for b in &bytes {
            decoded.extend(decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sequence_id, 3);
    }

    #[test]
    fn garbage_before_marker_is_resynced() {
        let msg = sample_message(4);
        let good = encode_frame(&msg).unwrap();
        let mut stream = vec![0xFFu8; 10];
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let decoded = decoder.feed(&stream);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sequence_id, 4);
    }

    #[test]
    fn oversize_frame_is_skipped_not_fatal() {
        let mut stream = Vec::new();
        // Declare an absurd length, then follow with a real valid frame.
        stream.extend_from_slice(&(10_000_000u32).to_be_bytes());
        stream.extend_from_slice(&FRAME_MARKER);
        stream.extend_from_slice(b"not really that long");

        let good = encode_frame(&sample_message(5)).unwrap();
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let decoded = decoder.feed(&stream);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sequence_id, 5);
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut stream = Vec::new();
        for i in 0..5 {
            stream.extend_from_slice(&encode_frame(&sample_message(i)).unwrap());
        }
        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let decoded = decoder.feed(&stream);
        assert_eq!(decoded.len(), 5);
        for (i, msg) in decoded.iter().enumerate() {
            assert_eq!(msg.sequence_id, i as u64);
        }
    }

    #[test]
    fn undecodable_body_is_dropped_not_fatal() {
        let mut bad_body = serde_json::to_vec(&sample_message(6)).unwrap();
        bad_body.truncate(bad_body.len() - 3); // corrupt JSON
        let mut stream = Vec::new();
        stream.extend_from_slice(&(bad_body.len() as u32).to_be_bytes());
        stream.extend_from_slice(&FRAME_MARKER);
        stream.extend_from_slice(&bad_body);

        let good = encode_frame(&sample_message(7)).unwrap();
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new(max_frame_size(1024));
        let decoded = decoder.feed(&stream);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sequence_id, 7);
    }

    proptest::proptest! {
        #[test]
        fn parser_never_panics_on_random_bytes(bytes: Vec<u8>) {
            let mut decoder = FrameDecoder::new(max_frame_size(1024));
            let _ = decoder.feed(&bytes);
        }

        #[test]
        fn parser_recovers_valid_frames_from_noisy_stream(
            garbage_lens in proptest::collection::vec(0usize..5, 0..8),
        ) {
            let mut stream = Vec::new();
            let mut expected = Vec::new();
            for (i, glen) in garbage_lens.iter().enumerate() {
                stream.extend(std::iter::repeat(0xAAu8).take(*glen));
                let msg = sample_message(i as u64);
                stream.extend_from_slice(&encode_frame(&msg).unwrap());
                expected.push(i as u64);
            }
            let mut decoder = FrameDecoder::new(max_frame_size(1024));
            let decoded = decoder.feed(&stream);
            let got: Vec<u64> = decoded.iter().map(|m| m.sequence_id).collect();
            proptest::prop_assert_eq!(got, expected);
        }
    }
}
