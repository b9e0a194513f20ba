use bytes::{Buf, Bytes, BytesMut};

use crate::error::{GatewayError, Result};

/// Prelude: total length (u32 BE) + header length (u32 BE) + prelude CRC.
const PRELUDE_LEN: usize = 12;
/// Prelude plus the trailing message CRC.
const FRAME_OVERHEAD: usize = 16;
/// Header value type tag for strings; the only type the backend emits.
const HEADER_TYPE_STRING: u8 = 7;
/// Upper bound on a single frame; anything larger is treated as corruption
/// rather than an allocation request.
const MAX_FRAME_LEN: usize = 1 << 24;

/// Name of the header carrying the event tag.
pub const EVENT_TYPE_HEADER: &str = ":event-type";

/// One complete, checksum-verified frame from the backend event stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(EVENT_TYPE_HEADER)
    }

    /// Encode a frame in the backend's wire format. The decoder is the
    /// consumer in production; encoding exists for fixtures and benches.
    pub fn encode(event_type: &str, payload: &[u8]) -> Bytes {
        let mut headers = Vec::new();
        for (name, value) in [(EVENT_TYPE_HEADER, event_type), (":message-type", "event")] {
            headers.push(name.len() as u8);
            headers.extend_from_slice(name.as_bytes());
            headers.push(HEADER_TYPE_STRING);
            headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
            headers.extend_from_slice(value.as_bytes());
        }

        let total_len = FRAME_OVERHEAD + headers.len() + payload.len();
        let mut out = BytesMut::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&out[..8]).to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc32fast::hash(&out[..]).to_be_bytes());
        out.freeze()
    }
}

/// Incremental decoder for the backend's length-prefixed binary stream.
///
/// Network reads never align with frame boundaries, so the decoder keeps
/// the unconsumed tail between `feed` calls and only emits frames whose
/// length and checksums verified. State is per-connection; a decoder is
/// never reused across connections.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed raw bytes, returning every frame completed by this chunk.
    /// An incomplete tail stays buffered; corruption is terminal.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Call when the connection closes. Leftover bytes mean the backend
    /// hung up mid-frame, which must not pass as a clean end of stream.
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::TruncatedStream(self.buffer.len()))
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&total_len) {
            return Err(GatewayError::FrameCorruption(format!(
                "frame length {total_len} outside [{FRAME_OVERHEAD}, {MAX_FRAME_LEN}]"
            )));
        }

        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
        if headers_len + FRAME_OVERHEAD > total_len {
            return Err(GatewayError::FrameCorruption(format!(
                "header block {headers_len} exceeds frame length {total_len}"
            )));
        }

        let prelude_crc = u32::from_be_bytes(self.buffer[8..12].try_into().unwrap());
        if crc32fast::hash(&self.buffer[0..8]) != prelude_crc {
            return Err(GatewayError::FrameCorruption("prelude checksum mismatch".into()));
        }

        let message_crc =
            u32::from_be_bytes(self.buffer[total_len - 4..total_len].try_into().unwrap());
        if crc32fast::hash(&self.buffer[0..total_len - 4]) != message_crc {
            return Err(GatewayError::FrameCorruption("message checksum mismatch".into()));
        }

        let mut frame_bytes = self.buffer.split_to(total_len).freeze();
        frame_bytes.advance(PRELUDE_LEN);
        let header_block = frame_bytes.split_to(headers_len);
        frame_bytes.truncate(frame_bytes.len() - 4);

        let headers = parse_headers(&header_block)?;
        Ok(Some(Frame {
            headers,
            payload: frame_bytes,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    let mut pos = 0;

    while pos < block.len() {
        let name_len = block[pos] as usize;
        pos += 1;
        if pos + name_len + 3 > block.len() {
            return Err(GatewayError::FrameCorruption(
                "header name overruns header block".into(),
            ));
        }

        let name = std::str::from_utf8(&block[pos..pos + name_len])
            .map_err(|_| GatewayError::FrameCorruption("header name is not UTF-8".into()))?
            .to_string();
        pos += name_len;

        let value_type = block[pos];
        pos += 1;
        if value_type != HEADER_TYPE_STRING {
            return Err(GatewayError::FrameCorruption(format!(
                "unsupported header value type {value_type}"
            )));
        }

        let value_len = u16::from_be_bytes(block[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if pos + value_len > block.len() {
            return Err(GatewayError::FrameCorruption(
                "header value overruns header block".into(),
            ));
        }

        let value = std::str::from_utf8(&block[pos..pos + value_len])
            .map_err(|_| GatewayError::FrameCorruption("header value is not UTF-8".into()))?
            .to_string();
        pos += value_len;

        headers.push((name, value));
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_frame() {
        let wire = Frame::encode("assistantResponseEvent", br#"{"content":"Hi"}"#);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
        assert_eq!(&frames[0].payload[..], br#"{"content":"Hi"}"#);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let wire = Frame::encode("assistantResponseEvent", br#"{"content":"Hello"}"#);

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(decoder.feed(&[*byte]).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], br#"{"content":"Hello"}"#);
    }

    #[test]
    fn test_decode_multiple_frames_one_chunk() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Frame::encode("assistantResponseEvent", b"{\"content\":\"a\"}"));
        wire.extend_from_slice(&Frame::encode("assistantResponseEvent", b"{\"content\":\"b\"}"));
        wire.extend_from_slice(&Frame::encode("messageStopEvent", b"{}"));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].event_type(), Some("messageStopEvent"));
    }

    #[test]
    fn test_zero_length_payload_is_emitted() {
        let wire = Frame::encode("pingEvent", b"");

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let wire = Frame::encode("assistantResponseEvent", br#"{"content":"Hi"}"#);
        let mut corrupted = wire.to_vec();
        let payload_pos = corrupted.len() - 6;
        corrupted[payload_pos] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&corrupted).unwrap_err();
        assert!(matches!(err, GatewayError::FrameCorruption(_)));
    }

    #[test]
    fn test_corrupted_prelude_fails_checksum() {
        let wire = Frame::encode("assistantResponseEvent", br#"{"content":"Hi"}"#);
        let mut corrupted = wire.to_vec();
        corrupted[9] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&corrupted).is_err());
    }

    #[test]
    fn test_absurd_length_prefix_is_corruption() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, GatewayError::FrameCorruption(_)));
    }

    #[test]
    fn test_truncated_tail_reported_on_finish() {
        let wire = Frame::encode("assistantResponseEvent", br#"{"content":"Hi"}"#);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire[..wire.len() - 5]).unwrap();

        assert!(frames.is_empty());
        let err = decoder.finish().unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedStream(n) if n == wire.len() - 5));
    }

    #[test]
    fn test_header_length_exceeding_frame_is_corruption() {
        let wire = Frame::encode("assistantResponseEvent", b"{}");
        let mut corrupted = wire.to_vec();
        // Inflate the embedded header length and re-stamp both checksums so
        // only the length-consistency check can catch it.
        corrupted[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        let prelude_crc = crc32fast::hash(&corrupted[0..8]);
        corrupted[8..12].copy_from_slice(&prelude_crc.to_be_bytes());
        let end = corrupted.len();
        let message_crc = crc32fast::hash(&corrupted[..end - 4]);
        corrupted[end - 4..].copy_from_slice(&message_crc.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&corrupted).is_err());
    }
}
