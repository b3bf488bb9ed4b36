//! Binary framing for the fixed kernel wire sub-protocol.
//!
//! Frame layout, all words u64 little-endian:
//!
//! ```text
//! [offset_count][offset_0 .. offset_{n-1}][channel][header][parent_header][metadata][content][buf_0 ..]
//! ```
//!
//! `offset_0` points at the channel segment (`8 * (offset_count + 1)`), each
//! following offset is the end of the previous segment, and the final offset
//! equals the total frame length. Text frames are UTF-8-encoded and decoded
//! through the identical path.

use thiserror::Error;

use crate::{Channel, MessageHeader, WireMessage};

/// Segments before the buffers: channel, header, parent_header, metadata,
/// content. The offset table always carries at least one entry per segment
/// plus the leading channel-start entry.
const MIN_OFFSETS: usize = 6;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame truncated at {0}")]
    Truncated(&'static str),

    #[error("invalid offset table")]
    BadOffsets,

    #[error("unknown channel tag: {0}")]
    UnknownChannel(String),

    #[error("invalid utf-8 in frame: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid json segment: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a message into a binary frame.
pub fn serialize(msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let header = serde_json::to_vec(&msg.header)?;
    let parent_header = serde_json::to_vec(&msg.parent_header)?;
    let metadata = serde_json::to_vec(&msg.metadata)?;
    let content = serde_json::to_vec(&msg.content)?;
    let channel = msg.channel.as_str().as_bytes();

    let mut segments: Vec<&[u8]> = vec![&header, &parent_header, &metadata, &content];
    segments.extend(msg.buffers.iter().map(|b| b.as_slice()));

    let offset_count = segments.len() + 2;
    let mut offsets: Vec<u64> = Vec::with_capacity(offset_count);
    let mut cursor = 8 * (offset_count as u64 + 1);
    offsets.push(cursor);
    cursor += channel.len() as u64;
    offsets.push(cursor);
    for segment in &segments {
        cursor += segment.len() as u64;
        offsets.push(cursor);
    }

    let mut frame = Vec::with_capacity(cursor as usize);
    frame.extend_from_slice(&(offset_count as u64).to_le_bytes());
    for offset in &offsets {
        frame.extend_from_slice(&offset.to_le_bytes());
    }
    frame.extend_from_slice(channel);
    for segment in segments {
        frame.extend_from_slice(segment);
    }
    Ok(frame)
}

/// Deserialize a binary frame into a structured message.
pub fn deserialize(data: &[u8]) -> Result<WireMessage, CodecError> {
    let offset_count = read_word(data, 0, "offset count")? as usize;
    if offset_count < MIN_OFFSETS {
        return Err(CodecError::BadOffsets);
    }

    let mut offsets = Vec::with_capacity(offset_count);
    for i in 0..offset_count {
        offsets.push(read_word(data, 8 * (1 + i), "offset table")? as usize);
    }

    let table_end = 8 * (1 + offset_count);
    if offsets[0] < table_end
        || offsets.windows(2).any(|w| w[1] < w[0])
        || *offsets.last().unwrap_or(&0) != data.len()
    {
        return Err(CodecError::BadOffsets);
    }

    let channel_raw = std::str::from_utf8(&data[offsets[0]..offsets[1]])?;
    let channel = Channel::from_wire(channel_raw)
        .ok_or_else(|| CodecError::UnknownChannel(channel_raw.to_string()))?;

    let segment = |i: usize| &data[offsets[i]..offsets[i + 1]];
    let header: MessageHeader = serde_json::from_slice(segment(1))?;
    let parent_header = serde_json::from_slice(segment(2))?;
    let metadata = serde_json::from_slice(segment(3))?;
    let content = serde_json::from_slice(segment(4))?;
    let buffers = (5..offset_count - 1).map(|i| segment(i).to_vec()).collect();

    Ok(WireMessage {
        channel,
        header,
        parent_header,
        metadata,
        content,
        buffers,
    })
}

/// Deserialize a text frame: UTF-8-encode, then the binary path.
pub fn deserialize_text(text: &str) -> Result<WireMessage, CodecError> {
    deserialize(text.as_bytes())
}

/// Decode a transport frame of either flavor.
pub fn decode(frame: &crate::Frame) -> Result<WireMessage, CodecError> {
    match frame {
        crate::Frame::Binary(data) => deserialize(data),
        crate::Frame::Text(text) => deserialize_text(text),
    }
}

fn read_word(data: &[u8], pos: usize, what: &'static str) -> Result<u64, CodecError> {
    let bytes = data
        .get(pos..pos + 8)
        .ok_or(CodecError::Truncated(what))?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WireMessage {
        WireMessage::request(
            Channel::Shell,
            "execute_request",
            "client-1",
            json!({"code": "print(1)", "silent": false}),
        )
    }

    #[test]
    fn roundtrip_without_buffers() {
        let msg = sample();
        let frame = serialize(&msg).unwrap();
        let parsed = deserialize(&frame).unwrap();

        assert_eq!(parsed.channel, Channel::Shell);
        assert_eq!(parsed.header, msg.header);
        assert_eq!(parsed.content, msg.content);
        assert!(parsed.buffers.is_empty());
    }

    #[test]
    fn roundtrip_with_buffers() {
        let mut msg = sample();
        msg.buffers = vec![vec![1, 2, 3], vec![0; 16], vec![0xff]];

        let frame = serialize(&msg).unwrap();
        let parsed = deserialize(&frame).unwrap();
        assert_eq!(parsed.buffers, msg.buffers);
    }

    #[test]
    fn layout_words() {
        let msg = sample();
        let frame = serialize(&msg).unwrap();

        // channel + 4 json segments, no buffers: 6 offsets
        let count = u64::from_le_bytes(frame[0..8].try_into().unwrap());
        assert_eq!(count, 6);

        let first = u64::from_le_bytes(frame[8..16].try_into().unwrap()) as usize;
        assert_eq!(first, 8 * 7);
        assert_eq!(&frame[first..first + 5], b"shell");

        let last = u64::from_le_bytes(frame[48..56].try_into().unwrap()) as usize;
        assert_eq!(last, frame.len());
    }

    #[test]
    fn text_frame_same_path() {
        let msg = sample();
        let frame = serialize(&msg).unwrap();
        // All segments here are ASCII, so the whole frame is valid UTF-8.
        let text = String::from_utf8(frame).unwrap();

        let parsed = deserialize_text(&text).unwrap();
        assert_eq!(parsed.header.msg_type, "execute_request");
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = serialize(&sample()).unwrap();
        assert!(matches!(
            deserialize(&frame[..10]),
            Err(CodecError::Truncated(_) | CodecError::BadOffsets)
        ));
        assert!(deserialize(&[]).is_err());
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let msg = sample();
        let mut frame = serialize(&msg).unwrap();
        let first = 8 * 7;
        frame[first..first + 5].copy_from_slice(b"shout");
        assert!(matches!(
            deserialize(&frame),
            Err(CodecError::UnknownChannel(_))
        ));
    }

    #[test]
    fn tampered_offsets_are_an_error() {
        let msg = sample();
        let mut frame = serialize(&msg).unwrap();
        // Final offset no longer matches the frame length.
        frame.push(0);
        assert!(matches!(deserialize(&frame), Err(CodecError::BadOffsets)));
    }
}
