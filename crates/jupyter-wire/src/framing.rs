//! Binary frames for messages that carry buffers.
//!
//! Layout, all integers big-endian `u32`:
//!
//! ```text
//! nbufs | offset[0] .. offset[nbufs-1] | message JSON | buffer 1 | ... | buffer n
//! ```
//!
//! `nbufs` counts the JSON part plus the buffers, and each offset is measured
//! from the start of the frame. The JSON part never contains `buffers`.

use bytes::Bytes;

use crate::message::{WireError, WireMessage};

const WORD: usize = 4;

/// Encode a message and its buffers into a single binary frame.
pub fn encode_binary(message: &WireMessage) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(message)?;
    let nbufs = 1 + message.buffers.len();
    let header_len = WORD * (nbufs + 1);

    let mut offsets = Vec::with_capacity(nbufs);
    let mut cursor = header_len;
    offsets.push(cursor);
    cursor += json.len();
    for buffer in &message.buffers {
        offsets.push(cursor);
        cursor += buffer.len();
    }

    let mut frame = Vec::with_capacity(cursor);
    frame.extend_from_slice(&to_word(nbufs)?);
    for offset in offsets {
        frame.extend_from_slice(&to_word(offset)?);
    }
    frame.extend_from_slice(&json);
    for buffer in &message.buffers {
        frame.extend_from_slice(buffer);
    }
    Ok(frame)
}

/// Decode a binary frame into a message with its buffers attached.
pub fn decode_binary(frame: &[u8]) -> Result<WireMessage, WireError> {
    let nbufs = read_word(frame, 0)?;
    if nbufs == 0 {
        return Err(WireError::Frame("frame declares no parts".to_string()));
    }

    let header_len = nbufs
        .checked_add(1)
        .and_then(|words| words.checked_mul(WORD))
        .ok_or_else(|| WireError::Frame(format!("part count {} overflows", nbufs)))?;
    if header_len > frame.len() {
        return Err(WireError::Frame(format!(
            "offset table needs {} bytes, frame has {}",
            header_len,
            frame.len()
        )));
    }

    let offsets = (0..nbufs)
        .map(|i| read_word(frame, WORD * (i + 1)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut parts = Vec::with_capacity(nbufs);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(frame.len());
        if start < header_len || start > end || end > frame.len() {
            return Err(WireError::Frame(format!(
                "part {} spans {}..{} outside {}..{}",
                i,
                start,
                end,
                header_len,
                frame.len()
            )));
        }
        parts.push(&frame[start..end]);
    }

    let mut message = WireMessage::from_json_slice(parts[0])?;
    message.buffers = parts[1..]
        .iter()
        .map(|part| Bytes::copy_from_slice(part))
        .collect();
    Ok(message)
}

fn read_word(frame: &[u8], at: usize) -> Result<usize, WireError> {
    let bytes = frame
        .get(at..at + WORD)
        .ok_or_else(|| WireError::Frame(format!("truncated at byte {}", at)))?;
    let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(word as usize)
}

fn to_word(value: usize) -> Result<[u8; WORD], WireError> {
    u32::try_from(value)
        .map(u32::to_be_bytes)
        .map_err(|_| WireError::Frame(format!("{} does not fit in a frame offset", value)))
}
