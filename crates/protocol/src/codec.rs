//! Byte framing for transports that cross a process boundary.
//!
//! Every message is one frame, little endian throughout:
//!
//! | body_len u32 | kind u8 | frame_id u64 | tag u32 | body |
//!
//! `body_len` counts everything after the length prefix.

use std::fmt;
use std::io::{self, Read, Write};

use model::{TILE_PIXELS, TileIndex};
use tiles::{Rgba8, TileFormat};

use crate::{Message, MessageKind, MessageTag, Rank, TransportError};

const KIND_HELLO: u8 = 1;
const KIND_TILE_HEADER: u8 = 2;
const KIND_TILE_PAYLOAD: u8 = 3;
const KIND_FRAME_JOIN: u8 = 4;
const KIND_TILE_REQUEST: u8 = 5;
const KIND_TILE_GRANT: u8 = 6;

const GRANT_EXHAUSTED: i32 = -1;

pub const LENGTH_PREFIX_BYTES: usize = 4;
pub const FRAME_HEADER_BYTES: usize = 1 + 8 + 4;
pub const TILE_PAYLOAD_BODY_BYTES: usize = 1 + TILE_PIXELS * size_of::<Rgba8>();
/// Largest `body_len` a reader accepts.
pub const MAX_FRAME_BYTES: usize = FRAME_HEADER_BYTES + TILE_PAYLOAD_BODY_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    FrameTooLarge { len: usize },
    FrameTooShort { len: usize },
    UnknownKind(u8),
    BodyLength {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    UnknownFormat(u8),
    InvalidGrant(i32),
}

impl fmt::Display for WireError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::FrameTooLarge { len } => {
                write!(formatter, "frame of {len} bytes exceeds {MAX_FRAME_BYTES}")
            }
            WireError::FrameTooShort { len } => {
                write!(formatter, "frame of {len} bytes is shorter than its header")
            }
            WireError::UnknownKind(kind) => write!(formatter, "unknown message kind {kind}"),
            WireError::BodyLength {
                kind,
                expected,
                actual,
            } => write!(
                formatter,
                "{kind:?} body is {actual} bytes, expected {expected}"
            ),
            WireError::UnknownFormat(tag) => write!(formatter, "unknown tile format tag {tag}"),
            WireError::InvalidGrant(value) => write!(formatter, "invalid tile grant {value}"),
        }
    }
}

impl std::error::Error for WireError {}

/// A decoded frame. The sender is implied by the link it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub frame_id: u64,
    pub tag: MessageTag,
    pub message: Message,
}

/// Appends one length-prefixed frame to `out`.
pub fn encode_message(frame_id: u64, tag: MessageTag, message: &Message, out: &mut Vec<u8>) {
    let start = out.len();
    out.extend_from_slice(&[0; LENGTH_PREFIX_BYTES]);
    out.push(kind_byte(message.kind()));
    out.extend_from_slice(&frame_id.to_le_bytes());
    out.extend_from_slice(&tag.0.to_le_bytes());
    match message {
        Message::Hello { rank, size } => {
            out.extend_from_slice(&rank.0.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
        }
        Message::TileHeader { bounds } => {
            for bound in bounds {
                out.extend_from_slice(&bound.to_le_bytes());
            }
        }
        Message::TilePayload { format, pixels } => {
            out.push(format.wire_tag());
            out.extend_from_slice(bytemuck::cast_slice(&pixels[..]));
        }
        Message::FrameJoin { pullers } => out.extend_from_slice(&pullers.to_le_bytes()),
        Message::TileRequest => {}
        Message::TileGrant { index } => {
            let raw = match index {
                Some(index) => {
                    i32::try_from(index.0).expect("tile layouts keep indices below i32::MAX")
                }
                None => GRANT_EXHAUSTED,
            };
            out.extend_from_slice(&raw.to_le_bytes());
        }
    }
    let body_len = (out.len() - start - LENGTH_PREFIX_BYTES) as u32;
    out[start..start + LENGTH_PREFIX_BYTES].copy_from_slice(&body_len.to_le_bytes());
}

/// Decodes one frame body, i.e. everything after the length prefix.
pub fn decode_message(frame: &[u8]) -> Result<WireMessage, WireError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge { len: frame.len() });
    }
    if frame.len() < FRAME_HEADER_BYTES {
        return Err(WireError::FrameTooShort { len: frame.len() });
    }
    let kind = kind_from_byte(frame[0])?;
    let frame_id = u64::from_le_bytes(array_at(frame, 1));
    let tag = MessageTag(u32::from_le_bytes(array_at(frame, 9)));
    let body = &frame[FRAME_HEADER_BYTES..];

    let message = match kind {
        MessageKind::Hello => {
            expect_body_len(kind, body, 8)?;
            Message::Hello {
                rank: Rank(u32::from_le_bytes(array_at(body, 0))),
                size: u32::from_le_bytes(array_at(body, 4)),
            }
        }
        MessageKind::TileHeader => {
            expect_body_len(kind, body, 16)?;
            let mut bounds = [0i32; 4];
            for (slot, bound) in bounds.iter_mut().enumerate() {
                *bound = i32::from_le_bytes(array_at(body, slot * 4));
            }
            Message::TileHeader { bounds }
        }
        MessageKind::TilePayload => {
            expect_body_len(kind, body, TILE_PAYLOAD_BODY_BYTES)?;
            let format = TileFormat::from_wire_tag(body[0]).ok_or(WireError::UnknownFormat(body[0]))?;
            let pixels: &[Rgba8] = bytemuck::cast_slice(&body[1..]);
            Message::TilePayload {
                format,
                pixels: pixels.into(),
            }
        }
        MessageKind::FrameJoin => {
            expect_body_len(kind, body, 4)?;
            Message::FrameJoin {
                pullers: u32::from_le_bytes(array_at(body, 0)),
            }
        }
        MessageKind::TileRequest => {
            expect_body_len(kind, body, 0)?;
            Message::TileRequest
        }
        MessageKind::TileGrant => {
            expect_body_len(kind, body, 4)?;
            let raw = i32::from_le_bytes(array_at(body, 0));
            let index = match raw {
                GRANT_EXHAUSTED => None,
                raw if raw >= 0 => Some(TileIndex(raw as u32)),
                raw => return Err(WireError::InvalidGrant(raw)),
            };
            Message::TileGrant { index }
        }
    };
    Ok(WireMessage {
        frame_id,
        tag,
        message,
    })
}

pub fn write_message<W: Write>(
    writer: &mut W,
    frame_id: u64,
    tag: MessageTag,
    message: &Message,
) -> io::Result<()> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + FRAME_HEADER_BYTES + 16);
    encode_message(frame_id, tag, message, &mut frame);
    writer.write_all(&frame)
}

/// Reads one frame. Returns `Ok(None)` when the stream ends cleanly on a
/// frame boundary.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<WireMessage>, TransportError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    if !read_exact_or_eof(reader, &mut prefix)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge { len }.into());
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(Some(decode_message(&frame)?))
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame length prefix",
                ));
            }
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(true)
}

fn expect_body_len(kind: MessageKind, body: &[u8], expected: usize) -> Result<(), WireError> {
    if body.len() == expected {
        Ok(())
    } else {
        Err(WireError::BodyLength {
            kind,
            expected,
            actual: body.len(),
        })
    }
}

fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(&bytes[offset..offset + N]);
    array
}

fn kind_byte(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::Hello => KIND_HELLO,
        MessageKind::TileHeader => KIND_TILE_HEADER,
        MessageKind::TilePayload => KIND_TILE_PAYLOAD,
        MessageKind::FrameJoin => KIND_FRAME_JOIN,
        MessageKind::TileRequest => KIND_TILE_REQUEST,
        MessageKind::TileGrant => KIND_TILE_GRANT,
    }
}

fn kind_from_byte(byte: u8) -> Result<MessageKind, WireError> {
    match byte {
        KIND_HELLO => Ok(MessageKind::Hello),
        KIND_TILE_HEADER => Ok(MessageKind::TileHeader),
        KIND_TILE_PAYLOAD => Ok(MessageKind::TilePayload),
        KIND_FRAME_JOIN => Ok(MessageKind::FrameJoin),
        KIND_TILE_REQUEST => Ok(MessageKind::TileRequest),
        KIND_TILE_GRANT => Ok(MessageKind::TileGrant),
        other => Err(WireError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded(frame_id: u64, tag: MessageTag, message: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        encode_message(frame_id, tag, message, &mut out);
        out
    }

    #[test]
    fn header_frame_layout_is_little_endian() {
        let bytes = encoded(
            3,
            MessageTag(5),
            &Message::TileHeader {
                bounds: [128, 64, 130, 70],
            },
        );
        assert_eq!(bytes.len(), LENGTH_PREFIX_BYTES + FRAME_HEADER_BYTES + 16);
        assert_eq!(&bytes[0..4], &29u32.to_le_bytes());
        assert_eq!(bytes[4], KIND_TILE_HEADER);
        assert_eq!(&bytes[5..13], &3u64.to_le_bytes());
        assert_eq!(&bytes[13..17], &5u32.to_le_bytes());
        assert_eq!(&bytes[17..21], &128i32.to_le_bytes());
        assert_eq!(&bytes[29..33], &70i32.to_le_bytes());
    }

    #[test]
    fn payload_survives_a_stream_byte_for_byte() {
        let pixels: Box<[Rgba8]> = (0..TILE_PIXELS)
            .map(|i| [i as u8, (i >> 8) as u8, 7, 255])
            .collect();
        let message = Message::TilePayload {
            format: TileFormat::Rgba8,
            pixels,
        };
        let bytes = encoded(9, MessageTag(41), &message);
        assert_eq!(bytes.len() - LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES);

        let mut stream = Cursor::new(bytes);
        let decoded = read_message(&mut stream)
            .expect("read payload")
            .expect("one frame");
        assert_eq!(decoded.frame_id, 9);
        assert_eq!(decoded.tag, MessageTag(41));
        assert_eq!(decoded.message, message);
        assert_eq!(read_message(&mut stream).expect("clean end"), None);
    }

    #[test]
    fn grant_sentinel_is_minus_one() {
        let bytes = encoded(1, MessageTag::CONTROL, &Message::TileGrant { index: None });
        assert_eq!(&bytes[17..21], &(-1i32).to_le_bytes());
        let decoded = decode_message(&bytes[LENGTH_PREFIX_BYTES..]).expect("decode");
        assert_eq!(decoded.message, Message::TileGrant { index: None });

        let mut corrupt = bytes.clone();
        corrupt[17..21].copy_from_slice(&(-7i32).to_le_bytes());
        assert_eq!(
            decode_message(&corrupt[LENGTH_PREFIX_BYTES..]),
            Err(WireError::InvalidGrant(-7))
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        let mut bytes = encoded(1, MessageTag(0), &Message::FrameJoin { pullers: 4 });
        bytes[4] = 0xee;
        assert_eq!(
            decode_message(&bytes[LENGTH_PREFIX_BYTES..]),
            Err(WireError::UnknownKind(0xee))
        );

        let request = encoded(1, MessageTag::CONTROL, &Message::TileRequest);
        let mut padded = request[LENGTH_PREFIX_BYTES..].to_vec();
        padded.push(0);
        assert_eq!(
            decode_message(&padded),
            Err(WireError::BodyLength {
                kind: MessageKind::TileRequest,
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(
            decode_message(&[KIND_TILE_REQUEST, 0, 0]),
            Err(WireError::FrameTooShort { len: 3 })
        );
    }

    #[test]
    fn rejects_oversized_length_prefix_and_truncation() {
        let mut stream = Cursor::new(((MAX_FRAME_BYTES + 1) as u32).to_le_bytes().to_vec());
        assert_eq!(
            read_message(&mut stream),
            Err(TransportError::Wire(WireError::FrameTooLarge {
                len: MAX_FRAME_BYTES + 1,
            }))
        );

        let bytes = encoded(1, MessageTag(2), &Message::TileHeader { bounds: [0; 4] });
        let mut truncated = Cursor::new(bytes[..bytes.len() - 3].to_vec());
        assert!(matches!(
            read_message(&mut truncated),
            Err(TransportError::Io {
                kind: io::ErrorKind::UnexpectedEof,
                ..
            })
        ));
    }

    #[test]
    fn unknown_payload_format_is_rejected() {
        let message = Message::TilePayload {
            format: TileFormat::Rgba8,
            pixels: vec![[0; 4]; TILE_PIXELS].into_boxed_slice(),
        };
        let mut bytes = encoded(1, MessageTag(0), &message);
        bytes[LENGTH_PREFIX_BYTES + FRAME_HEADER_BYTES] = 9;
        assert_eq!(
            decode_message(&bytes[LENGTH_PREFIX_BYTES..]),
            Err(WireError::UnknownFormat(9))
        );
    }
}
