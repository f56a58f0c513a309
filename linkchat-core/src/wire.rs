//! Framing: link header (dst, src, EtherType) + type tag + type-specific payload.
//! All multi-byte integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{MacAddr, ADDR_LEN};
use crate::protocol::{
    FileOffer, Message, MessageType, ETHERTYPE, HEADER_LEN, MAX_PAYLOAD_LEN, SEQ_LEN,
};

/// Folder flag byte + 8-byte size.
const OFFER_FIXED_LEN: usize = 1 + 8;
const FOLDER_FLAG: u8 = 0x01;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub message: Message,
}

/// Encode a message into a complete link frame ready for the raw channel.
pub fn encode_frame(dst: MacAddr, src: MacAddr, message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut payload = BytesMut::new();
    encode_payload(message, &mut payload)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + 1 + payload.len());
    out.put_slice(dst.as_bytes());
    out.put_slice(src.as_bytes());
    out.put_u16(ETHERTYPE);
    out.put_u8(message.kind() as u8);
    out.put_slice(&payload);
    Ok(out)
}

fn encode_payload(message: &Message, dst: &mut BytesMut) -> Result<(), EncodeError> {
    match message {
        Message::Discovery | Message::FileEnd | Message::FileAck => {}
        Message::Chat(text) => dst.put_slice(text),
        Message::FileStart(offer) => {
            if offer.name.as_bytes().contains(&0) {
                return Err(EncodeError::InvalidName);
            }
            dst.put_u8(if offer.is_folder { FOLDER_FLAG } else { 0 });
            dst.put_u64(offer.size);
            dst.put_slice(offer.name.as_bytes());
            dst.put_u8(0);
        }
        Message::FileData { seq, chunk } => {
            dst.put_u32(*seq);
            dst.put_slice(chunk);
        }
    }
    Ok(())
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("file name contains a NUL byte")]
    InvalidName,
}

/// Link header plus the message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub kind: MessageType,
}

/// Decode one frame as read from the raw channel.
///
/// Trailing bytes after a self-delimiting payload are ignored: the link pads short
/// frames up to the Ethernet minimum.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let (header, payload) = decode_header(bytes)?;
    Ok(Frame {
        dst: header.dst,
        src: header.src,
        message: decode_message(header.kind, payload)?,
    })
}

/// Split a frame into its header and the undecoded type-specific payload.
pub fn decode_header(bytes: &[u8]) -> Result<(Header, &[u8]), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let mut buf = bytes;
    let dst = read_addr(&mut buf);
    let src = read_addr(&mut buf);
    let protocol = buf.get_u16();
    if protocol != ETHERTYPE {
        return Err(DecodeError::WrongProtocol(protocol));
    }
    if !buf.has_remaining() {
        return Err(DecodeError::Truncated);
    }
    let kind = MessageType::try_from(buf.get_u8()).map_err(DecodeError::UnknownType)?;
    Ok((Header { dst, src, kind }, buf))
}

/// Decode the payload of a message of type `kind`.
pub fn decode_message(kind: MessageType, payload: &[u8]) -> Result<Message, DecodeError> {
    decode_payload(kind, Bytes::copy_from_slice(payload))
}

fn read_addr(buf: &mut &[u8]) -> MacAddr {
    let mut addr = [0u8; ADDR_LEN];
    buf.copy_to_slice(&mut addr);
    MacAddr::new(addr)
}

fn decode_payload(kind: MessageType, mut payload: Bytes) -> Result<Message, DecodeError> {
    Ok(match kind {
        MessageType::Discovery => Message::Discovery,
        MessageType::FileEnd => Message::FileEnd,
        MessageType::FileAck => Message::FileAck,
        MessageType::Chat => Message::Chat(payload),
        MessageType::FileStart => {
            if payload.len() < OFFER_FIXED_LEN {
                return Err(DecodeError::Malformed("FILE_START size field truncated"));
            }
            let is_folder = payload.get_u8() == FOLDER_FLAG;
            let size = payload.get_u64();
            let end = payload
                .iter()
                .position(|&b| b == 0)
                .ok_or(DecodeError::Malformed("FILE_START name has no terminator"))?;
            let name = std::str::from_utf8(&payload[..end])
                .map_err(|_| DecodeError::Malformed("FILE_START name is not UTF-8"))?
                .to_string();
            Message::FileStart(FileOffer {
                is_folder,
                size,
                name,
            })
        }
        MessageType::FileData => {
            if payload.len() < SEQ_LEN {
                return Err(DecodeError::Malformed("FILE_DATA sequence truncated"));
            }
            let seq = payload.get_u32();
            Message::FileData {
                seq,
                chunk: payload,
            }
        }
    })
}

/// Error decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,
    /// Another protocol's traffic; callers drop it silently.
    #[error("foreign protocol 0x{0:04x}")]
    WrongProtocol(u16),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x0a]);
    const B: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x0b]);

    fn roundtrip(message: Message) {
        let bytes = encode_frame(B, A, &message).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!((frame.dst, frame.src), (B, A));
        assert_eq!(frame.message, message);
    }

    #[test]
    fn roundtrip_every_kind() {
        roundtrip(Message::Discovery);
        roundtrip(Message::chat("hola, ¿qué tal?"));
        roundtrip(Message::FileStart(FileOffer {
            is_folder: true,
            size: 5000,
            name: "report.pdf".into(),
        }));
        roundtrip(Message::FileData {
            seq: 7,
            chunk: Bytes::from(vec![0xab; 1400]),
        });
        roundtrip(Message::FileEnd);
        roundtrip(Message::FileAck);
    }

    #[test]
    fn header_layout() {
        let bytes = encode_frame(MacAddr::BROADCAST, A, &Message::Discovery).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        assert_eq!(&bytes[..6], &[0xff; 6]);
        assert_eq!(&bytes[6..12], A.as_bytes());
        assert_eq!(&bytes[12..14], &[0x4c, 0x43]);
        assert_eq!(bytes[14], 0x01);
    }

    #[test]
    fn file_start_layout() {
        let offer = Message::FileStart(FileOffer {
            is_folder: false,
            size: 0x0102,
            name: "a.txt".into(),
        });
        let bytes = encode_frame(B, A, &offer).unwrap();
        let payload = &bytes[HEADER_LEN + 1..];
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..9], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&payload[9..14], b"a.txt");
        assert_eq!(payload[14], 0);
    }

    #[test]
    fn short_frame_is_truncated() {
        assert_eq!(decode_frame(&[0u8; 13]), Err(DecodeError::Truncated));
        let mut header = encode_frame(B, A, &Message::Discovery).unwrap();
        header.truncate(HEADER_LEN);
        assert_eq!(decode_frame(&header), Err(DecodeError::Truncated));
    }

    #[test]
    fn foreign_protocol_is_rejected() {
        let mut bytes = encode_frame(B, A, &Message::Discovery).unwrap();
        bytes[12] = 0x08;
        bytes[13] = 0x00;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::WrongProtocol(0x0800)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = encode_frame(B, A, &Message::Discovery).unwrap();
        bytes[14] = 0x42;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::UnknownType(0x42)));
    }

    #[test]
    fn padded_frames_still_decode() {
        let mut bytes = encode_frame(
            B,
            A,
            &Message::FileStart(FileOffer {
                is_folder: false,
                size: 3,
                name: "x".into(),
            }),
        )
        .unwrap();
        bytes.resize(60, 0);
        match decode_frame(&bytes).unwrap().message {
            Message::FileStart(offer) => assert_eq!(offer.name, "x"),
            other => panic!("expected FileStart, got {other:?}"),
        }
    }

    #[test]
    fn file_start_without_terminator_is_malformed() {
        let mut bytes = encode_frame(
            B,
            A,
            &Message::FileStart(FileOffer {
                is_folder: false,
                size: 3,
                name: "x".into(),
            }),
        )
        .unwrap();
        bytes.pop();
        assert!(matches!(
            decode_frame(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn file_start_with_short_size_is_malformed() {
        let mut bytes = encode_frame(B, A, &Message::FileEnd).unwrap();
        bytes[14] = MessageType::FileStart as u8;
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn file_data_without_sequence_is_malformed() {
        let mut bytes = encode_frame(B, A, &Message::FileEnd).unwrap();
        bytes[14] = MessageType::FileData as u8;
        bytes.extend_from_slice(&[0, 1]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let text = "x".repeat(MAX_PAYLOAD_LEN + 1);
        assert!(matches!(
            encode_frame(B, A, &Message::chat(&text)),
            Err(EncodeError::PayloadTooLarge { .. })
        ));
        assert!(encode_frame(B, A, &Message::chat(&text[1..])).is_ok());
    }

    #[test]
    fn nul_in_name_is_refused() {
        let offer = Message::FileStart(FileOffer {
            is_folder: false,
            size: 1,
            name: "a\0b".into(),
        });
        assert!(matches!(
            encode_frame(B, A, &offer),
            Err(EncodeError::InvalidName)
        ));
    }
}
