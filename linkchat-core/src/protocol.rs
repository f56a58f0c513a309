//! Link-Chat wire protocol: message types, payloads and constants.

use bytes::Bytes;

/// EtherType carried by every Link-Chat frame ("LC").
pub const ETHERTYPE: u16 = 0x4C43;

/// Destination + source + EtherType.
pub const HEADER_LEN: usize = 14;

/// Largest frame read from the link (standard Ethernet frame).
pub const MAX_FRAME_LEN: usize = 1518;

/// Largest type-specific payload (excludes header and type tag).
pub const MAX_PAYLOAD_LEN: usize = 1504;

/// File bytes carried by one FILE_DATA frame.
pub const CHUNK_SIZE: usize = 1400;

/// Size of the FILE_DATA sequence number.
pub const SEQ_LEN: usize = 4;

/// One-byte message type tag following the link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discovery = 0x01,
    Chat = 0x02,
    FileStart = 0x03,
    FileData = 0x04,
    FileEnd = 0x05,
    FileAck = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        Ok(match tag {
            0x01 => MessageType::Discovery,
            0x02 => MessageType::Chat,
            0x03 => MessageType::FileStart,
            0x04 => MessageType::FileData,
            0x05 => MessageType::FileEnd,
            0x06 => MessageType::FileAck,
            other => return Err(other),
        })
    }
}

/// FILE_START payload: what the sender proposes to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub is_folder: bool,
    pub size: u64,
    pub name: String,
}

/// All Link-Chat messages. Encoding is in the wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Presence beacon, normally sent to broadcast.
    Discovery,
    /// Chat text. Raw bytes; the receiver decides how to treat invalid UTF-8.
    Chat(Bytes),
    /// Transfer offer.
    FileStart(FileOffer),
    /// One chunk of file content at `seq * CHUNK_SIZE`.
    FileData { seq: u32, chunk: Bytes },
    /// Sender has emitted every chunk.
    FileEnd,
    /// Receiver accepted the offer.
    FileAck,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Discovery => MessageType::Discovery,
            Message::Chat(_) => MessageType::Chat,
            Message::FileStart(_) => MessageType::FileStart,
            Message::FileData { .. } => MessageType::FileData,
            Message::FileEnd => MessageType::FileEnd,
            Message::FileAck => MessageType::FileAck,
        }
    }

    pub fn chat(text: &str) -> Self {
        Message::Chat(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Chat text the receiver sends back once a transfer has been written out.
pub fn receipt_text(name: &str) -> String {
    format!("[system] '{name}' was received successfully.")
}
