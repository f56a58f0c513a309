//! Link-Chat protocol core.
//! Host-driven: no I/O; the host owns the raw channel, files, timers and locks.

pub mod address;
pub mod chunk;
pub mod event;
pub mod peers;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use address::{MacAddr, ParseMacError};
pub use chunk::{ChunkError, Placement, Reassembly};
pub use event::Event;
pub use peers::{Observed, PeerEntry, PeerError, PeerId, PeerRegistry};
pub use protocol::{FileOffer, Message, MessageType, CHUNK_SIZE, ETHERTYPE};
pub use transfer::{
    AcceptMode, InboundTable, OutboundTable, OutboundTransfer, PendingRequest, ReceptionProgress,
    SendPhase, TransferError,
};
pub use wire::{
    decode_frame, decode_header, decode_message, encode_frame, DecodeError, EncodeError, Frame,
    Header,
};
