//! Events handed from the engine to the presentation layer, in emission order.

use std::path::PathBuf;

use crate::address::MacAddr;
use crate::peers::PeerId;

/// Placeholder shown for chat payloads that are not valid UTF-8.
pub const MALFORMED_TEXT: &str = "[malformed text]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerDiscovered {
        id: PeerId,
        address: MacAddr,
    },
    ChatMessage {
        from: MacAddr,
        private: bool,
        text: String,
    },
    /// Interactive mode: waiting for `accept_transfer(from)`.
    FileOffered {
        from: MacAddr,
        name: String,
        size: u64,
        is_folder: bool,
    },
    /// Reception accepted (receiver) or acknowledged (sender).
    TransferStarted {
        peer: MacAddr,
        name: String,
    },
    FileReceived {
        from: MacAddr,
        name: String,
        path: PathBuf,
    },
    FolderReceived {
        from: MacAddr,
        name: String,
        path: PathBuf,
    },
    /// Every chunk and the FILE_END frame went out.
    FileSent {
        to: MacAddr,
        name: String,
    },
    Error(String),
    /// The receive path failed; the engine no longer hears the link.
    LinkDown(String),
}

impl Event {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Event::Error(err.to_string())
    }
}
