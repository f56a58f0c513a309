//! Transfer state: outbound transfers keyed by destination, inbound offers and receptions
//! keyed by source. Pure tables; the host owns locking, files and timers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::address::MacAddr;
use crate::chunk::{ChunkError, Placement, Reassembly};
use crate::wire::EncodeError;

/// How inbound offers are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// Offers surface as a prompt; accepting sends FILE_ACK.
    #[default]
    Interactive,
    /// Offers are accepted on arrival and no FILE_ACK is sent. Senders wait a fixed delay instead.
    Unattended,
}

/// Sender-side phase. Completion removes the entry, so DONE has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    AwaitingAck,
    Sending,
}

/// One outbound transfer.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub phase: SendPhase,
    pub offset: u64,
    pub seq: u32,
    /// Packaging artifact to delete once the transfer ends.
    pub transient: bool,
}

impl OutboundTransfer {
    pub fn new(path: PathBuf, name: String, size: u64, transient: bool) -> Self {
        Self {
            path,
            name,
            size,
            phase: SendPhase::AwaitingAck,
            offset: 0,
            seq: 0,
            transient,
        }
    }
}

/// At most one outbound transfer per destination.
#[derive(Debug, Default)]
pub struct OutboundTable {
    transfers: HashMap<MacAddr, OutboundTransfer>,
}

impl OutboundTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, dst: MacAddr, transfer: OutboundTransfer) -> Result<(), TransferError> {
        if self.transfers.contains_key(&dst) {
            return Err(TransferError::TransferInProgress(dst));
        }
        self.transfers.insert(dst, transfer);
        Ok(())
    }

    /// FILE_ACK from `src`. Returns true if it moved a transfer from AWAITING_ACK to SENDING.
    pub fn acknowledge(&mut self, src: &MacAddr) -> bool {
        match self.transfers.get_mut(src) {
            Some(t) if t.phase == SendPhase::AwaitingAck => {
                t.phase = SendPhase::Sending;
                true
            }
            _ => false,
        }
    }

    /// Enter SENDING without an acknowledgement (unattended peers never ACK).
    pub fn start_sending(&mut self, dst: &MacAddr) -> bool {
        match self.transfers.get_mut(dst) {
            Some(t) => {
                t.phase = SendPhase::Sending;
                true
            }
            None => false,
        }
    }

    pub fn phase(&self, dst: &MacAddr) -> Option<SendPhase> {
        self.transfers.get(dst).map(|t| t.phase)
    }

    /// Record one emitted chunk of `len` bytes.
    pub fn advance(&mut self, dst: &MacAddr, len: usize) {
        if let Some(t) = self.transfers.get_mut(dst) {
            t.offset += len as u64;
            t.seq = t.seq.wrapping_add(1);
        }
    }

    pub fn get(&self, dst: &MacAddr) -> Option<&OutboundTransfer> {
        self.transfers.get(dst)
    }

    pub fn finish(&mut self, dst: &MacAddr) -> Option<OutboundTransfer> {
        self.transfers.remove(dst)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// An offer received but not yet accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
    /// Where the payload will be written.
    pub dest: PathBuf,
}

/// An accepted offer. `H` is the host's seek-capable write target.
#[derive(Debug)]
pub struct ActiveReception<H> {
    pub request: PendingRequest,
    pub reassembly: Reassembly,
    pub handle: H,
}

/// Progress of one active reception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionProgress {
    pub from: MacAddr,
    pub name: String,
    pub received: u64,
    pub total: u64,
}

/// Offers and receptions. At most one request per source, whether pending, being
/// accepted or active; a second offer while one is outstanding is rejected, never
/// overwritten. No two outstanding requests share a destination path.
#[derive(Debug)]
pub struct InboundTable<H> {
    pending: HashMap<MacAddr, PendingRequest>,
    /// Accepted, destination not yet open.
    accepting: HashMap<MacAddr, PendingRequest>,
    active: HashMap<MacAddr, ActiveReception<H>>,
}

impl<H> Default for InboundTable<H> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            accepting: HashMap::new(),
            active: HashMap::new(),
        }
    }
}

impl<H> InboundTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an offer. If another outstanding request already writes to `request.dest`,
    /// the destination is renumbered (`name (1).ext`, ...). Returns the path assigned.
    pub fn offer(&mut self, src: MacAddr, mut request: PendingRequest) -> Result<PathBuf, TransferError> {
        if self.holds(&src) {
            return Err(TransferError::DuplicateOffer(src));
        }
        request.dest = self.unclaimed(request.dest);
        let dest = request.dest.clone();
        self.pending.insert(src, request);
        Ok(dest)
    }

    fn holds(&self, src: &MacAddr) -> bool {
        self.pending.contains_key(src)
            || self.accepting.contains_key(src)
            || self.active.contains_key(src)
    }

    fn claimed(&self, dest: &Path) -> bool {
        self.pending
            .values()
            .chain(self.accepting.values())
            .chain(self.active.values().map(|a| &a.request))
            .any(|r| r.dest == dest)
    }

    fn unclaimed(&self, dest: PathBuf) -> PathBuf {
        if !self.claimed(&dest) {
            return dest;
        }
        let mut n = 1;
        loop {
            let candidate = numbered(&dest, n);
            if !self.claimed(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn pending(&self, src: &MacAddr) -> Option<&PendingRequest> {
        self.pending.get(src)
    }

    pub fn take_pending(&mut self, src: &MacAddr) -> Result<PendingRequest, TransferError> {
        self.pending
            .remove(src)
            .ok_or(TransferError::NoPendingRequest(*src))
    }

    /// Accept the pending offer from `src`. The source stays reserved, so further offers
    /// are still rejected, until [`activate`](Self::activate) or
    /// [`cancel_accept`](Self::cancel_accept).
    pub fn begin_accept(&mut self, src: &MacAddr) -> Result<PendingRequest, TransferError> {
        let request = self.take_pending(src)?;
        self.accepting.insert(*src, request.clone());
        Ok(request)
    }

    /// The destination could not be opened; release the source.
    pub fn cancel_accept(&mut self, src: &MacAddr) -> Option<PendingRequest> {
        self.accepting.remove(src)
    }

    /// Start receiving the accepted request from `src` into `handle`.
    pub fn activate(&mut self, src: MacAddr, handle: H) -> Result<(), TransferError> {
        let request = self
            .accepting
            .remove(&src)
            .ok_or(TransferError::NoPendingRequest(src))?;
        let reassembly = Reassembly::new(request.size);
        self.active.insert(
            src,
            ActiveReception {
                request,
                reassembly,
                handle,
            },
        );
        Ok(())
    }

    pub fn is_active(&self, src: &MacAddr) -> bool {
        self.active.contains_key(src)
    }

    /// Place chunk `seq` from `src`; returns the write target and where to write.
    pub fn chunk(&mut self, src: &MacAddr, seq: u32, len: usize) -> Result<(H, Placement), TransferError>
    where
        H: Clone,
    {
        let active = self
            .active
            .get_mut(src)
            .ok_or(TransferError::NoActiveReception(*src))?;
        let placement = active.reassembly.place(seq, len)?;
        Ok((active.handle.clone(), placement))
    }

    /// FILE_END: remove and return the reception.
    pub fn complete(&mut self, src: &MacAddr) -> Result<ActiveReception<H>, TransferError> {
        self.active
            .remove(src)
            .ok_or(TransferError::NoActiveReception(*src))
    }

    /// Drop a reception after a transfer-level failure.
    pub fn abort(&mut self, src: &MacAddr) -> Option<ActiveReception<H>> {
        self.active.remove(src)
    }

    pub fn progress(&self) -> Vec<ReceptionProgress> {
        let mut out: Vec<ReceptionProgress> = self
            .active
            .iter()
            .map(|(from, a)| ReceptionProgress {
                from: *from,
                name: a.request.name.clone(),
                received: a.reassembly.received_bytes(),
                total: a.reassembly.total_length(),
            })
            .collect();
        out.sort_by(|a, b| a.from.cmp(&b.from));
        out
    }
}

/// `report.pdf` -> `report (n).pdf`; names without an extension get the suffix appended.
fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}

/// Transfer failures. Protocol violations are reported and leave existing state untouched.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0} already has a transfer outstanding; new offer rejected")]
    DuplicateOffer(MacAddr),
    #[error("no active reception from {0}")]
    NoActiveReception(MacAddr),
    #[error("no pending file request from {0}")]
    NoPendingRequest(MacAddr),
    #[error("a transfer to {0} is already in progress")]
    TransferInProgress(MacAddr),
    #[error("{0} did not accept the transfer in time")]
    Timeout(MacAddr),
    #[error("offered name {0:?} is not a plain file name")]
    InvalidName(String),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link error: {0}")]
    Transport(#[source] std::io::Error),
}

impl TransferError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransferError::DuplicateOffer(_)
                | TransferError::NoActiveReception(_)
                | TransferError::NoPendingRequest(_)
                | TransferError::InvalidName(_)
                | TransferError::Chunk(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, last])
    }

    fn request(name: &str, size: u64) -> PendingRequest {
        PendingRequest {
            name: name.into(),
            size,
            is_folder: false,
            dest: PathBuf::from(name),
        }
    }

    #[test]
    fn ack_moves_awaiting_to_sending_once() {
        let mut table = OutboundTable::new();
        table
            .begin(mac(1), OutboundTransfer::new("a".into(), "a".into(), 1, false))
            .unwrap();
        assert_eq!(table.phase(&mac(1)), Some(SendPhase::AwaitingAck));
        assert!(table.acknowledge(&mac(1)));
        assert_eq!(table.phase(&mac(1)), Some(SendPhase::Sending));
        assert!(!table.acknowledge(&mac(1)));
    }

    #[test]
    fn ack_without_transfer_is_ignored() {
        let mut table = OutboundTable::new();
        assert!(!table.acknowledge(&mac(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn one_outbound_per_destination() {
        let mut table = OutboundTable::new();
        let t = OutboundTransfer::new("a".into(), "a".into(), 1, false);
        table.begin(mac(1), t.clone()).unwrap();
        assert!(matches!(
            table.begin(mac(1), t.clone()),
            Err(TransferError::TransferInProgress(_))
        ));
        table.begin(mac(2), t).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn advance_tracks_offset_and_sequence() {
        let mut table = OutboundTable::new();
        table
            .begin(mac(1), OutboundTransfer::new("a".into(), "a".into(), 3000, false))
            .unwrap();
        table.advance(&mac(1), 1400);
        table.advance(&mac(1), 1400);
        let t = table.get(&mac(1)).unwrap();
        assert_eq!(t.offset, 2800);
        assert_eq!(t.seq, 2);
        assert!(table.finish(&mac(1)).is_some());
        assert!(table.finish(&mac(1)).is_none());
    }

    #[test]
    fn duplicate_offer_leaves_pending_untouched() {
        let mut table: InboundTable<()> = InboundTable::new();
        table.offer(mac(1), request("first.txt", 10)).unwrap();
        let err = table.offer(mac(1), request("second.txt", 20)).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(table.pending(&mac(1)).unwrap().name, "first.txt");
    }

    #[test]
    fn duplicate_offer_rejected_while_receiving() {
        let mut table: InboundTable<()> = InboundTable::new();
        table.offer(mac(1), request("first.txt", 10)).unwrap();
        table.begin_accept(&mac(1)).unwrap();
        table.activate(mac(1), ()).unwrap();
        assert!(matches!(
            table.offer(mac(1), request("second.txt", 20)),
            Err(TransferError::DuplicateOffer(_))
        ));
        assert!(table.pending(&mac(1)).is_none());
        assert_eq!(table.progress()[0].name, "first.txt");
    }

    #[test]
    fn offer_during_accept_is_rejected() {
        let mut table: InboundTable<()> = InboundTable::new();
        table.offer(mac(1), request("first.txt", 10)).unwrap();
        let accepted = table.begin_accept(&mac(1)).unwrap();
        assert_eq!(accepted.name, "first.txt");
        assert!(matches!(
            table.offer(mac(1), request("second.txt", 20)),
            Err(TransferError::DuplicateOffer(_))
        ));
        assert!(matches!(
            table.chunk(&mac(1), 0, 10),
            Err(TransferError::NoActiveReception(_))
        ));
        table.activate(mac(1), ()).unwrap();
        assert!(table.pending(&mac(1)).is_none());
        assert_eq!(table.progress()[0].name, "first.txt");
    }

    #[test]
    fn cancelled_accept_releases_source() {
        let mut table: InboundTable<()> = InboundTable::new();
        table.offer(mac(1), request("first.txt", 10)).unwrap();
        table.begin_accept(&mac(1)).unwrap();
        assert_eq!(table.cancel_accept(&mac(1)).unwrap().name, "first.txt");
        assert!(matches!(
            table.activate(mac(1), ()),
            Err(TransferError::NoPendingRequest(_))
        ));
        table.offer(mac(1), request("second.txt", 20)).unwrap();
    }

    #[test]
    fn same_name_from_different_sources_gets_distinct_destinations() {
        let mut table: InboundTable<()> = InboundTable::new();
        let dest = |table: &mut InboundTable<()>, last: u8, name: &str| {
            let mut req = request(name, 5);
            req.dest = PathBuf::from("dl").join(name);
            table.offer(mac(last), req).unwrap()
        };
        assert_eq!(dest(&mut table, 1, "report.pdf"), PathBuf::from("dl/report.pdf"));
        assert_eq!(dest(&mut table, 2, "report.pdf"), PathBuf::from("dl/report (1).pdf"));
        table.begin_accept(&mac(2)).unwrap();
        assert_eq!(dest(&mut table, 3, "report.pdf"), PathBuf::from("dl/report (2).pdf"));
        assert_eq!(dest(&mut table, 4, "album.zip"), PathBuf::from("dl/album.zip"));
        assert_eq!(dest(&mut table, 5, "album.zip"), PathBuf::from("dl/album (1).zip"));
        assert_eq!(dest(&mut table, 6, ".profile"), PathBuf::from("dl/.profile"));
        assert_eq!(dest(&mut table, 7, ".profile"), PathBuf::from("dl/.profile (1)"));

        // A finished reception frees its path.
        table.begin_accept(&mac(1)).unwrap();
        table.activate(mac(1), ()).unwrap();
        table.complete(&mac(1)).unwrap();
        assert_eq!(dest(&mut table, 8, "report.pdf"), PathBuf::from("dl/report.pdf"));
    }

    #[test]
    fn chunk_requires_active_reception() {
        let mut table: InboundTable<()> = InboundTable::new();
        assert!(matches!(
            table.chunk(&mac(1), 0, 10),
            Err(TransferError::NoActiveReception(_))
        ));
        table.offer(mac(1), request("f", 10)).unwrap();
        assert!(matches!(
            table.chunk(&mac(1), 0, 10),
            Err(TransferError::NoActiveReception(_))
        ));
    }

    #[test]
    fn reception_lifecycle() {
        let mut table: InboundTable<u8> = InboundTable::new();
        table.offer(mac(1), request("f", 2000)).unwrap();
        table.begin_accept(&mac(1)).unwrap();
        table.activate(mac(1), 7).unwrap();
        let (handle, p) = table.chunk(&mac(1), 1, 600).unwrap();
        assert_eq!(handle, 7);
        assert_eq!(p.offset, 1400);
        assert_eq!(table.progress()[0].received, 600);
        let done = table.complete(&mac(1)).unwrap();
        assert_eq!(done.request.name, "f");
        assert!(!table.is_active(&mac(1)));
        assert!(matches!(
            table.complete(&mac(1)),
            Err(TransferError::NoActiveReception(_))
        ));
    }

    #[test]
    fn accept_without_offer_fails() {
        let mut table: InboundTable<()> = InboundTable::new();
        assert!(matches!(
            table.take_pending(&mac(3)),
            Err(TransferError::NoPendingRequest(_))
        ));
    }

    #[test]
    fn accept_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct W {
            mode: AcceptMode,
        }
        let w: W = toml::from_str("mode = \"unattended\"").unwrap();
        assert_eq!(w.mode, AcceptMode::Unattended);
        assert_eq!(AcceptMode::default(), AcceptMode::Interactive);
    }
}
