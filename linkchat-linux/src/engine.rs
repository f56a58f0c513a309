//! Engine handle: shared tables, the event sink, task startup and user intents.
//!
//! State lives behind one `Arc`; each table has its own lock, held only for the map
//! operation itself and never across an await.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use linkchat_core::transfer::ActiveReception;
use linkchat_core::{
    encode_frame, AcceptMode, Event, FileOffer, Message, Observed, OutboundTable,
    OutboundTransfer, PeerEntry, PeerError, PeerRegistry, PendingRequest, ReceptionProgress,
    SendPhase, TransferError,
};
use linkchat_core::{InboundTable, MacAddr, Placement};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::link::Link;
use crate::materialize::{blocking, Materializer};
use crate::{discovery, dispatcher, sender};

/// Timings and policy.
#[derive(Debug, Clone)]
pub struct Settings {
    pub accept_mode: AcceptMode,
    pub download_dir: PathBuf,
    pub discovery_interval: Duration,
    pub ack_timeout: Duration,
    pub ack_poll: Duration,
    /// Sender wait before streaming when the receiver never acknowledges.
    pub unattended_delay: Duration,
    /// Gap between FILE_DATA frames.
    pub chunk_pace: Duration,
}

/// Seek-capable write target of one active reception.
pub type ReceptionHandle = Arc<tokio::sync::Mutex<tokio::fs::File>>;

/// Chat destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTarget {
    Broadcast,
    /// Peer at this position in [`Engine::list_peers`].
    Peer(usize),
}

/// Errors returned to the caller of an intent.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("{} has no usable file name", .0.display())]
    NoFileName(PathBuf),
    #[error("packaging {}: {source}", path.display())]
    Package {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct Shared {
    link: Arc<dyn Link>,
    local: MacAddr,
    settings: Settings,
    peers: Mutex<PeerRegistry>,
    outbound: Mutex<OutboundTable>,
    inbound: Mutex<InboundTable<ReceptionHandle>>,
    events: mpsc::UnboundedSender<Event>,
    materializer: Arc<dyn Materializer>,
}

/// Cheap to clone; every task holds one.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

/// Background tasks started by [`Engine::start`].
pub struct Tasks {
    dispatcher: JoinHandle<()>,
    beacon: JoinHandle<()>,
}

impl Tasks {
    pub fn shutdown(self) {
        self.dispatcher.abort();
        self.beacon.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(
        link: Arc<dyn Link>,
        local: MacAddr,
        settings: Settings,
        peers: PeerRegistry,
        materializer: Arc<dyn Materializer>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            link,
            local,
            settings,
            peers: Mutex::new(peers),
            outbound: Mutex::new(OutboundTable::new()),
            inbound: Mutex::new(InboundTable::new()),
            events,
            materializer,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Spawn the dispatcher and the discovery beacon.
    pub fn start(&self) -> Tasks {
        let engine = self.clone();
        let dispatcher = tokio::spawn(async move {
            let _ = dispatcher::run_dispatcher(engine).await;
        });
        let engine = self.clone();
        let beacon = tokio::spawn(async move {
            let _ = discovery::run_beacon(engine).await;
        });
        info!(local = %self.shared.local, mode = ?self.shared.settings.accept_mode, "engine started");
        Tasks { dispatcher, beacon }
    }

    pub fn local_address(&self) -> MacAddr {
        self.shared.local
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    // ---- intents ----

    pub async fn send_chat(&self, target: ChatTarget, text: &str) -> Result<(), EngineError> {
        let dst = match target {
            ChatTarget::Broadcast => MacAddr::BROADCAST,
            ChatTarget::Peer(position) => self.resolve(position)?,
        };
        self.send_message(dst, &Message::chat(text)).await?;
        debug!(%dst, "chat sent");
        Ok(())
    }

    /// Offer a regular file to the peer at `position`; streaming runs in its own task.
    pub async fn send_file(&self, position: usize, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref().to_path_buf();
        let size = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m.len(),
            _ => return Err(EngineError::NotAFile(path)),
        };
        let name = plain_name(&path)?;
        let dst = self.resolve(position)?;
        self.offer(dst, path, name, size, false, false).await
    }

    /// Package `folder` into a temporary archive and offer it. The archive is removed
    /// when the transfer ends, however it ends.
    pub async fn send_folder(
        &self,
        position: usize,
        folder: impl AsRef<Path>,
    ) -> Result<(), EngineError> {
        let folder = folder.as_ref().to_path_buf();
        if !tokio::fs::metadata(&folder)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(EngineError::NotADirectory(folder));
        }
        let name = format!("{}.zip", plain_name(&folder)?);
        let dst = self.resolve(position)?;
        let archive = std::env::temp_dir().join(format!(
            "linkchat-{}-{}-{name}",
            std::process::id(),
            dst.to_string().replace(':', "")
        ));

        let materializer = self.shared.materializer.clone();
        let (src, out) = (folder.clone(), archive.clone());
        if let Err(source) = blocking(move || materializer.pack(&src, &out)).await {
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(EngineError::Package {
                path: folder,
                source,
            });
        }
        let size = match tokio::fs::metadata(&archive).await {
            Ok(m) => m.len(),
            Err(e) => {
                let _ = tokio::fs::remove_file(&archive).await;
                return Err(TransferError::Io(e).into());
            }
        };
        debug!(folder = %folder.display(), archive = %archive.display(), size, "folder packaged");
        self.offer(dst, archive, name, size, true, true).await
    }

    /// Accept the pending offer from `from`: open the destination, then acknowledge.
    pub async fn accept_transfer(&self, from: MacAddr) -> Result<(), EngineError> {
        let request = self.begin_accept(&from)?;
        self.activate(from, request).await?;
        if let Err(e) = self.send_message(from, &Message::FileAck).await {
            self.abort_reception(&from);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the pending offer from `from`. Nothing is sent; the sender's wait times out.
    pub fn reject_transfer(&self, from: MacAddr) -> Result<(), EngineError> {
        let request = lock(&self.shared.inbound).take_pending(&from)?;
        info!(%from, name = %request.name, "offer rejected");
        Ok(())
    }

    pub fn list_peers(&self) -> Vec<PeerEntry> {
        lock(&self.shared.peers).list()
    }

    pub fn set_alias(&self, position: usize, alias: &str) -> Result<(), EngineError> {
        let mut peers = lock(&self.shared.peers);
        let addr = peers.resolve(position)?;
        peers.set_alias(&addr, alias)?;
        Ok(())
    }

    /// Display name for `address`.
    pub fn alias_of(&self, address: &MacAddr) -> String {
        lock(&self.shared.peers).alias_of(address)
    }

    /// Progress of every active reception.
    pub fn receptions(&self) -> Vec<ReceptionProgress> {
        lock(&self.shared.inbound).progress()
    }

    // ---- shared plumbing for the tasks ----

    pub(crate) fn link(&self) -> &dyn Link {
        self.shared.link.as_ref()
    }

    pub(crate) fn materializer(&self) -> Arc<dyn Materializer> {
        self.shared.materializer.clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.shared.events.send(event);
    }

    pub(crate) async fn send_message(&self, dst: MacAddr, message: &Message) -> Result<(), TransferError> {
        let frame = encode_frame(dst, self.shared.local, message)?;
        self.shared
            .link
            .send(&frame)
            .await
            .map_err(TransferError::Transport)
    }

    pub(crate) fn destination(&self, name: &str) -> PathBuf {
        self.shared.settings.download_dir.join(name)
    }

    fn resolve(&self, position: usize) -> Result<MacAddr, PeerError> {
        lock(&self.shared.peers).resolve(position)
    }

    pub(crate) fn observe(&self, addr: MacAddr) -> Result<Observed, PeerError> {
        lock(&self.shared.peers).observe(addr)
    }

    async fn offer(
        &self,
        dst: MacAddr,
        path: PathBuf,
        name: String,
        size: u64,
        is_folder: bool,
        transient: bool,
    ) -> Result<(), EngineError> {
        let transfer = OutboundTransfer::new(path.clone(), name.clone(), size, transient);
        let begun = lock(&self.shared.outbound).begin(dst, transfer);
        if let Err(e) = begun {
            if transient {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(e.into());
        }
        let offer = Message::FileStart(FileOffer {
            is_folder,
            size,
            name: name.clone(),
        });
        if let Err(e) = self.send_message(dst, &offer).await {
            self.finish_outbound(&dst);
            if transient {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(e.into());
        }
        info!(%dst, %name, size, is_folder, "file offered");
        tokio::spawn(sender::run_sender(self.clone(), dst));
        Ok(())
    }

    pub(crate) fn outbound_snapshot(&self, dst: &MacAddr) -> Option<OutboundTransfer> {
        lock(&self.shared.outbound).get(dst).cloned()
    }

    pub(crate) fn outbound_phase(&self, dst: &MacAddr) -> Option<SendPhase> {
        lock(&self.shared.outbound).phase(dst)
    }

    pub(crate) fn acknowledge(&self, src: &MacAddr) -> bool {
        lock(&self.shared.outbound).acknowledge(src)
    }

    pub(crate) fn start_sending(&self, dst: &MacAddr) -> bool {
        lock(&self.shared.outbound).start_sending(dst)
    }

    pub(crate) fn advance_outbound(&self, dst: &MacAddr, len: usize) {
        lock(&self.shared.outbound).advance(dst, len)
    }

    pub(crate) fn finish_outbound(&self, dst: &MacAddr) -> Option<OutboundTransfer> {
        lock(&self.shared.outbound).finish(dst)
    }

    /// Record an offer; returns the destination it was given.
    pub(crate) fn register_offer(&self, src: MacAddr, request: PendingRequest) -> Result<PathBuf, TransferError> {
        lock(&self.shared.inbound).offer(src, request)
    }

    pub(crate) fn begin_accept(&self, src: &MacAddr) -> Result<PendingRequest, TransferError> {
        lock(&self.shared.inbound).begin_accept(src)
    }

    /// Open the destination sized to the announced length and start accepting chunks.
    /// `request` must come from [`begin_accept`](Self::begin_accept).
    pub(crate) async fn activate(&self, from: MacAddr, request: PendingRequest) -> Result<(), TransferError> {
        let file = match open_destination(&request).await {
            Ok(f) => f,
            Err(e) => {
                lock(&self.shared.inbound).cancel_accept(&from);
                return Err(e.into());
            }
        };
        lock(&self.shared.inbound).activate(from, Arc::new(tokio::sync::Mutex::new(file)))?;
        info!(%from, name = %request.name, dest = %request.dest.display(), "reception started");
        self.emit(Event::TransferStarted {
            peer: from,
            name: request.name,
        });
        Ok(())
    }

    pub(crate) fn place_chunk(
        &self,
        src: &MacAddr,
        seq: u32,
        len: usize,
    ) -> Result<(ReceptionHandle, Placement), TransferError> {
        lock(&self.shared.inbound).chunk(src, seq, len)
    }

    pub(crate) fn complete_reception(
        &self,
        src: &MacAddr,
    ) -> Result<ActiveReception<ReceptionHandle>, TransferError> {
        lock(&self.shared.inbound).complete(src)
    }

    pub(crate) fn abort_reception(&self, src: &MacAddr) {
        if let Some(r) = lock(&self.shared.inbound).abort(src) {
            debug!(%src, name = %r.request.name, "reception aborted");
        }
    }
}

async fn open_destination(request: &PendingRequest) -> io::Result<tokio::fs::File> {
    let file = tokio::fs::File::create(&request.dest).await?;
    file.set_len(request.size).await?;
    Ok(file)
}

/// Final path component, as offered on the wire.
fn plain_name(path: &Path) -> Result<String, EngineError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::NoFileName(path.to_path_buf()))
}
