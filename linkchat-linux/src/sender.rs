//! Per-transfer sender task: wait for the go-ahead, stream FILE_DATA, close with FILE_END.

use std::io;
use std::path::Path;

use bytes::Bytes;
use linkchat_core::{AcceptMode, Event, MacAddr, Message, OutboundTransfer, SendPhase, TransferError, CHUNK_SIZE};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Releases the outbound entry and any packaging artifact. Normal exits go through
/// [`Cleanup::release`]; dropping an unreleased guard (abort, panic) does the same work
/// off the async workers.
struct Cleanup {
    engine: Engine,
    dst: MacAddr,
    transfer: OutboundTransfer,
    released: bool,
}

impl Cleanup {
    fn new(engine: Engine, dst: MacAddr, transfer: OutboundTransfer) -> Self {
        Self {
            engine,
            dst,
            transfer,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        self.engine.finish_outbound(&self.dst);
        if self.transfer.transient {
            let path = &self.transfer.path;
            log_removal(path, tokio::fs::remove_file(path).await);
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.engine.finish_outbound(&self.dst);
        if self.transfer.transient {
            let path = self.transfer.path.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn_blocking(move || log_removal(&path, std::fs::remove_file(&path)));
                }
                Err(_) => log_removal(&path, std::fs::remove_file(&path)),
            }
        }
    }
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %path.display(), "archive removed"),
        Err(e) => warn!(path = %path.display(), "could not remove archive: {e}"),
    }
}

pub async fn run_sender(engine: Engine, dst: MacAddr) {
    let Some(transfer) = engine.outbound_snapshot(&dst) else {
        return;
    };
    let name = transfer.name.clone();
    let cleanup = Cleanup::new(engine.clone(), dst, transfer);
    let result = stream(&engine, dst, &cleanup.transfer).await;
    cleanup.release().await;
    match result {
        Ok(()) => {
            info!(%dst, %name, "transfer complete");
            engine.emit(Event::FileSent { to: dst, name });
        }
        Err(e) => {
            warn!(%dst, %name, "transfer failed: {e}");
            engine.emit(Event::Error(format!("sending '{name}' to {dst}: {e}")));
        }
    }
}

async fn stream(engine: &Engine, dst: MacAddr, transfer: &OutboundTransfer) -> Result<(), TransferError> {
    match engine.settings().accept_mode {
        AcceptMode::Interactive => wait_for_ack(engine, dst).await?,
        AcceptMode::Unattended => {
            sleep(engine.settings().unattended_delay).await;
            engine.start_sending(&dst);
        }
    }
    engine.emit(Event::TransferStarted {
        peer: dst,
        name: transfer.name.clone(),
    });

    let pace = engine.settings().chunk_pace;
    let mut file = File::open(&transfer.path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut seq: u32 = 0;
    loop {
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = Message::FileData {
            seq,
            chunk: Bytes::copy_from_slice(&buf[..n]),
        };
        engine.send_message(dst, &chunk).await?;
        engine.advance_outbound(&dst, n);
        seq = seq.wrapping_add(1);
        if !pace.is_zero() {
            sleep(pace).await;
        }
        if n < CHUNK_SIZE {
            break;
        }
    }
    engine.send_message(dst, &Message::FileEnd).await?;
    debug!(%dst, chunks = seq, "FILE_END sent");
    Ok(())
}

/// Poll the outbound phase until the receiver acknowledges or `ack_timeout` passes.
async fn wait_for_ack(engine: &Engine, dst: MacAddr) -> Result<(), TransferError> {
    let deadline = Instant::now() + engine.settings().ack_timeout;
    loop {
        if engine.outbound_phase(&dst) == Some(SendPhase::Sending) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::Timeout(dst));
        }
        sleep(engine.settings().ack_poll).await;
    }
}

/// Fill `buf` unless EOF comes first; short reads from the file are merged.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
