//! Receive loop: the only reader of the link. Decodes each frame, records the sender
//! as a peer and routes by message type.

use std::io::{self, SeekFrom};
use std::path::Path;

use linkchat_core::event::MALFORMED_TEXT;
use linkchat_core::protocol::{receipt_text, MAX_FRAME_LEN};
use linkchat_core::transfer::ActiveReception;
use linkchat_core::{
    decode_header, decode_message, AcceptMode, DecodeError, Event, FileOffer, MacAddr, Message,
    Observed, PendingRequest, TransferError,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::engine::{Engine, ReceptionHandle};
use crate::materialize::blocking;

/// Runs until the link fails; then reports LinkDown and returns the error.
pub async fn run_dispatcher(engine: Engine) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let n = match engine.link().recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                error!("receive failed, dispatcher stopping: {e}");
                engine.emit(Event::LinkDown(e.to_string()));
                return Err(e);
            }
        };
        dispatch(&engine, &buf[..n]).await;
    }
}

async fn dispatch(engine: &Engine, bytes: &[u8]) {
    let (header, payload) = match decode_header(bytes) {
        Ok(h) => h,
        Err(DecodeError::WrongProtocol(_)) => return,
        Err(e) => {
            debug!("dropping frame: {e}");
            return;
        }
    };
    let local = engine.local_address();
    if header.src == local || header.src.is_broadcast() {
        return;
    }

    let src = header.src;
    match engine.observe(src) {
        Ok(Observed::New(id)) => {
            info!(%src, %id, "peer discovered");
            engine.emit(Event::PeerDiscovered { id, address: src });
        }
        Ok(Observed::Known(_)) => {}
        Err(e) => debug!(%src, "not recording peer: {e}"),
    }

    // Any Link-Chat sender is a peer, but only our traffic is routed.
    if header.dst != local && !header.dst.is_broadcast() {
        debug!(%src, dst = %header.dst, "frame for another host");
        return;
    }

    let message = match decode_message(header.kind, payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(%src, "malformed frame: {e}");
            engine.emit(Event::Error(format!("malformed frame from {src}: {e}")));
            return;
        }
    };
    if let Err(e) = handle(engine, header.dst, src, message).await {
        if e.is_protocol_violation() {
            warn!(%src, "protocol violation: {e}");
        } else {
            error!(%src, "transfer failed: {e}");
        }
        engine.emit(Event::Error(format!("{src}: {e}")));
    }
}

async fn handle(
    engine: &Engine,
    dst: MacAddr,
    src: MacAddr,
    message: Message,
) -> Result<(), TransferError> {
    match message {
        Message::Discovery => Ok(()),
        Message::Chat(bytes) => {
            let private = dst == engine.local_address();
            engine.emit(Event::ChatMessage {
                from: src,
                private,
                text: chat_text(&bytes),
            });
            Ok(())
        }
        Message::FileStart(offer) => on_file_start(engine, src, offer).await,
        Message::FileAck => {
            if engine.acknowledge(&src) {
                debug!(%src, "offer acknowledged");
            } else {
                debug!(%src, "ignoring FILE_ACK with no offer awaiting it");
            }
            Ok(())
        }
        Message::FileData { seq, chunk } => {
            let result = write_chunk(engine, src, seq, &chunk).await;
            if let Err(TransferError::Io(_)) = &result {
                engine.abort_reception(&src);
            }
            result
        }
        Message::FileEnd => on_file_end(engine, src).await,
    }
}

/// UTF-8 text without link padding; invalid bytes become a placeholder.
fn chat_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_end_matches('\0').to_string(),
        Err(_) => MALFORMED_TEXT.to_string(),
    }
}

/// Last component of an offered name, or None if nothing usable is left.
fn sanitize_name(raw: &str) -> Option<String> {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

async fn on_file_start(engine: &Engine, src: MacAddr, offer: FileOffer) -> Result<(), TransferError> {
    let name = sanitize_name(&offer.name).ok_or_else(|| TransferError::InvalidName(offer.name.clone()))?;
    let request = PendingRequest {
        dest: engine.destination(&name),
        name: name.clone(),
        size: offer.size,
        is_folder: offer.is_folder,
    };
    let dest = engine.register_offer(src, request)?;
    info!(%src, %name, size = offer.size, folder = offer.is_folder, dest = %dest.display(), "offer received");
    match engine.settings().accept_mode {
        AcceptMode::Interactive => {
            engine.emit(Event::FileOffered {
                from: src,
                name,
                size: offer.size,
                is_folder: offer.is_folder,
            });
            Ok(())
        }
        AcceptMode::Unattended => {
            let request = engine.begin_accept(&src)?;
            engine.activate(src, request).await
        }
    }
}

async fn write_chunk(engine: &Engine, src: MacAddr, seq: u32, chunk: &[u8]) -> Result<(), TransferError> {
    let (handle, placement) = engine.place_chunk(&src, seq, chunk.len())?;
    if placement.duplicate {
        trace!(%src, seq, "duplicate chunk");
    }
    let mut file = handle.lock().await;
    file.seek(SeekFrom::Start(placement.offset)).await?;
    file.write_all(&chunk[..placement.len]).await?;
    Ok(())
}

async fn on_file_end(engine: &Engine, src: MacAddr) -> Result<(), TransferError> {
    let ActiveReception {
        request,
        reassembly,
        handle,
    } = engine.complete_reception(&src)?;
    close(handle).await?;

    if !reassembly.is_complete() {
        let msg = format!(
            "'{}' from {src} ended after {} of {} bytes; missing chunks {}",
            request.name,
            reassembly.received_bytes(),
            reassembly.total_length(),
            list_sequences(&reassembly.missing())
        );
        warn!("{msg}");
        engine.emit(Event::Error(msg));
    }

    let materializer = engine.materializer();
    let (event, shown, path) = if request.is_folder {
        let folder = folder_name(&request.name);
        // Unpack beside the archive, under the archive's (possibly renumbered) name.
        let archive_name = request
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.name.clone());
        let dest = request.dest.with_file_name(folder_name(&archive_name));
        let (archive, out, m) = (request.dest.clone(), dest.clone(), materializer.clone());
        blocking(move || {
            m.unpack(&archive, &out)?;
            std::fs::remove_file(&archive)
        })
        .await?;
        info!(%src, folder = %folder, dest = %dest.display(), "folder received");
        let event = Event::FolderReceived {
            from: src,
            name: folder.clone(),
            path: dest.clone(),
        };
        (event, folder, dest)
    } else {
        info!(%src, name = %request.name, dest = %request.dest.display(), "file received");
        let event = Event::FileReceived {
            from: src,
            name: request.name.clone(),
            path: request.dest.clone(),
        };
        (event, request.name, request.dest)
    };

    if let Err(e) = blocking(move || materializer.fix_ownership(&path)).await {
        warn!("could not hand {shown} to the invoking user: {e}");
        engine.emit(Event::Error(format!("ownership of '{shown}': {e}")));
    }
    engine.emit(event);
    engine
        .send_message(src, &Message::chat(&receipt_text(&shown)))
        .await
}

/// `0, 3, 4` style list, cut short after a few entries.
fn list_sequences(seqs: &[u32]) -> String {
    const SHOWN: usize = 8;
    let mut out = seqs
        .iter()
        .take(SHOWN)
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if seqs.len() > SHOWN {
        out.push_str(&format!(" and {} more", seqs.len() - SHOWN));
    }
    out
}

/// Flush buffered writes and release the file.
async fn close(handle: ReceptionHandle) -> io::Result<()> {
    let mut file = handle.lock().await;
    file.flush().await?;
    file.sync_data().await
}

/// Directory a received folder archive unpacks into.
fn folder_name(archive: &str) -> String {
    match archive.strip_suffix(".zip") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => format!("{archive}.d"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use linkchat_core::PeerRegistry;

    use super::*;
    use crate::engine::tests::{next_event, settings};
    use crate::link::Link;
    use crate::materialize::ZipMaterializer;

    #[test]
    fn chat_text_trims_padding() {
        assert_eq!(chat_text(b"hola\0\0\0"), "hola");
        assert_eq!(chat_text(b""), "");
        assert_eq!(chat_text(&[0xc3]), MALFORMED_TEXT);
    }

    #[test]
    fn offered_names_are_reduced_to_basename() {
        assert_eq!(sanitize_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_name("/home/u/a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_name("../x").as_deref(), Some("x"));
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name(""), None);
        assert_eq!(sanitize_name("/"), None);
    }

    #[test]
    fn folder_names_drop_archive_suffix() {
        assert_eq!(folder_name("album.zip"), "album");
        assert_eq!(folder_name("album"), "album.d");
        assert_eq!(folder_name(".zip"), ".zip.d");
    }

    #[test]
    fn sequence_lists_are_capped() {
        assert_eq!(list_sequences(&[1, 3]), "1, 3");
        let many: Vec<u32> = (0..10).collect();
        assert_eq!(list_sequences(&many), "0, 1, 2, 3, 4, 5, 6, 7 and 2 more");
    }

    struct DeadLink;

    #[async_trait]
    impl Link for DeadLink {
        async fn send(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::NetworkDown, "interface gone"))
        }
    }

    #[tokio::test]
    async fn receive_failure_reports_link_down() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut events) = Engine::new(
            Arc::new(DeadLink),
            MacAddr::new([0x02, 0, 0, 0, 0, 1]),
            settings(AcceptMode::Interactive, dir.path()),
            PeerRegistry::new(),
            Arc::new(ZipMaterializer::new()),
        );
        assert!(run_dispatcher(engine).await.is_err());
        assert!(matches!(next_event(&mut events).await, Event::LinkDown(ref m) if m.contains("interface gone")));
    }
}
