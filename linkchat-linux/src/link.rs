//! Raw link-layer channel: AF_PACKET socket bound to one interface and the Link-Chat
//! EtherType, plus interface lookups through sysfs.

use std::io::{self, Read};
use std::path::Path;

use async_trait::async_trait;
use linkchat_core::{MacAddr, ETHERTYPE};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

const SYSFS_NET: &str = "/sys/class/net";

/// Whole-frame send and receive. One frame per call; frames are never split or merged.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, frame: &[u8]) -> io::Result<()>;
    /// Receive one frame into `buf`; returns its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// AF_PACKET/SOCK_RAW socket filtered to ETHERTYPE. Requires root or CAP_NET_RAW.
pub struct RawLink {
    fd: AsyncFd<Socket>,
}

impl RawLink {
    /// Must be called inside a tokio runtime.
    pub fn open(interface: &str) -> io::Result<Self> {
        let ifindex = interface_index(Path::new(SYSFS_NET), interface)?;
        let protocol = Protocol::from(i32::from(ETHERTYPE.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))?;
        socket.bind(&packet_addr(ifindex)?)?;
        socket.set_nonblocking(true)?;
        tracing::debug!(interface, ifindex, "raw socket bound");
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }
}

#[async_trait]
impl Link for RawLink {
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(frame)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// sockaddr_ll for `ifindex`, protocol ETHERTYPE.
fn packet_addr(ifindex: i32) -> io::Result<SockAddr> {
    // SAFETY: try_init hands us zeroed storage large enough for any sockaddr;
    // sockaddr_ll fits and we report its exact length.
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            let sll = storage.cast::<libc::sockaddr_ll>();
            (*sll).sll_family = libc::AF_PACKET as libc::sa_family_t;
            (*sll).sll_protocol = ETHERTYPE.to_be();
            (*sll).sll_ifindex = ifindex;
            *len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            Ok(())
        })
    }?;
    Ok(addr)
}

/// Hardware address of `interface`.
pub fn hardware_address(interface: &str) -> io::Result<MacAddr> {
    read_hardware_address(Path::new(SYSFS_NET), interface)
}

/// First non-loopback interface, by name.
pub fn default_interface() -> io::Result<String> {
    first_interface(Path::new(SYSFS_NET))
}

fn read_hardware_address(root: &Path, interface: &str) -> io::Result<MacAddr> {
    let raw = std::fs::read_to_string(root.join(interface).join("address"))?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn interface_index(root: &Path, interface: &str) -> io::Result<i32> {
    let raw = std::fs::read_to_string(root.join(interface).join("ifindex"))?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn first_interface(root: &Path) -> io::Result<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    names.into_iter().next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no non-loopback network interface")
    })
}

/// In-memory broadcast segment for tests. Every attached link hears every frame,
/// its own included, like a packet socket does.
#[cfg(test)]
pub mod hub {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    pub struct Hub {
        ports: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    }

    impl Hub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn attach(self: &Arc<Self>) -> HubLink {
            let (tx, rx) = mpsc::unbounded_channel();
            self.ports.lock().unwrap().push(tx);
            HubLink {
                hub: self.clone(),
                rx: tokio::sync::Mutex::new(rx),
            }
        }
    }

    pub struct HubLink {
        hub: Arc<Hub>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl Link for HubLink {
        async fn send(&self, frame: &[u8]) -> io::Result<()> {
            for port in self.hub.ports.lock().unwrap().iter() {
                let _ = port.send(frame.to_vec());
            }
            Ok(())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let frame = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            Ok(n)
        }
    }
}
