//! AF_PACKET capture backend
//!
//! One raw packet socket per open handle, bound to the interface. The socket
//! starts with protocol 0 (receives nothing) and is re-bound to `ETH_P_ARP`
//! when the ARP filter is installed. A reactor task watches readability and
//! wakes the engine through the [`CaptureNotifier`].

use crate::sys::{self, Socket};
use ipconfig_core::traits::{CaptureHandle, CaptureNotifier, LinkCapture};
use ipconfig_core::{Error, Result};
use std::ops::Range;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const ETH_P_ARP: u16 = 0x0806;

/// Receive buffer handed to the engine
const BUFFER_SIZE: usize = 64 * 1024;

/// Room kept free for one more frame before a batch ends
const MAX_FRAME: usize = 2048;

/// Raw packet socket backend
#[derive(Debug, Default)]
pub struct PacketCapture;

impl PacketCapture {
    pub fn new() -> Self {
        Self
    }
}

impl LinkCapture for PacketCapture {
    fn name(&self) -> &str {
        "packet"
    }

    fn open(&self, ifname: &str, notifier: CaptureNotifier) -> Result<Box<dyn CaptureHandle>> {
        let handle = PacketHandle::open(ifname, notifier)
            .map_err(|e| Error::capture(ifname, e.to_string()))?;
        debug!("Opened packet socket on {}", ifname);
        Ok(Box::new(handle))
    }
}

struct PacketHandle {
    ifname: String,
    ifindex: u32,
    socket: Arc<Socket>,
    watcher: JoinHandle<()>,
}

impl PacketHandle {
    fn open(ifname: &str, notifier: CaptureNotifier) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let ifindex = sys::if_index(ifname)?;
        let fd = sys::socket(libc::AF_PACKET, libc::SOCK_RAW, 0)?;
        sys::bind_link(&fd, &sys::link_addr(ifindex, 0))?;

        let socket = Arc::new(Socket(fd));
        let watched = {
            let _guard = runtime.enter();
            AsyncFd::new(Arc::clone(&socket))?
        };
        let watcher = runtime.spawn(watch_readable(watched, notifier));

        Ok(Self {
            ifname: ifname.to_string(),
            ifindex,
            socket,
            watcher,
        })
    }

    fn capture_error(&self, e: std::io::Error) -> Error {
        Error::capture(self.ifname.as_str(), e.to_string())
    }
}

/// Wake the engine once per readability edge
///
/// Readiness is cleared before notifying; the engine reads until the socket
/// reports `EAGAIN`, so frames arriving after that raise a fresh edge.
async fn watch_readable(fd: AsyncFd<Arc<Socket>>, notifier: CaptureNotifier) {
    loop {
        match fd.readable().await {
            Ok(mut guard) => {
                guard.clear_ready();
                if !notifier.notify() {
                    trace!("Engine gone, stopping watcher for {}", notifier.ifname());
                    return;
                }
            }
            Err(e) => {
                warn!("Readability watch on {} failed: {}", notifier.ifname(), e);
                return;
            }
        }
    }
}

impl CaptureHandle for PacketHandle {
    fn set_arp_filter(&mut self) -> Result<()> {
        sys::bind_link(&self.socket.0, &sys::link_addr(self.ifindex, ETH_P_ARP))
            .map_err(|e| self.capture_error(e))
    }

    fn set_immediate(&mut self, enabled: bool) -> Result<()> {
        // Packet sockets never batch
        trace!("Immediate mode {} on {}", enabled, self.ifname);
        Ok(())
    }

    fn buffer_size(&self) -> Result<usize> {
        Ok(BUFFER_SIZE)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<Vec<Range<usize>>> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while buffer.len() - offset >= MAX_FRAME {
            match sys::recv(&self.socket.0, &mut buffer[offset..]) {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(len)) => {
                    frames.push(offset..offset + len);
                    offset += len;
                }
                Err(e) => return Err(self.capture_error(e)),
            }
        }
        Ok(frames)
    }

    fn write(&mut self, frame: &[u8]) -> Result<()> {
        sys::sendto(&self.socket.0, frame, &sys::link_addr(self.ifindex, ETH_P_ARP))
            .map_err(|e| self.capture_error(e))
    }
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        self.watcher.abort();
        debug!(
            "Closed packet socket on {} (fd {})",
            self.ifname,
            self.socket.as_raw_fd()
        );
    }
}
