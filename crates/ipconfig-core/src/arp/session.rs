//! Shared per-interface capture handle

use super::ArpClientId;
use super::client::Outgoing;
use super::frame::{ArpFrame, ArpOp, FrameLayout};
use crate::error::{Error, Result};
use crate::interface::HwAddr;
use crate::traits::{CaptureHandle, CaptureNotifier, LinkCapture};
use bytes::Bytes;
use tracing::{debug, trace};

/// One capture handle shared by every client of an interface
///
/// The handle is open iff `open_count > 0`; the receive buffer is allocated
/// only while the handle is open.
pub(crate) struct ArpIfSession {
    pub layout: FrameLayout,
    pub hwaddr: HwAddr,
    pub open_count: usize,
    pub handle: Option<Box<dyn CaptureHandle>>,
    pub buffer: Vec<u8>,
    /// Clients in registration order
    pub clients: Vec<ArpClientId>,
}

impl ArpIfSession {
    pub fn new(layout: FrameLayout, hwaddr: HwAddr) -> Self {
        Self {
            layout,
            hwaddr,
            open_count: 0,
            handle: None,
            buffer: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// Take one reference, opening the device on the first
    pub fn acquire(
        &mut self,
        ifname: &str,
        capture: &dyn LinkCapture,
        notifier: CaptureNotifier,
    ) -> Result<()> {
        if self.open_count == 0 {
            let mut handle = capture.open(ifname, notifier)?;
            handle.set_arp_filter()?;
            handle.set_immediate(true)?;
            let size = handle.buffer_size()?.max(self.layout.frame_len());
            debug!(
                "Opened {} capture on {} (buffer {} bytes)",
                capture.name(),
                ifname,
                size
            );
            self.buffer = vec![0; size];
            self.handle = Some(handle);
        }
        self.open_count += 1;
        Ok(())
    }

    /// Drop one reference, closing the device on the last
    pub fn release(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count == 0 && self.handle.is_some() {
            trace!("Closing capture handle");
            self.handle = None;
            self.buffer = Vec::new();
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn encode(&self, outgoing: Outgoing) -> Bytes {
        match outgoing {
            Outgoing::Probe {
                sender_ip,
                target_ip,
            } => self.layout.encode(
                ArpOp::Request,
                &self.hwaddr,
                sender_ip,
                None,
                target_ip,
                None,
            ),
            Outgoing::Announcement { ip } => {
                self.layout
                    .encode(ArpOp::Request, &self.hwaddr, ip, None, ip, None)
            }
            Outgoing::Request {
                sender_ip,
                target_ip,
                unicast,
            } => self.layout.encode(
                ArpOp::Request,
                &self.hwaddr,
                sender_ip,
                unicast.as_ref(),
                target_ip,
                unicast.as_ref(),
            ),
        }
    }

    pub fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.write(frame),
            None => Err(Error::invalid_input("capture handle is not open")),
        }
    }

    /// Read one batch and decode every valid ARP frame in it
    pub fn read_batch(&mut self) -> Result<Vec<ArpFrame>> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(Vec::new());
        };
        let ranges = handle.read(&mut self.buffer)?;
        let mut frames = Vec::with_capacity(ranges.len());
        for range in ranges {
            let Some(bytes) = self.buffer.get(range) else {
                continue;
            };
            match self.layout.decode(bytes) {
                Ok(frame) => frames.push(frame),
                Err(e) => trace!("Ignoring frame: {}", e),
            }
        }
        Ok(frames)
    }
}
