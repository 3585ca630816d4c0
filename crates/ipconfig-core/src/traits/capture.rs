// # Link Capture Trait
//
// Raw, filtered link-layer frame I/O for the ARP session engine.
//
// ## Implementations
//
// - AF_PACKET (Linux): `ipconfig-linux` crate
// - Scripted in-memory wire: `tests/common`
//
// ## Usage
//
// ```rust,ignore
// let handle = capture.open("en0", notifier)?;
// handle.set_arp_filter()?;
// handle.set_immediate(true)?;
// let mut buffer = vec![0; handle.buffer_size()?];
//
// // after the notifier fired:
// for range in handle.read(&mut buffer)? {
//     let frame = &buffer[range];
// }
// ```

use crate::error::Result;
use crate::event::{Event, EventSender};
use std::ops::Range;
use tracing::trace;

/// Wakes the engine when a capture handle becomes readable
///
/// Backends call [`notify`](CaptureNotifier::notify) from whatever context
/// observes readability (a reactor task, a test). The engine then reads the
/// handle on its own queue.
#[derive(Debug, Clone)]
pub struct CaptureNotifier {
    ifname: String,
    sender: EventSender,
}

impl CaptureNotifier {
    pub fn new(ifname: impl Into<String>, sender: EventSender) -> Self {
        Self {
            ifname: ifname.into(),
            sender,
        }
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Post a readability event; returns `false` once the engine is gone
    pub fn notify(&self) -> bool {
        trace!("Capture readable on {}", self.ifname);
        self.sender
            .send(Event::CaptureReadable {
                ifname: self.ifname.clone(),
            })
            .is_ok()
    }
}

/// An open capture device bound to one interface
///
/// Dropping the handle closes the device.
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Perform platform I/O on the one device it owns
/// - ⚠️ Spawn a task ONLY to watch readability and call the notifier
///
/// ## Forbidden Capabilities
/// - ❌ Parse or interpret frames (owned by the ARP engine)
/// - ❌ Block in `read` (return an empty batch instead)
pub trait CaptureHandle: Send {
    /// Restrict delivery to ARP frames
    fn set_arp_filter(&mut self) -> Result<()>;

    /// Deliver frames as soon as they arrive instead of batching
    fn set_immediate(&mut self, enabled: bool) -> Result<()>;

    /// Receive buffer size the caller must provide to [`read`](Self::read)
    fn buffer_size(&self) -> Result<usize>;

    /// Read one batch into `buffer`
    ///
    /// Returns the byte range of each captured frame, in arrival order. An
    /// empty batch means nothing was pending.
    fn read(&mut self, buffer: &mut [u8]) -> Result<Vec<Range<usize>>>;

    /// Transmit one complete link-layer frame
    fn write(&mut self, frame: &[u8]) -> Result<()>;
}

/// Opens capture handles
pub trait LinkCapture: Send + Sync {
    /// Backend name (for logging)
    fn name(&self) -> &str;

    /// Open a capture device on `ifname`
    fn open(&self, ifname: &str, notifier: CaptureNotifier) -> Result<Box<dyn CaptureHandle>>;
}

/// Helper trait for constructing capture backends by name
pub trait LinkCaptureFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn LinkCapture>>;
}
