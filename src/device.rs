//! Abstract link devices
//!
//! - [`LinkIo`]: the byte-stream interface the transport layer drives
//!   (blocking/non-blocking read, write, flush query, heartbeat, state,
//!   baud requests, suspend/close)
//! - [`VirtualDevice`]: inert device backing non-IO pseudo links
//! - [`PipeDevice`]: in-memory byte pipe pair for tests and demos, with an
//!   optional fault hook for loss injection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

/// Health of the component at the far end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Working,
    Unresponsive,
    Problem,
}

/// Baud-rate request kinds forwarded to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudAction {
    /// Set baud rate and clear the trigger.
    Set,
    /// Set baud rate, clear the trigger and persist the index.
    Save,
    /// Arm a pending baud change on the port.
    Signal,
}

/// Byte-stream device driven by a [`crate::driver::LinkDriver`].
///
/// `blocking_read` must return `None` promptly once the device is closed so
/// reader threads shut down in bounded time.
pub trait LinkIo: Send + Sync {
    /// Non-blocking read of the next available chunk.
    fn read(&self) -> Option<Bytes>;

    /// Blocking read; `None` on failure or close.
    fn blocking_read(&self) -> Option<Bytes>;

    /// Write a chunk. Returns false on failure.
    fn write(&self, bytes: &[u8]) -> bool;

    /// True once previously written bytes have actually been transferred.
    fn write_buffer_empty(&self) -> bool;

    /// Whether the link wants periodic liveness pings.
    fn has_heartbeat(&self) -> bool {
        false
    }

    fn state(&self) -> DeviceState;

    fn notify_state(&self, state: DeviceState);

    fn component_id(&self) -> String;

    fn session_id(&self) -> u32 {
        0
    }

    /// Request a baud-rate change on the underlying port.
    fn perform_baud_action(&self, rate_index: u8, action: BaudAction) {
        let _ = (rate_index, action);
    }

    /// Chunks accepted but not yet transferred.
    fn write_queue_len(&self) -> usize {
        0
    }

    fn io_count(&self, reads: bool) -> u64 {
        let _ = reads;
        0
    }

    fn reset_io_counters(&self) {}

    fn suspend(&self) {}

    fn close(&self);
}

/// Inert device backing pseudo links that never touch a wire.
pub struct VirtualDevice {
    id: String,
    state: Mutex<DeviceState>,
}

impl VirtualDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(DeviceState::Working),
        }
    }
}

impl LinkIo for VirtualDevice {
    fn read(&self) -> Option<Bytes> {
        None
    }
    fn blocking_read(&self) -> Option<Bytes> {
        None
    }
    fn write(&self, _bytes: &[u8]) -> bool {
        false
    }
    fn write_buffer_empty(&self) -> bool {
        false
    }
    fn state(&self) -> DeviceState {
        *self.state.lock()
    }
    fn notify_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }
    fn component_id(&self) -> String {
        self.id.clone()
    }
    fn close(&self) {}
}

/// Fault hook: called with the write ordinal and the outgoing chunk;
/// return false to drop the chunk on the floor.
pub type FaultHook = Box<dyn Fn(u64, &mut Vec<u8>) -> bool + Send + Sync>;

/// One end of an in-memory byte pipe.
pub struct PipeDevice {
    id: String,
    session: u32,
    heartbeat: bool,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    state: Mutex<DeviceState>,
    closed: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    fault: Mutex<Option<FaultHook>>,
}

impl PipeDevice {
    /// Build a connected pair of pipe ends.
    pub fn pair(id_a: impl Into<String>, id_b: impl Into<String>) -> (PipeDevice, PipeDevice) {
        let (atx, brx) = bounded::<Bytes>(256);
        let (btx, arx) = bounded::<Bytes>(256);
        let mk = |id: String, session: u32, tx, rx| PipeDevice {
            id,
            session,
            heartbeat: false,
            tx,
            rx,
            state: Mutex::new(DeviceState::Working),
            closed: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fault: Mutex::new(None),
        };
        (mk(id_a.into(), 1, atx, arx), mk(id_b.into(), 2, btx, brx))
    }

    /// Install a fault hook for loss/corruption injection.
    pub fn set_fault(&self, hook: FaultHook) {
        *self.fault.lock() = Some(hook);
    }

    /// Enable heartbeat pings for this end.
    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }
}

impl LinkIo for PipeDevice {
    fn read(&self) -> Option<Bytes> {
        match self.rx.try_recv() {
            Ok(b) => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                Some(b)
            }
            Err(_) => None,
        }
    }

    fn blocking_read(&self) -> Option<Bytes> {
        while !self.closed.load(Ordering::Acquire) {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(b) => {
                    self.reads.fetch_add(1, Ordering::Relaxed);
                    return Some(b);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    fn write(&self, bytes: &[u8]) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        let mut chunk = bytes.to_vec();
        if let Some(hook) = self.fault.lock().as_ref() {
            if !hook(n, &mut chunk) {
                debug!(id = %self.id, ordinal = n, "pipe dropping chunk");
                return true; // Lost in transit, not a device failure.
            }
        }
        self.tx.try_send(Bytes::from(chunk)).is_ok()
    }

    fn write_buffer_empty(&self) -> bool {
        self.tx.is_empty()
    }

    fn has_heartbeat(&self) -> bool {
        self.heartbeat
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn notify_state(&self, state: DeviceState) {
        let mut cur = self.state.lock();
        if *cur != state {
            debug!(id = %self.id, ?state, "device state change");
            *cur = state;
        }
    }

    fn component_id(&self) -> String {
        self.id.clone()
    }

    fn session_id(&self) -> u32 {
        self.session
    }

    fn write_queue_len(&self) -> usize {
        self.tx.len()
    }

    fn io_count(&self, reads: bool) -> u64 {
        if reads {
            self.reads.load(Ordering::Relaxed)
        } else {
            self.writes.load(Ordering::Relaxed)
        }
    }

    fn reset_io_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    fn suspend(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_round_trip() {
        let (a, b) = PipeDevice::pair("a", "b");
        assert!(a.write(&[1, 2, 3]));
        let got = b.blocking_read().unwrap();
        assert_eq!(&got[..], &[1, 2, 3]);
        assert_eq!(a.io_count(false), 1);
        assert_eq!(b.io_count(true), 1);
    }

    #[test]
    fn test_pipe_close_unblocks_read() {
        let (a, b) = PipeDevice::pair("a", "b");
        b.close();
        assert!(b.blocking_read().is_none());
        drop(a);
    }

    #[test]
    fn test_fault_hook_drops() {
        let (a, b) = PipeDevice::pair("a", "b");
        a.set_fault(Box::new(|n, _| n != 0)); // Drop the first write only.
        assert!(a.write(&[1]));
        assert!(a.write(&[2]));
        let got = b.blocking_read().unwrap();
        assert_eq!(&got[..], &[2]);
    }

    #[test]
    fn test_virtual_device_is_inert() {
        let d = VirtualDevice::new("mediator");
        assert!(d.read().is_none());
        assert!(!d.write(&[0]));
        assert!(!d.write_buffer_empty());
        assert_eq!(d.state(), DeviceState::Working);
    }
}
