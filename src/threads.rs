//! Per-link I/O threads
//!
//! Three loops started and stopped together when a link runs threaded:
//! - scheduler: periodic service work, responsiveness check, heartbeat,
//!   resend protocol tick
//! - reader: blocking reads feeding the parser
//! - writer: drains the write queue whenever it turns non-empty
//!
//! Shutdown is signalled over a channel (dropping the sender disconnects
//! it), the write queue is closed to wake the writer, and the device is
//! suspended to abort any pending blocking read.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::device::DeviceState;
use crate::driver::{LinkDriver, WriteOutcome};

fn stopped(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
}

pub struct LinkIoThreads {
    stop_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl LinkIoThreads {
    /// Spawn the thread trio for a link. The writer always runs; the
    /// scheduler runs for IO or task links; the reader only for IO links.
    pub fn start(link: Arc<LinkDriver>) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let mut handles = Vec::new();

        {
            let link = link.clone();
            let stop = stop_rx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("babel-write-{}", link.netif_index()))
                    .spawn(move || writer_loop(&link, &stop))
                    .expect("spawn writer"),
            );
        }
        if link.does_io() || link.has_tasks() {
            let link2 = link.clone();
            let stop = stop_rx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("babel-sched-{}", link.netif_index()))
                    .spawn(move || scheduler_loop(&link2, &stop))
                    .expect("spawn scheduler"),
            );
        }
        if link.does_io() {
            let link2 = link.clone();
            let stop = stop_rx;
            handles.push(
                std::thread::Builder::new()
                    .name(format!("babel-read-{}", link.netif_index()))
                    .spawn(move || reader_loop(&link2, &stop))
                    .expect("spawn reader"),
            );
        }
        debug!(netif = link.netif_index(), "link threads started");
        Self {
            stop_tx: Some(stop_tx),
            handles,
        }
    }

    /// Signal every loop, wake blocked waits, and join.
    pub fn stop(mut self, link: &LinkDriver) {
        // Dropping the sender disconnects the stop channel.
        self.stop_tx.take();
        link.write_queue.close();
        link.device().suspend();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        trace!(netif = link.netif_index(), "link threads joined");
    }
}

/// Regular actions on the link: service hook, responsiveness marking,
/// heartbeat ping, resend protocol.
fn scheduler_loop(link: &Arc<LinkDriver>, stop: &Receiver<()>) {
    let interval = Duration::from_millis(link.config().scheduler_interval_ms);
    let response_interval = Duration::from_millis(link.config().response_interval_ms);
    let mut last_response_check = Instant::now();
    loop {
        let now = Instant::now();
        if link.has_tasks() {
            link.hooks().service_tick(link, now);
        }
        if link.does_io() {
            if now.duration_since(last_response_check) > response_interval {
                last_response_check = now;
                if link.take_has_read() {
                    if link.device().state() == DeviceState::Unresponsive {
                        link.device().notify_state(DeviceState::Working);
                    }
                } else if link.device().state() == DeviceState::Working {
                    link.device().notify_state(DeviceState::Unresponsive);
                }
            }
            if link.device().has_heartbeat() && link.write_queue_size() == 0 {
                link.link_ping();
            }
            if !link.missing_queue.is_empty() {
                link.monitor.link_protocol(link);
            }
        }
        match stop.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
}

/// Convert the raw byte stream into frames.
fn reader_loop(link: &Arc<LinkDriver>, stop: &Receiver<()>) {
    while !stopped(stop) {
        link.link_read(true);
    }
}

/// Pop messages off the write queue and send them down the link.
fn writer_loop(link: &Arc<LinkDriver>, stop: &Receiver<()>) {
    loop {
        if stopped(stop) {
            break;
        }
        if !link.write_queue.wait_nonempty(Duration::from_millis(100)) {
            if link.write_queue.is_closed() {
                break;
            }
            continue;
        }
        if link.link_write() == WriteOutcome::Retry {
            // Device busy: cancellable pause instead of a spin.
            match stop.recv_timeout(Duration::from_millis(5)) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
    }
}
