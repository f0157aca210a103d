//! Packet factory
//!
//! Allocates a pool frame and fills in a well-formed general command frame.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{FramePool, FrameToken};
use crate::wire;

pub struct PacketFactory {
    pool: Arc<FramePool>,
}

impl PacketFactory {
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self { pool }
    }

    /// Build a general command frame.
    ///
    /// Fails with [`Error::PoolExhausted`] when no buffer is free (a
    /// back-pressure signal) and [`Error::FrameTooLarge`] when the payload
    /// exceeds the per-frame data capacity.
    #[allow(clippy::too_many_arguments)]
    pub fn create_general_message(
        &self,
        verified: bool,
        cmd: u8,
        receiver: u16,
        sender: u16,
        flags_rs: u8,
        sender_id: u8,
        data: &[u8],
    ) -> Result<FrameToken> {
        if data.len() > wire::GENERAL_MAX_DATA_SIZE {
            return Err(Error::FrameTooLarge {
                len: data.len(),
                max: wire::GENERAL_MAX_DATA_SIZE,
            });
        }
        let token = self.pool.allocate().ok_or(Error::PoolExhausted)?;
        let pid = if verified {
            wire::PID_GENERAL_V
        } else {
            wire::PID_GENERAL
        };
        let mut frame = self.pool.frame(&token);
        frame.pid_flags = pid;
        frame.in_netif = wire::NETIF_UNSET;
        frame.dest_netif = wire::NETIF_UNSET;
        frame.pkt_len = (wire::GENERAL_OVERHEADS_SIZE + data.len()) as u8;
        frame.set_sync(wire::BYTE_SYNC);
        frame.set_neg_pid_pid(wire::pid_with_check(pid));
        frame.set_destination(wire::ADRS_LOCAL);
        frame.set_arg(0);
        frame.set_receiver(receiver);
        frame.set_sender(sender);
        frame.set_sender_id(sender_id);
        frame.set_flags_rs(flags_rs);
        frame.set_command(cmd);
        frame.set_data(data);
        let len = frame.pkt_len;
        frame.update_checksum(len);
        drop(frame);
        Ok(token)
    }
}
