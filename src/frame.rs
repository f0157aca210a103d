//! Packet frame buffer
//!
//! Fixed-layout byte buffer view over a single wire frame, plus the metadata
//! carried alongside the wire bytes (pid/meta flags, length, input and routed
//! interface indices). Two shapes share the layout: the 6-byte handshake
//! frame and the general command frame.

use std::fmt;

use crate::wire::{self, MAX_PACKET_SIZE};

// Field offsets within the frame buffer.
const SYNC_INDEX: usize = 0;
const NEG_PID_PID_INDEX: usize = 1;
const DESTINATION_INDEX: usize = 2; // 2 bytes.
const ARG_INDEX: usize = 4;
const RECEIVER_INDEX: usize = 5; // 2 bytes.
const SENDER_INDEX: usize = 7; // 2 bytes.
const SENDER_ID_INDEX: usize = 9;
const RS_FLAGS_INDEX: usize = 10;
const COMMAND_INDEX: usize = 11;
const DATA_LENGTH_INDEX: usize = 12;
pub(crate) const DATA_ARRAY_INDEX: usize = 13;

/// One wire frame plus its off-wire metadata.
pub struct Frame {
    /// Pid in the low nibble, meta flags (resend) in the high nibble.
    pub pid_flags: u8,

    /// Total frame length including the checksum byte.
    pub pkt_len: u8,

    /// Interface the frame was received on.
    pub in_netif: u8,

    /// Interface the frame was last routed to.
    pub dest_netif: u8,

    /// Raw wire bytes.
    pub buf: [u8; MAX_PACKET_SIZE],
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        Self {
            pid_flags: 0,
            pkt_len: 0,
            in_netif: wire::NETIF_UNSET,
            dest_netif: wire::NETIF_UNSET,
            buf: [0; MAX_PACKET_SIZE],
        }
    }

    /// Pid without meta flags.
    #[inline]
    pub fn pid(&self) -> u8 {
        self.pid_flags & wire::META_FLAGS_PID
    }

    #[inline]
    pub fn sync(&self) -> u8 {
        self.buf[SYNC_INDEX]
    }
    #[inline]
    pub fn set_sync(&mut self, v: u8) {
        self.buf[SYNC_INDEX] = v;
    }

    #[inline]
    pub fn neg_pid_pid(&self) -> u8 {
        self.buf[NEG_PID_PID_INDEX]
    }
    #[inline]
    pub fn set_neg_pid_pid(&mut self, v: u8) {
        self.buf[NEG_PID_PID_INDEX] = v;
    }

    #[inline]
    pub fn destination(&self) -> u16 {
        u16::from_le_bytes([self.buf[DESTINATION_INDEX], self.buf[DESTINATION_INDEX + 1]])
    }
    #[inline]
    pub fn set_destination(&mut self, v: u16) {
        self.buf[DESTINATION_INDEX..DESTINATION_INDEX + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn arg(&self) -> u8 {
        self.buf[ARG_INDEX]
    }
    #[inline]
    pub fn set_arg(&mut self, v: u8) {
        self.buf[ARG_INDEX] = v;
    }

    #[inline]
    pub fn receiver(&self) -> u16 {
        u16::from_le_bytes([self.buf[RECEIVER_INDEX], self.buf[RECEIVER_INDEX + 1]])
    }
    #[inline]
    pub fn set_receiver(&mut self, v: u16) {
        self.buf[RECEIVER_INDEX..RECEIVER_INDEX + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn sender(&self) -> u16 {
        u16::from_le_bytes([self.buf[SENDER_INDEX], self.buf[SENDER_INDEX + 1]])
    }
    #[inline]
    pub fn set_sender(&mut self, v: u16) {
        self.buf[SENDER_INDEX..SENDER_INDEX + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn sender_id(&self) -> u8 {
        self.buf[SENDER_ID_INDEX]
    }
    #[inline]
    pub fn set_sender_id(&mut self, v: u8) {
        self.buf[SENDER_ID_INDEX] = v;
    }

    #[inline]
    pub fn flags_rs(&self) -> u8 {
        self.buf[RS_FLAGS_INDEX]
    }
    #[inline]
    pub fn set_flags_rs(&mut self, v: u8) {
        self.buf[RS_FLAGS_INDEX] = v;
    }

    #[inline]
    pub fn command(&self) -> u8 {
        self.buf[COMMAND_INDEX]
    }
    #[inline]
    pub fn set_command(&mut self, v: u8) {
        self.buf[COMMAND_INDEX] = v;
    }

    #[inline]
    pub fn data_length(&self) -> u8 {
        self.buf[DATA_LENGTH_INDEX]
    }
    #[inline]
    pub fn set_data_length(&mut self, v: u8) {
        self.buf[DATA_LENGTH_INDEX] = v;
    }

    /// The frame's data payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        let len = self.data_length() as usize;
        &self.buf[DATA_ARRAY_INDEX..DATA_ARRAY_INDEX + len]
    }

    /// Copy a payload into the data area. Caller checks capacity.
    pub fn set_data(&mut self, data: &[u8]) {
        self.buf[DATA_ARRAY_INDEX..DATA_ARRAY_INDEX + data.len()].copy_from_slice(data);
        self.set_data_length(data.len() as u8);
    }

    /// Copy metadata from another frame.
    pub fn copy_meta(&mut self, other: &Frame) {
        self.pid_flags = other.pid_flags;
        self.pkt_len = other.pkt_len;
        self.in_netif = other.in_netif;
        self.dest_netif = other.dest_netif;
    }

    /// The frame's wire bytes.
    #[inline]
    pub fn wire_bytes(&self) -> &[u8] {
        &self.buf[..self.pkt_len as usize]
    }

    /// Compute and store the checksum for a frame of `packet_len` bytes
    /// (total length including the checksum slot at the end).
    pub fn update_checksum(&mut self, packet_len: u8) {
        let len = packet_len as usize;
        let sum: u32 = self.buf[wire::CHECK_START_OFFSET..len - 1]
            .iter()
            .map(|&b| b as u32)
            .sum();
        self.buf[len - 1] = (256 - (sum % 256) as u16) as u8;
    }

    /// True if the checked region sums to 0 mod 256.
    pub fn checksum_ok(&self, packet_len: u8) -> bool {
        let len = packet_len as usize;
        let sum: u32 = self.buf[wire::CHECK_START_OFFSET..len]
            .iter()
            .map(|&b| b as u32)
            .sum();
        sum % 256 == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame{{pid={:x},len={},i={:x},d={:x},[",
            self.pid_flags, self.pkt_len, self.in_netif, self.dest_netif
        )?;
        for b in self.wire_bytes() {
            write!(f, "{:02x} ", b)?;
        }
        write!(f, "]}}")
    }
}
