//! Incoming frame decoder
//!
//! Byte-at-a-time state machine turning a raw (possibly escaped) byte stream
//! into complete handshake or general frames. One parser instance per link;
//! partial-frame state survives across calls, so callers may deliver
//! arbitrarily chunked input. The parser never blocks and consumes exactly
//! the bytes handed to it.

use tracing::{trace, warn};

use crate::pool::{FramePool, FrameToken};
use crate::wire::{self, HANDSHAKE_PACKET_SIZE, MAX_PACKET_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Sync,
    Pid,
    Header,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    None,
    Start,
    Second,
}

/// Completed inputs produced by [`PacketParser::feed`].
#[derive(Debug)]
pub enum ParserEvent {
    /// A valid 6-byte handshake frame.
    Handshake([u8; HANDSHAKE_PACKET_SIZE]),
    /// A checksum-valid general frame, stamped with input-interface metadata.
    Frame(FrameToken),
}

/// Frame decoder state machine.
pub struct PacketParser {
    netif_index: u8,
    mapping_enabled: bool,
    state: ParseState,
    esc_state: EscState,
    /// Pool buffer reserved for the general frame in flight (kept across
    /// frames when a duplicate was suppressed, so it can be reused).
    pending: Option<FrameToken>,
    scratch: [u8; MAX_PACKET_SIZE],
    chksum: u32,
    pid: u8,
    pkt_len: usize,
    data_index: usize,
    /// Frames dropped on checksum failure.
    pub bad_checksums: u64,
    /// Frames dropped on an oversized declared length.
    pub bad_lengths: u64,
}

impl PacketParser {
    pub fn new(netif_index: u8, mapping_enabled: bool) -> Self {
        let mut p = Self {
            netif_index,
            mapping_enabled,
            state: ParseState::Sync,
            esc_state: EscState::None,
            pending: None,
            scratch: [0; MAX_PACKET_SIZE],
            chksum: 0,
            pid: 0,
            pkt_len: 0,
            data_index: 0,
            bad_checksums: 0,
            bad_lengths: 0,
        };
        p.reset();
        p
    }

    /// Resynchronize to the sync marker. Any reserved pool buffer is kept
    /// for the next frame.
    pub fn reset(&mut self) {
        self.state = ParseState::Sync;
        self.esc_state = if self.mapping_enabled {
            EscState::Start
        } else {
            EscState::None
        };
    }

    /// Hand back a buffer whose frame was suppressed, for reuse.
    pub fn restore(&mut self, token: FrameToken) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(token);
    }

    /// Take the reserved buffer, if any, for release on link teardown.
    pub fn take_pending(&mut self) -> Option<FrameToken> {
        self.pending.take()
    }

    /// Consume a chunk of raw input, emitting completed frames.
    pub fn feed(&mut self, bytes: &[u8], pool: &FramePool) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        for &raw in bytes {
            let mut b = raw;
            // Escape sub-machine runs ahead of the frame machine.
            match self.esc_state {
                EscState::Second => {
                    self.esc_state = EscState::Start;
                    match b {
                        wire::BYTE_ESC_SYNC => {
                            if self.state == ParseState::Sync {
                                continue;
                            }
                            b = wire::BYTE_SYNC;
                        }
                        wire::BYTE_ESC_ESC => b = wire::BYTE_ESC,
                        _ => {}
                    }
                }
                EscState::Start => {
                    if b == wire::BYTE_ESC {
                        self.esc_state = EscState::Second;
                        continue;
                    } else if b == wire::BYTE_SYNC {
                        // Bare sync mid-frame: resynchronize.
                        self.state = ParseState::Sync;
                    }
                }
                EscState::None => {}
            }
            match self.state {
                ParseState::Sync => {
                    if b == wire::BYTE_SYNC {
                        self.state = ParseState::Pid;
                    }
                }
                ParseState::Pid => {
                    self.pid = wire::pid_of(b);
                    match self.pid {
                        wire::PID_PING | wire::PID_REPLY | wire::PID_RESEND | wire::PID_CANCEL => {
                            self.pkt_len = HANDSHAKE_PACKET_SIZE;
                        }
                        wire::PID_GENERAL | wire::PID_GENERAL_V => {
                            if self.pending.is_none() {
                                self.pending = pool.allocate();
                                if self.pending.is_none() {
                                    // Pool exhausted: shed the frame.
                                    self.state = ParseState::Sync;
                                    continue;
                                }
                            }
                            self.pkt_len = wire::GENERAL_HEADER_SIZE;
                        }
                        _ => {
                            trace!(pid = self.pid, "unknown pid");
                            self.state = ParseState::Sync;
                            continue;
                        }
                    }
                    self.scratch[wire::PACKET_SYNC_OFFSET] = wire::BYTE_SYNC;
                    self.scratch[wire::PACKET_PID_OFFSET] = b;
                    self.data_index = wire::CHECK_START_OFFSET; // Skip sync and pid.
                    self.chksum = 0;
                    self.state = ParseState::Header;
                }
                ParseState::Header => {
                    self.chksum += b as u32;
                    self.scratch[self.data_index] = b;
                    self.data_index += 1;
                    if self.data_index < self.pkt_len {
                        continue;
                    }
                    if self.pid > wire::PID_HANDSHAKE_MAX {
                        let len = self.scratch[wire::GENERAL_DATA_LENGTH_OFFSET] as usize;
                        self.pkt_len = len + wire::GENERAL_OVERHEADS_SIZE;
                        if len <= wire::GENERAL_MAX_DATA_SIZE {
                            self.state = ParseState::Data;
                            continue;
                        }
                        self.bad_lengths += 1;
                        warn!(netif = self.netif_index, len, "bad message length");
                    } else if self.chksum % 256 == 0 {
                        let mut hs = [0u8; HANDSHAKE_PACKET_SIZE];
                        hs.copy_from_slice(&self.scratch[..HANDSHAKE_PACKET_SIZE]);
                        events.push(ParserEvent::Handshake(hs));
                    } else {
                        self.bad_checksums += 1;
                        warn!(netif = self.netif_index, "bad header chksum");
                    }
                    self.state = ParseState::Sync;
                }
                ParseState::Data => {
                    self.chksum += b as u32;
                    self.scratch[self.data_index] = b;
                    self.data_index += 1;
                    if self.data_index < self.pkt_len {
                        continue;
                    }
                    if self.chksum % 256 != 0 {
                        // Transfer error, ditch the frame.
                        self.bad_checksums += 1;
                        warn!(netif = self.netif_index, "bad message chksum");
                        self.state = ParseState::Sync;
                        continue;
                    }
                    // Valid frame: fill in the missing details and hand over.
                    let Some(token) = self.pending.take() else {
                        self.state = ParseState::Sync;
                        continue;
                    };
                    {
                        let mut frame = pool.frame(&token);
                        frame.buf[..self.pkt_len].copy_from_slice(&self.scratch[..self.pkt_len]);
                        frame.pid_flags = self.pid;
                        frame.pkt_len = self.pkt_len as u8;
                        frame.in_netif = self.netif_index;
                        frame.dest_netif = wire::NETIF_UNSET;
                    }
                    events.push(ParserEvent::Frame(token));
                    self.state = ParseState::Sync;
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn handshake_bytes(pid: u8, destination: u16, arg: u8) -> Vec<u8> {
        let mut b = Frame::new();
        b.pkt_len = HANDSHAKE_PACKET_SIZE as u8;
        b.set_sync(wire::BYTE_SYNC);
        b.set_neg_pid_pid(wire::pid_with_check(pid));
        b.set_destination(destination);
        b.set_arg(arg);
        b.update_checksum(b.pkt_len);
        b.wire_bytes().to_vec()
    }

    fn general_bytes(verified: bool, cmd: u8, data: &[u8]) -> Vec<u8> {
        let pid = if verified {
            wire::PID_GENERAL_V
        } else {
            wire::PID_GENERAL
        };
        let mut b = Frame::new();
        b.pkt_len = (wire::GENERAL_OVERHEADS_SIZE + data.len()) as u8;
        b.set_sync(wire::BYTE_SYNC);
        b.set_neg_pid_pid(wire::pid_with_check(pid));
        b.set_destination(0);
        b.set_arg(0);
        b.set_receiver(wire::ADRS_LOCAL);
        b.set_sender(0x0005);
        b.set_sender_id(3);
        b.set_flags_rs(0);
        b.set_command(cmd);
        b.set_data(data);
        b.update_checksum(b.pkt_len);
        b.wire_bytes().to_vec()
    }

    #[test]
    fn test_parse_handshake() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(2, false);
        let events = p.feed(&handshake_bytes(wire::PID_PING, 0, 7), &pool);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ParserEvent::Handshake(hs) => {
                assert_eq!(wire::pid_of(hs[wire::PACKET_PID_OFFSET]), wire::PID_PING);
                assert_eq!(hs[wire::PACKET_ARG_OFFSET], 7);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_general_one_byte_at_a_time() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(2, false);
        let raw = general_bytes(true, 42, &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
        let mut events = Vec::new();
        for &b in &raw {
            events.extend(p.feed(&[b], &pool));
        }
        assert_eq!(events.len(), 1);
        match events.pop().unwrap() {
            ParserEvent::Frame(token) => {
                let frame = pool.frame(&token);
                assert_eq!(frame.pid(), wire::PID_GENERAL_V);
                assert_eq!(frame.command(), 42);
                assert_eq!(frame.data(), &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
                assert_eq!(frame.in_netif, 2);
                drop(frame);
                pool.release(token);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(0, false);
        let mut raw = general_bytes(false, 1, &[1, 2, 3]);
        let last = raw.len() - 1;
        raw[last] = raw[last].wrapping_add(1);
        let events = p.feed(&raw, &pool);
        assert!(events.is_empty());
        assert_eq!(p.bad_checksums, 1);
        // The reserved buffer is retained for the next frame, not leaked.
        let events = p.feed(&general_bytes(false, 1, &[1, 2, 3]), &pool);
        assert_eq!(events.len(), 1);
        if let Some(ParserEvent::Frame(t)) = events.into_iter().next() {
            pool.release(t);
        }
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_unknown_pid_resyncs() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(0, false);
        // Sync then junk pid, then a valid handshake.
        let mut raw = vec![wire::BYTE_SYNC, 0x0e];
        raw.extend(handshake_bytes(wire::PID_REPLY, 0, 1));
        let events = p.feed(&raw, &pool);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_pool_exhaustion_sheds_frame() {
        let pool = FramePool::new(1);
        let hold = pool.allocate().unwrap();
        let mut p = PacketParser::new(0, false);
        let events = p.feed(&general_bytes(false, 1, &[1]), &pool);
        assert!(events.is_empty());
        pool.release(hold);
    }

    #[test]
    fn test_escape_round_trip_all_byte_values() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(1, true);
        // Payload crossing every byte value, including SYNC and ESC.
        let mut payload = Vec::new();
        for v in 0..wire::GENERAL_MAX_DATA_SIZE {
            payload.push(match v % 4 {
                0 => wire::BYTE_SYNC,
                1 => wire::BYTE_ESC,
                _ => (v * 7) as u8,
            });
        }
        let raw = general_bytes(true, 9, &payload);
        let mut escaped = Vec::new();
        wire::escape_frame(&raw, &mut escaped);
        let mut events = Vec::new();
        for chunk in escaped.chunks(3) {
            events.extend(p.feed(chunk, &pool));
        }
        assert_eq!(events.len(), 1);
        match events.pop().unwrap() {
            ParserEvent::Frame(token) => {
                assert_eq!(pool.frame(&token).data(), &payload[..]);
                pool.release(token);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_escape_round_trip_random_payloads() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let pool = FramePool::new(4);
        let mut rng = StdRng::seed_from_u64(0x5AA5);
        for _ in 0..50 {
            let len = rng.gen_range(0..=wire::GENERAL_MAX_DATA_SIZE);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
            let raw = general_bytes(true, 9, &payload);
            let mut escaped = Vec::new();
            wire::escape_frame(&raw, &mut escaped);
            let mut p = PacketParser::new(1, true);
            let mut events = p.feed(&escaped, &pool);
            assert_eq!(events.len(), 1);
            match events.pop().unwrap() {
                ParserEvent::Frame(token) => {
                    assert_eq!(pool.frame(&token).data(), &payload[..]);
                    pool.release(token);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_mid_frame_sync_resynchronizes() {
        let pool = FramePool::new(4);
        let mut p = PacketParser::new(1, true);
        // Start a general frame, then inject a bare sync and a full frame.
        let good = general_bytes(false, 5, &[0x10, 0x20]);
        let mut escaped = Vec::new();
        wire::escape_frame(&good, &mut escaped);
        let mut raw = escaped[..4].to_vec();
        raw.extend(&escaped);
        let events = p.feed(&raw, &pool);
        assert_eq!(events.len(), 1);
        if let Some(ParserEvent::Frame(t)) = events.into_iter().next() {
            pool.release(t);
        }
    }
}
