//! Wire-level protocol constants
//!
//! - Sync/escape bytes and the byte-mapping table
//! - Pid codes and meta flags
//! - Fixed packet offsets and size arithmetic
//! - Standard mediator command codes

/// Start-of-frame marker.
pub const BYTE_SYNC: u8 = 0x55;
/// Escape code for the following byte.
pub const BYTE_ESC: u8 = 0xAA;
/// Following ESC, maps to a plain 0x55 byte.
pub const BYTE_ESC_SYNC: u8 = 0x11;
/// Following ESC, maps to a plain 0xAA byte.
pub const BYTE_ESC_ESC: u8 = 0x22;

/// Max sequence value before cycling. Must be < 232.
pub const VNO_SIZE: u8 = 200;
/// Amount by which the next valid Vno may differ from the last.
pub const VNO_DELTA: u8 = 16;
/// Indicates a null Vno.
pub const VNO_NULL: u8 = 0xff;

/// Ping arg telling the receiver to flush/clear the link.
pub const PID_ARG_RESET: u8 = 0xfc;
/// Ping arg broadcasting the sender as a slave requesting a master address.
pub const PID_ARG_SLAVE: u8 = 0xfd;
/// Ping arg broadcasting the sender as the master of a multi link.
pub const PID_ARG_MULTI: u8 = 0xfe;
/// Ping arg broadcasting the sender as the master of a uni link.
pub const PID_ARG_MASTER: u8 = 0xff;
/// Number of baud rate codes reserved below PID_ARG_RESET.
pub const PID_ARG_BAUD_NUM: u8 = 10;
/// First baud rate code (9600).
pub const PID_ARG_BAUD_MIN: u8 = PID_ARG_RESET - PID_ARG_BAUD_NUM;

pub const META_FLAGS_NONE: u8 = 0x00;
/// Set indicates a resend carrying its original Vno.
pub const META_FLAGS_RESEND: u8 = 0x10;
/// For extracting the pid from the meta flags byte.
pub const META_FLAGS_PID: u8 = 0x0f;
pub const META_FLAGS_MASK: u8 = 0xf0;

/// Set indicates the message is inbound, a reply.
pub const MESSAGE_FLAGS_IS_REPLY: u8 = 0x10;
/// Set indicates the sender expects acknowledgment.
pub const MESSAGE_FLAGS_ACK: u8 = 0x20;
/// Message has order details in data after cmd.
pub const MESSAGE_FLAGS_ORDER: u8 = 0x40;
pub const MESSAGE_FLAGS_MASK: u8 = 0xf0;
pub const MESSAGE_PORTS_MASK: u8 = 0x0f;

// Pid / packet kind.
pub const PID_PING: u8 = 0x0;
pub const PID_REPLY: u8 = 0x1;
pub const PID_RESEND: u8 = 0x2;
pub const PID_CANCEL: u8 = 0x3;
pub const PID_GENERAL: u8 = 0x4;
pub const PID_GENERAL_V: u8 = 0x5;
pub const PID_HANDSHAKE_MAX: u8 = 0x3;
pub const PID_MASK: u8 = 0xf;

/// Broadcast to all devices.
pub const ADRS_BROADCAST: u16 = 0xffff;
/// Multicast to all devices in a group.
pub const ADRS_MULTICAST: u16 = 0xff00;
/// Refers to the device itself.
pub const ADRS_LOCAL: u16 = 0x0000;

// Dual NetIf and port numbers.
pub const NETIF_MEDIATOR_PORT: u8 = 0x0;
pub const NETIF_BRIDGE_PORT: u8 = 0x1;
pub const NETIF_C_PORT: u8 = 0x2;
pub const NETIF_D_PORT: u8 = 0x3;
pub const NETIF_BRIDGE_LINK: u8 = 0x4;
/// First user netIf.
pub const NETIF_USER_BASE: u8 = 0x5;
/// Indicates netIf unset.
pub const NETIF_UNSET: u8 = 0xf;
/// Maximum number of netIfs.
pub const NETIF_NUM_SIZE: u8 = 0xf;

pub const PORT_MEDIATOR: u8 = 0x0;
pub const PORT_BRIDGE: u8 = 0x1;
pub const PORT_C: u8 = 0x2;
pub const PORT_D: u8 = 0x3;
pub const PORT_MASK: u8 = 0x3;

// Standard device commands {1 to 15}.
pub const MEDIATOR_DEVICE_RESET: u8 = 1;
pub const MEDIATOR_DEVICE_STATUS: u8 = 2;
pub const MEDIATOR_DEVICE_TICKER: u8 = 3;
pub const MEDIATOR_DEVICE_SETSN: u8 = 4;
pub const MEDIATOR_DEVICE_GETSN: u8 = 5;
pub const MEDIATOR_DEVICE_ERASE: u8 = 6;
pub const MEDIATOR_DEVICE_SETKEY: u8 = 7;
pub const MEDIATOR_DEVICE_READVAR: u8 = 8;
pub const MEDIATOR_DEVICE_WRITEVAR: u8 = 9;
pub const MEDIATOR_DEVICE_ISOVAR: u8 = 10;
pub const MEDIATOR_DEVICE_ISOMONVAR: u8 = 11;
pub const MEDIATOR_DEVICE_ISOMSG: u8 = 12;
pub const MEDIATOR_DEVICE_LOG: u8 = 13;

// Connection commands {16 to 31}.
pub const MEDIATOR_CONNECT_ATTACH: u8 = 16;
pub const MEDIATOR_CONNECT_DETACH: u8 = 17;
pub const MEDIATOR_CONNECT_GATEWAY: u8 = 18;

/// First control command code available to the user.
pub const MEDIATOR_CONTROL_CMD_BASE: u8 = 32;

// Packet offsets. The checksum overhead is treated as part of the data array.
pub const PACKET_SYNC_OFFSET: usize = 0;
pub const PACKET_PID_OFFSET: usize = 1;
/// First byte covered by the checksum.
pub const CHECK_START_OFFSET: usize = 2;
pub const PACKET_LINKID_OFFSET: usize = 2;
pub const PACKET_ARG_OFFSET: usize = 4;

/// Based on the max size of a usb packet.
pub const MAX_PACKET_SIZE: usize = 64;
pub const ADDRESS_PARAMS_SIZE: usize = 6;
pub const PACKET_HEADER_SIZE: usize = 5;
pub const CHECKSUM_SIZE: usize = 1;
pub const HANDSHAKE_PACKET_SIZE: usize = PACKET_HEADER_SIZE + CHECKSUM_SIZE;
pub const HANDSHAKE_CHECK_SIZE: usize = HANDSHAKE_PACKET_SIZE - CHECK_START_OFFSET;
/// Command, data length.
pub const GENERAL_TRAITS_SIZE: usize = 2;
pub const GENERAL_CONTENT_SIZE: usize = ADDRESS_PARAMS_SIZE + GENERAL_TRAITS_SIZE;
pub const GENERAL_HEADER_SIZE: usize = PACKET_HEADER_SIZE + GENERAL_CONTENT_SIZE;
pub const GENERAL_OVERHEADS_SIZE: usize = GENERAL_HEADER_SIZE + CHECKSUM_SIZE;
pub const GENERAL_MAX_DATA_SIZE: usize = MAX_PACKET_SIZE - GENERAL_OVERHEADS_SIZE;
/// Max serial number size as ascii rather than unicode.
pub const SERIAL_NUM_ASCII_SIZE: usize = 32;

pub const GENERAL_DATA_LENGTH_OFFSET: usize = GENERAL_HEADER_SIZE - 1;
pub const GENERAL_DATA_ARRAY_OFFSET: usize = GENERAL_HEADER_SIZE;

// Message identifiers used to distinguish the origin of replies.
pub const IDENT_MEDIATOR: u8 = 0x00;
pub const IDENT_BRIDGE: u8 = 0x01;
pub const IDENT_C: u8 = 0x02;
pub const IDENT_D: u8 = 0x03;
pub const IDENT_READ: u8 = 0x04;
pub const IDENT_WRITE: u8 = 0x05;
pub const IDENT_VERIFY: u8 = 0x06;
/// For connection monitoring.
pub const IDENT_MONITOR: u8 = 0x07;
pub const IDENT_CONTROL: u8 = 0x08;
pub const IDENT_COMMS: u8 = 0x09;
pub const IDENT_TEST: u8 = 0x0A;
/// First user ident.
pub const IDENT_USER: u8 = 0x10;

/// Build the pid byte: pid in the low nibble, negated pid in the high nibble.
#[inline]
pub fn pid_with_check(pid: u8) -> u8 {
    (pid & PID_MASK) | ((!pid & PID_MASK) << 4)
}

/// Extract the pid from a received pid byte.
#[inline]
pub fn pid_of(byte: u8) -> u8 {
    byte & PID_MASK
}

/// Receiver port bits of a flagsRS byte (bits 0-1).
#[inline]
pub fn receiver_port(flags_rs: u8) -> u8 {
    flags_rs & PORT_MASK
}

/// Sender port bits of a flagsRS byte (bits 2-3).
#[inline]
pub fn sender_port(flags_rs: u8) -> u8 {
    (flags_rs >> 2) & PORT_MASK
}

/// Swap the two 2-bit port fields in the low nibble of a flagsRS byte.
#[inline]
pub fn swap_ports(flags_rs: u8) -> u8 {
    let ports = flags_rs & MESSAGE_PORTS_MASK;
    let ports = ((ports << 2) | (ports >> 2)) & MESSAGE_PORTS_MASK;
    ports | (flags_rs & MESSAGE_FLAGS_MASK)
}

/// Pack two interface indices into the bridge destination word.
/// The low byte carries (dest << 4) | input, the high byte its negation.
#[inline]
pub fn bridge_pack(dest_netif: u8, input_netif: u8) -> u16 {
    let netifs = (dest_netif << 4) | (input_netif & 0x0f);
    (((256 - netifs as u16) & 0xff) << 8) | netifs as u16
}

/// Unpack a bridge destination word into (dest, input) interface indices.
#[inline]
pub fn bridge_unpack(destination: u16) -> (u8, u8) {
    let netifs = (destination & 0xff) as u8;
    (netifs >> 4, netifs & 0x0f)
}

/// Escape a raw frame for a byte-mapped link. The leading sync byte is
/// emitted verbatim; every later SYNC or ESC byte becomes an escape pair.
pub fn escape_frame(raw: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let mut iter = raw.iter();
    if let Some(&sync) = iter.next() {
        out.push(sync);
    }
    for &c in iter {
        match c {
            BYTE_SYNC => {
                out.push(BYTE_ESC);
                out.push(BYTE_ESC_SYNC);
            }
            BYTE_ESC => {
                out.push(BYTE_ESC);
                out.push(BYTE_ESC_ESC);
            }
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_with_check() {
        assert_eq!(pid_with_check(PID_PING), 0xf0);
        assert_eq!(pid_with_check(PID_GENERAL_V), 0xa5);
        assert_eq!(pid_of(pid_with_check(PID_RESEND)), PID_RESEND);
    }

    #[test]
    fn test_size_arithmetic() {
        assert_eq!(HANDSHAKE_PACKET_SIZE, 6);
        assert_eq!(GENERAL_HEADER_SIZE, 13);
        assert_eq!(GENERAL_MAX_DATA_SIZE, MAX_PACKET_SIZE - GENERAL_HEADER_SIZE - 1);
    }

    #[test]
    fn test_swap_ports() {
        let flags = MESSAGE_FLAGS_IS_REPLY | (PORT_BRIDGE << 2) | PORT_C;
        let swapped = swap_ports(flags);
        assert_eq!(receiver_port(swapped), PORT_BRIDGE);
        assert_eq!(sender_port(swapped), PORT_C);
        assert_eq!(swapped & MESSAGE_FLAGS_MASK, MESSAGE_FLAGS_IS_REPLY);
    }

    #[test]
    fn test_bridge_pack_unpack() {
        let word = bridge_pack(NETIF_C_PORT, NETIF_USER_BASE);
        assert_eq!(bridge_unpack(word), (NETIF_C_PORT, NETIF_USER_BASE));
    }

    #[test]
    fn test_escape_leaves_leading_sync() {
        let raw = [BYTE_SYNC, 0x01, BYTE_SYNC, BYTE_ESC, 0x02];
        let mut out = Vec::new();
        escape_frame(&raw, &mut out);
        assert_eq!(
            out,
            vec![
                BYTE_SYNC,
                0x01,
                BYTE_ESC,
                BYTE_ESC_SYNC,
                BYTE_ESC,
                BYTE_ESC_ESC,
                0x02
            ]
        );
    }
}
