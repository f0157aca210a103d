//! Message router
//!
//! Stateless routing of a fully-parsed frame to the correct link driver's
//! write queue. Every frame handed in here is either delivered to exactly
//! one queue or freed back to the pool; drop paths log and count.

use tracing::{debug, warn};

use crate::manager::NetIfManager;
use crate::pool::FrameToken;
use crate::wire;

/// Route a frame received from one of the netIfs.
///
/// Rules: a general frame addressed to this node (or the local address)
/// goes to the netIf selected by its sender-port bits — bridge traffic to
/// the bridge link, everything else to the mediator port. A foreign
/// receiver address goes back out the interface it arrived on (gateway
/// support slots in here). Handshake-pid frames are local by definition.
pub fn route_message(manager: &NetIfManager, token: FrameToken) {
    let (pid, receiver, flags_rs, in_netif) = {
        let frame = manager.pool().frame(&token);
        (
            frame.pid(),
            frame.receiver(),
            frame.flags_rs(),
            frame.in_netif,
        )
    };
    let (receiver, mut r_netif) = match pid {
        wire::PID_GENERAL | wire::PID_GENERAL_V => {
            let netif = if wire::sender_port(flags_rs) == wire::PORT_BRIDGE {
                wire::NETIF_BRIDGE_LINK
            } else {
                wire::NETIF_MEDIATOR_PORT
            };
            (receiver, netif)
        }
        _ => (wire::ADRS_LOCAL, wire::NETIF_MEDIATOR_PORT),
    };
    if receiver != wire::ADRS_LOCAL && receiver != manager.node_adrs() {
        // Remote address: return to sender's interface until a gateway
        // registers for it.
        r_netif = in_netif;
    }
    post_message(manager, token, r_netif);
}

/// Push a frame onto the write queue of `r_netif`, falling back to the
/// bridge link when the literal target is detached. Frames that cannot be
/// posted are freed.
pub fn post_message(manager: &NetIfManager, token: FrameToken, r_netif: u8) {
    let mut r_netif = r_netif;
    let mut link = manager.get_link_driver(r_netif);
    if link.is_none() {
        r_netif = wire::NETIF_UNSET;
        link = manager.get_link_driver(wire::NETIF_BRIDGE_LINK);
    }
    let Some(link) = link else {
        warn!(netif = r_netif, "unroutable: ditching message");
        manager.pool().release(token);
        return;
    };
    // Circular routing check against the prior destination netIf.
    let circular = {
        let mut frame = manager.pool().frame(&token);
        if frame.dest_netif != wire::NETIF_UNSET && frame.dest_netif == r_netif {
            true
        } else {
            frame.dest_netif = r_netif;
            if link.netif_index() == wire::NETIF_BRIDGE_LINK {
                // Carry both interface indices across the bridge in the
                // destination field so the far side can un-bridge.
                let in_netif = frame.in_netif;
                frame.set_destination(wire::bridge_pack(r_netif, in_netif));
                let len = frame.pkt_len;
                frame.update_checksum(len);
            }
            false
        }
    };
    if circular {
        warn!(netif = r_netif, "circular message: ditching message");
        link.count_drop();
        manager.pool().release(token);
        return;
    }
    if link.post_frame(token) {
        debug!(netif = link.netif_index(), "posted message");
    } else {
        warn!(netif = r_netif, "write queue full: ditching message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::device::PipeDevice;
    use crate::driver::{LinkDriver, LinkOptions, NoHooks, WriteEntry};
    use crate::manager::NetIfManager;
    use std::sync::Arc;

    fn setup() -> Arc<NetIfManager> {
        NetIfManager::new("0", "BBL-0001-0", LinkConfig::default())
    }

    fn attach(mgr: &Arc<NetIfManager>, netif: u8) -> Arc<LinkDriver> {
        let (near, _far) = PipeDevice::pair(format!("n{}", netif), format!("f{}", netif));
        let link = LinkDriver::new(
            mgr,
            Arc::new(near),
            netif,
            LinkOptions::polled_link(),
            Box::new(NoHooks),
        );
        mgr.add_driver(link.clone());
        link
    }

    fn incoming_frame(mgr: &Arc<NetIfManager>, receiver: u16, in_netif: u8) -> FrameToken {
        let token = mgr
            .factory()
            .create_general_message(false, 33, receiver, 0x0002, 0, 1, &[1])
            .unwrap();
        mgr.pool().frame(&token).in_netif = in_netif;
        token
    }

    #[test]
    fn test_local_frame_goes_to_mediator() {
        let mgr = setup();
        let mediator = attach(&mgr, wire::NETIF_MEDIATOR_PORT);
        let token = incoming_frame(&mgr, wire::ADRS_LOCAL, wire::NETIF_USER_BASE);
        route_message(&mgr, token);
        assert_eq!(mediator.write_queue.len(), 1);
        mgr.close();
    }

    #[test]
    fn test_foreign_receiver_returns_out_input_interface() {
        let mgr = setup();
        let _mediator = attach(&mgr, wire::NETIF_MEDIATOR_PORT);
        let user = attach(&mgr, wire::NETIF_USER_BASE);
        let token = incoming_frame(&mgr, 0x0099, wire::NETIF_USER_BASE);
        route_message(&mgr, token);
        assert_eq!(user.write_queue.len(), 1);
        mgr.close();
    }

    #[test]
    fn test_circular_route_dropped_and_freed() {
        let mgr = setup();
        let user = attach(&mgr, wire::NETIF_USER_BASE);
        let free_before = mgr.pool().free_count();
        let token = incoming_frame(&mgr, 0x0099, wire::NETIF_USER_BASE);
        // Recorded prior destination equals the newly computed one.
        mgr.pool().frame(&token).dest_netif = wire::NETIF_USER_BASE;
        route_message(&mgr, token);
        assert!(user.write_queue.is_empty());
        assert_eq!(mgr.pool().free_count(), free_before);
        assert_eq!(user.frames_dropped(), 1);
        mgr.close();
    }

    #[test]
    fn test_unroutable_frame_freed() {
        let mgr = setup();
        let free_before = mgr.pool().free_count();
        let token = incoming_frame(&mgr, wire::ADRS_LOCAL, wire::NETIF_USER_BASE);
        route_message(&mgr, token);
        assert_eq!(mgr.pool().free_count(), free_before);
        mgr.close();
    }

    #[test]
    fn test_bridge_frame_nibble_packed() {
        let mgr = setup();
        let bridge = attach(&mgr, wire::NETIF_BRIDGE_LINK);
        let token = mgr
            .factory()
            .create_general_message(
                false,
                33,
                wire::ADRS_LOCAL,
                0x0002,
                wire::PORT_BRIDGE << 2,
                1,
                &[1],
            )
            .unwrap();
        mgr.pool().frame(&token).in_netif = wire::NETIF_USER_BASE;
        route_message(&mgr, token);
        let (dest, ok) = bridge
            .write_queue
            .peek_map(|entry| match entry {
                WriteEntry::Frame(t) => {
                    let f = mgr.pool().frame(t);
                    (f.destination(), f.checksum_ok(f.pkt_len))
                }
                _ => panic!("expected frame"),
            })
            .unwrap();
        assert_eq!(
            wire::bridge_unpack(dest),
            (wire::NETIF_BRIDGE_LINK, wire::NETIF_USER_BASE)
        );
        assert!(ok);
        mgr.close();
    }

    #[test]
    fn test_write_queue_overflow_frees() {
        let mut config = LinkConfig::default();
        config.write_queue_capacity = 1;
        let mgr = NetIfManager::new("0", "BBL-0001-0", config);
        let mediator = attach(&mgr, wire::NETIF_MEDIATOR_PORT);
        let free_before = mgr.pool().free_count();
        for _ in 0..3 {
            let token = incoming_frame(&mgr, wire::ADRS_LOCAL, wire::NETIF_USER_BASE);
            route_message(&mgr, token);
        }
        assert_eq!(mediator.write_queue.len(), 1);
        // Two dropped frames went back to the pool.
        assert_eq!(mgr.pool().free_count(), free_before - 1);
        mgr.close();
    }
}
