//! Loopback demo
//!
//! Wires two protocol stacks back-to-back over an in-memory pipe and pushes
//! verified traffic from A to B, optionally dropping every Nth chunk on the
//! wire to show the resend protocol recovering.
//!
//! Usage:
//!   cargo run --bin babel-loopback -- [--count N] [--drop-every N]

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use babel_link::wire;
use babel_link::{BabelMessage, LinkConfig, MessageExchange, PipeDevice};

struct DemoConfig {
    count: u32,
    drop_every: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            count: 20,
            drop_every: 0,
        }
    }
}

fn parse_args() -> DemoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DemoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().expect("count must be a number");
                    i += 1;
                }
            }
            "--drop-every" | "-d" => {
                if i + 1 < args.len() {
                    config.drop_every = args[i + 1].parse().expect("drop-every must be a number");
                    i += 1;
                }
            }
            other => {
                eprintln!("unknown option: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }
    config
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let demo = parse_args();

    // Aggressive timers so resends fire quickly in the demo.
    let link_config = LinkConfig::low_latency();
    let side_a = MessageExchange::open("side-a", "BBL-00A1-10", link_config.clone())
        .expect("open side-a");
    let side_b = MessageExchange::open("side-b", "BBL-00B2-20", link_config)
        .expect("open side-b");

    let (dev_a, dev_b) = PipeDevice::pair("pipe-a", "pipe-b");
    // Heartbeat pings from A reveal trailing gaps so B can request resends.
    let dev_a = dev_a.with_heartbeat();
    if demo.drop_every > 1 {
        let n = demo.drop_every;
        dev_a.set_fault(Box::new(move |ordinal, _| ordinal % n != n - 1));
        info!(drop_every = n, "loss injection armed on side A");
    }
    side_a
        .attach_device(Arc::new(dev_a), wire::NETIF_USER_BASE)
        .expect("attach side-a");
    side_b
        .attach_device(Arc::new(dev_b), wire::NETIF_USER_BASE)
        .expect("attach side-b");

    info!(count = demo.count, "sending verified messages A -> B");
    let mut submitted = 0u32;
    while submitted < demo.count {
        let payload = vec![submitted as u8; 8];
        let message = BabelMessage::command(
            true,
            wire::MEDIATOR_CONTROL_CMD_BASE,
            wire::ADRS_LOCAL,
            0x0001,
            0,
            wire::IDENT_TEST,
            payload,
        );
        match side_a.submit(&message) {
            Ok(()) => submitted += 1,
            Err(err) => {
                // Back-pressure: wait for the link to drain.
                info!(%err, "submit deferred");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    let mut received = 0u32;
    while received < demo.count {
        match side_b.fetch(wire::IDENT_TEST, Duration::from_secs(10)) {
            Ok(message) => {
                received += 1;
                info!(
                    received,
                    cmd = message.cmd,
                    len = message.data.len(),
                    "delivered"
                );
            }
            Err(err) => {
                eprintln!("fetch failed after {} messages: {}", received, err);
                break;
            }
        }
    }

    let link_a = side_a
        .manager()
        .get_link_driver(wire::NETIF_USER_BASE)
        .expect("link a");
    info!(
        sent_chunks = link_a.io_count(false),
        dropped = link_a.frames_dropped(),
        delivered = received,
        "done"
    );

    side_a.close();
    side_b.close();
}
