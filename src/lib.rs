//! # babel-link
//!
//! Reliable framed datagrams over unreliable serial-style links.
//!
//! ## Core pieces
//! - **Framing**: sync-marked, checksummed frames with optional byte
//!   mapping (SYNC/ESC stuffing) per link
//! - **Reliability**: sequence-numbered verified frames with resend and
//!   verify/missing queues, NACK-style recovery
//! - **Scheduling**: per-link scheduler/reader/writer threads, or a single
//!   poll call for unthreaded links
//! - **Routing**: up to 16 interfaces per manager, bridge relaying, local
//!   mediator delivery
//! - **Exchange**: submit/fetch message surface for shells and scripting

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod factory;
pub mod frame;
pub mod manager;
pub mod monitor;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod router;
pub mod serial;
pub mod threads;
pub mod transaction;
pub mod wire;

pub use config::LinkConfig;
pub use device::{BaudAction, DeviceState, LinkIo, PipeDevice, VirtualDevice};
pub use driver::{LinkDriver, LinkHooks, LinkOptions, NoHooks, WriteEntry, WriteOutcome};
pub use error::{Error, Result};
pub use exchange::{BabelMessage, ExchangeRegistry, MessageExchange};
pub use factory::PacketFactory;
pub use frame::Frame;
pub use manager::{NetIfManager, RoutingSnapshot};
pub use monitor::{LinkMonitor, VerifyAction};
pub use parser::{PacketParser, ParserEvent};
pub use pool::{FramePool, FrameToken};
pub use transaction::{DispatchAction, FinishAction, MessageTransaction};

/// Protocol version spoken on the wire.
pub const PROTOCOL_VERSION: u8 = 1;
