//! Message exchange
//!
//! The surface the shell/scripting collaborators consume:
//! - submit a fully-built message for transmission
//! - fetch the next received message for a logical message-id queue
//! - query queue depths
//! - open/close a named exchange bound to a master serial and its links
//! - map device-id patterns to an exchange and interface number
//!
//! Each exchange owns a manager plus the mediator pseudo link; frames the
//! router delivers locally are decoded into [`BabelMessage`]s and relayed to
//! the per-ident incoming queues.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::device::{DeviceState, LinkIo};
use crate::driver::{LinkDriver, LinkHooks, LinkOptions};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::manager::NetIfManager;
use crate::pool::FrameToken;
use crate::router;
use crate::transaction::DispatchAction;
use crate::wire;

/// Friendly view of a general frame.
#[derive(Debug, Clone)]
pub struct BabelMessage {
    pub verified: bool,
    pub receiver: u16,
    pub sender: u16,
    /// Logical message id distinguishing the origin of replies.
    pub sender_id: u8,
    pub flags_rs: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
    /// Interface the message arrived on (incoming only).
    pub incoming_netif: u8,
    /// How an outgoing message is dispatched.
    pub dispatch: DispatchAction,
    /// Target interface for [`DispatchAction::PostToNetIf`];
    /// `NETIF_UNSET` selects the default user link.
    pub post_netif: u8,
}

impl BabelMessage {
    /// Build an outgoing command message.
    pub fn command(
        verified: bool,
        cmd: u8,
        receiver: u16,
        sender: u16,
        flags_rs: u8,
        ident: u8,
        data: Vec<u8>,
    ) -> Self {
        Self {
            verified,
            receiver,
            sender,
            sender_id: ident,
            flags_rs,
            cmd,
            data,
            incoming_netif: wire::NETIF_UNSET,
            dispatch: DispatchAction::PostToNetIf,
            post_netif: wire::NETIF_UNSET,
        }
    }

    /// Decode a received general frame. Handshake frames have no message
    /// form.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let pid = frame.pid();
        if pid != wire::PID_GENERAL && pid != wire::PID_GENERAL_V {
            return None;
        }
        Some(Self {
            verified: pid == wire::PID_GENERAL_V,
            receiver: frame.receiver(),
            sender: frame.sender(),
            sender_id: frame.sender_id(),
            flags_rs: frame.flags_rs(),
            cmd: frame.command(),
            data: frame.data().to_vec(),
            incoming_netif: frame.in_netif,
            dispatch: DispatchAction::PostToNone,
            post_netif: wire::NETIF_UNSET,
        })
    }
}

/// Hooks for the mediator pseudo link: locally-routed frames become
/// incoming messages on the owning exchange.
struct MediatorHooks {
    exchange: Weak<MessageExchange>,
}

impl LinkHooks for MediatorHooks {
    fn handle_message(&self, link: &LinkDriver, token: FrameToken) -> Option<FrameToken> {
        if let Some(exchange) = self.exchange.upgrade() {
            let message = BabelMessage::from_frame(&link.pool().frame(&token));
            if let Some(message) = message {
                exchange.deliver(message);
            }
        }
        // Caller frees the raw frame.
        Some(token)
    }
}

type IdentQueue = (Sender<BabelMessage>, Receiver<BabelMessage>);

/// A named message exchange over one manager.
pub struct MessageExchange {
    name: String,
    manager: Arc<NetIfManager>,
    incoming: DashMap<u8, IdentQueue>,
}

impl MessageExchange {
    /// Open an exchange: builds the manager, attaches the mediator link and
    /// starts it.
    pub fn open(name: &str, master_sn: &str, config: LinkConfig) -> Result<Arc<Self>> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::BadExchangeName(name.to_string()));
        }
        let manager = NetIfManager::new(name, master_sn, config);
        let exchange = Arc::new_cyclic(|weak: &Weak<MessageExchange>| {
            let mediator = LinkDriver::new(
                &manager,
                Arc::new(crate::device::VirtualDevice::new("Mediator")),
                wire::NETIF_MEDIATOR_PORT,
                LinkOptions::handler_link(),
                Box::new(MediatorHooks {
                    exchange: weak.clone(),
                }),
            );
            manager.add_driver(mediator);
            Self {
                name: name.to_string(),
                manager: manager.clone(),
                incoming: DashMap::new(),
            }
        });
        exchange.manager.start();
        info!(name, "exchange opened");
        Ok(exchange)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<NetIfManager> {
        &self.manager
    }

    /// Attach a device link to this exchange. The device must not already
    /// back another link.
    pub fn attach_device(&self, device: Arc<dyn LinkIo>, netif_index: u8) -> Result<()> {
        if self
            .manager
            .get_link_driver_by_id(&device.component_id())
            .is_some()
        {
            return Err(Error::NetIfInUse { netif: netif_index });
        }
        let link = LinkDriver::new(
            &self.manager,
            device,
            netif_index,
            LinkOptions::io_link(),
            Box::new(crate::driver::NoHooks),
        );
        self.manager.add_driver(link.clone());
        link.start_link_driver();
        Ok(())
    }

    /// Detach and close a device link.
    pub fn detach_device(&self, netif_index: u8) {
        self.manager.remove_driver(netif_index);
    }

    /// Submit a message for transmission.
    ///
    /// Defers with [`Error::OutgoingFull`] when the target link's write
    /// queue is above its water mark, and refuses unhealthy links.
    pub fn submit(&self, message: &BabelMessage) -> Result<()> {
        let out_netif = if message.post_netif == wire::NETIF_UNSET {
            wire::NETIF_USER_BASE
        } else {
            message.post_netif
        };
        let link = self
            .manager
            .get_link_driver(out_netif)
            .ok_or(Error::NoSuchNetIf { netif: out_netif })?;
        if link.write_queue_size() > self.manager.config().write_queue_watermark {
            return Err(Error::OutgoingFull {
                capacity: link.write_queue.capacity(),
            });
        }
        if link.component_state() != DeviceState::Working {
            return Err(Error::LinkClosed);
        }
        let token = self.manager.factory().create_general_message(
            message.verified,
            message.cmd,
            message.receiver,
            message.sender,
            message.flags_rs,
            message.sender_id,
            &message.data,
        )?;
        match message.dispatch {
            DispatchAction::SendToRouter => router::route_message(&self.manager, token),
            _ => router::post_message(&self.manager, token, out_netif),
        }
        debug!(name = %self.name, cmd = message.cmd, "message submitted");
        Ok(())
    }

    fn ident_queue(&self, ident: u8) -> IdentQueue {
        self.incoming
            .entry(ident)
            .or_insert_with(unbounded)
            .value()
            .clone()
    }

    /// Relay an incoming message to its ident queue.
    fn deliver(&self, message: BabelMessage) {
        let (tx, _) = self.ident_queue(message.sender_id);
        let _ = tx.send(message);
    }

    /// Blocking fetch of the next message for `ident`.
    pub fn fetch(&self, ident: u8, timeout: Duration) -> Result<BabelMessage> {
        let (_, rx) = self.ident_queue(ident);
        rx.recv_timeout(timeout).map_err(|_| Error::FetchTimeout)
    }

    /// Messages waiting on an ident queue.
    pub fn incoming_depth(&self, ident: u8) -> usize {
        let (_, rx) = self.ident_queue(ident);
        rx.len()
    }

    /// Frames waiting to go out on a link.
    pub fn outgoing_depth(&self, netif_index: u8) -> usize {
        self.manager.write_queue_size(netif_index).unwrap_or(0)
    }

    /// Stop the manager and every link.
    pub fn close(&self) {
        self.manager.close();
        info!(name = %self.name, "exchange closed");
    }
}

/// Explicitly-owned registry of named exchanges plus device-id bindings.
#[derive(Default)]
pub struct ExchangeRegistry {
    exchanges: DashMap<String, Arc<MessageExchange>>,
    /// device-id pattern ('*' suffix wildcard) -> (exchange name, netif).
    bindings: DashMap<String, (String, u8)>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str, master_sn: &str, config: LinkConfig) -> Result<Arc<MessageExchange>> {
        if self.exchanges.contains_key(name) {
            return Err(Error::BadExchangeName(name.to_string()));
        }
        let exchange = MessageExchange::open(name, master_sn, config)?;
        self.exchanges.insert(name.to_string(), exchange.clone());
        Ok(exchange)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MessageExchange>> {
        self.exchanges.get(name).map(|e| e.value().clone())
    }

    pub fn close(&self, name: &str) -> Result<()> {
        let (_, exchange) = self
            .exchanges
            .remove(name)
            .ok_or_else(|| Error::BadExchangeName(name.to_string()))?;
        exchange.close();
        Ok(())
    }

    /// Map devices matching `pattern` to an exchange and interface number.
    pub fn bind_device(&self, pattern: &str, exchange: &str, netif_index: u8) {
        self.bindings
            .insert(pattern.to_string(), (exchange.to_string(), netif_index));
    }

    /// Resolve a concrete device id against the registered patterns.
    pub fn resolve_device(&self, device_id: &str) -> Option<(Arc<MessageExchange>, u8)> {
        for entry in self.bindings.iter() {
            let pattern = entry.key();
            let matched = match pattern.strip_suffix('*') {
                Some(prefix) => device_id.starts_with(prefix),
                None => device_id == pattern,
            };
            if matched {
                let (name, netif) = entry.value();
                if let Some(exchange) = self.get(name) {
                    return Some((exchange, *netif));
                }
            }
        }
        None
    }
}
