//! Message transactions
//!
//! Helper for turning a received frame into a reply or forwarded frame
//! without re-allocating: flip the direction, patch the payload, recompute
//! length and checksum, and dispatch. A transaction ends in exactly one of
//! three ways: normal finish, free-only, or keep-only.

use crate::frame::Frame;
use crate::manager::NetIfManager;
use crate::pool::FrameToken;
use crate::router;
use crate::wire;

/// Terminal action for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// Carry out the normal completion: patch, checksum, dispatch.
    Normal,
    /// Just free the message buffer.
    Free,
    /// Just keep the message buffer; the caller retains ownership.
    Keep,
}

/// Where a finished message is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    PostToNone,
    SendToRouter,
    PostToNetIf,
}

pub struct MessageTransaction<'a> {
    manager: &'a NetIfManager,
    token: FrameToken,
    /// Interface the message arrived on; default post target.
    pub origin_netif: u8,
    pub finish: FinishAction,
    pub dispatch: DispatchAction,
    pub return_cmd: u8,
    /// Swap sender/receiver and ports, invert the reply flag on finish.
    pub change_dir: bool,
}

impl<'a> std::fmt::Debug for MessageTransaction<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransaction")
            .field("token", &self.token)
            .field("origin_netif", &self.origin_netif)
            .field("finish", &self.finish)
            .field("dispatch", &self.dispatch)
            .field("return_cmd", &self.return_cmd)
            .field("change_dir", &self.change_dir)
            .finish()
    }
}

impl<'a> MessageTransaction<'a> {
    /// Begin a transaction over a received general frame. Handshake frames
    /// are rejected and handed back for the caller to free.
    pub fn start(manager: &'a NetIfManager, token: FrameToken) -> Result<Self, FrameToken> {
        let origin_netif = {
            let mut frame = manager.pool().frame(&token);
            match frame.pid() {
                wire::PID_GENERAL_V => {
                    // Clear out any resend meta value.
                    frame.pid_flags &= wire::META_FLAGS_PID;
                }
                wire::PID_GENERAL => {}
                _ => {
                    drop(frame);
                    return Err(token);
                }
            }
            frame.in_netif
        };
        Ok(Self {
            manager,
            token,
            origin_netif,
            // Free by default: prevents unhandled recursions.
            finish: FinishAction::Free,
            dispatch: DispatchAction::PostToNetIf,
            return_cmd: 0,
            change_dir: false,
        })
    }

    /// Read access to the underlying frame.
    pub fn with_frame<R>(&self, f: impl FnOnce(&Frame) -> R) -> R {
        f(&self.manager.pool().frame(&self.token))
    }

    /// Copy of the message payload.
    pub fn copy_message_data(&self) -> Vec<u8> {
        self.with_frame(|frame| frame.data().to_vec())
    }

    /// Replace the payload and mark the transaction as a reply.
    /// Returns false when the value does not fit.
    pub fn store_value(&mut self, value: &[u8]) -> bool {
        if value.len() > wire::GENERAL_MAX_DATA_SIZE {
            return false;
        }
        self.manager.pool().frame(&self.token).set_data(value);
        self.change_dir = true;
        self.finish = FinishAction::Normal;
        true
    }

    /// Append to the payload. Returns false when it does not fit.
    pub fn append_value(&mut self, value: &[u8]) -> bool {
        let mut frame = self.manager.pool().frame(&self.token);
        let len = frame.data_length() as usize;
        if len + value.len() > wire::GENERAL_MAX_DATA_SIZE {
            return false;
        }
        let start = crate::frame::DATA_ARRAY_INDEX + len;
        frame.buf[start..start + value.len()].copy_from_slice(value);
        frame.set_data_length((len + value.len()) as u8);
        true
    }

    /// Finalize the message. Returns the token only for `Keep`, handing
    /// ownership back to the caller.
    pub fn finish(self) -> Option<FrameToken> {
        match self.finish {
            FinishAction::Free => {
                self.manager.pool().release(self.token);
                None
            }
            FinishAction::Keep => Some(self.token),
            FinishAction::Normal => {
                {
                    let mut frame = self.manager.pool().frame(&self.token);
                    if self.return_cmd != 0 {
                        frame.set_command(self.return_cmd);
                    }
                    if self.change_dir {
                        // r<>s, rPort<>sPort, invert is-reply, clear ack.
                        let sender = frame.sender();
                        let receiver = frame.receiver();
                        frame.set_sender(receiver);
                        frame.set_receiver(sender);
                        let mut flags = frame.flags_rs();
                        flags ^= wire::MESSAGE_FLAGS_IS_REPLY;
                        flags &= !wire::MESSAGE_FLAGS_ACK;
                        frame.set_flags_rs(wire::swap_ports(flags));
                    }
                    frame.pkt_len =
                        (wire::GENERAL_OVERHEADS_SIZE + frame.data_length() as usize) as u8;
                    let len = frame.pkt_len;
                    frame.update_checksum(len);
                }
                match self.dispatch {
                    DispatchAction::SendToRouter => router::route_message(self.manager, self.token),
                    DispatchAction::PostToNetIf => {
                        router::post_message(self.manager, self.token, self.origin_netif)
                    }
                    DispatchAction::PostToNone => self.manager.pool().release(self.token),
                }
                None
            }
        }
    }
}
