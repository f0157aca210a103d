//! Serial number bookkeeping
//!
//! Per-link device identity used during handshake and attach: the master
//! serial string, a small slot table for serial numbers seen on links, and
//! the product code parsed out of the master serial.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::LinkDriver;
use crate::manager::NetIfManager;
use crate::wire;

const SERIAL_SLOTS: usize = 8;

#[inline]
pub fn nibble_to_hex_char(n: u8) -> u8 {
    match n & 0x0f {
        d @ 0..=9 => b'0' + d,
        d => b'A' + d - 10,
    }
}

fn strlen(bytes: &[u8]) -> usize {
    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
}

/// One stored serial number.
#[derive(Clone)]
struct SerialSlot {
    len: u8,
    text: [u8; wire::SERIAL_NUM_ASCII_SIZE + 2],
}

impl SerialSlot {
    fn new() -> Self {
        Self {
            len: 0,
            text: [0; wire::SERIAL_NUM_ASCII_SIZE + 2],
        }
    }
}

pub struct SerialNumbers {
    master_sn: Vec<u8>,
    master_sn_string: String,
    product_code: Mutex<u32>,
    slots: Mutex<Vec<SerialSlot>>,
    free: Mutex<Vec<usize>>,
}

impl SerialNumbers {
    pub fn new(shell_id: &str, master_sn: &str) -> Self {
        let mut master_sn_string = if master_sn.trim().is_empty() {
            // Synthesized fallback identity keyed on the shell.
            let shell = shell_id.bytes().next().unwrap_or(b'0');
            format!("BBL-0000-{}0", shell as char)
        } else {
            master_sn.to_string()
        };
        if !master_sn_string.ends_with('\0') {
            master_sn_string.push('\0');
        }
        let master_sn = master_sn_string.as_bytes().to_vec();
        let s = Self {
            product_code: Mutex::new(0),
            master_sn,
            master_sn_string,
            slots: Mutex::new(vec![SerialSlot::new(); SERIAL_SLOTS]),
            free: Mutex::new((0..SERIAL_SLOTS).rev().collect()),
        };
        s.update_product_code(&s.master_sn.clone());
        s
    }

    pub fn master_serial(&self) -> &str {
        self.master_sn_string.trim_end_matches('\0')
    }

    pub fn product_code(&self) -> u32 {
        *self.product_code.lock()
    }

    /// Parse the hex product code from positions 4.. of a serial number.
    fn update_product_code(&self, sn: &[u8]) {
        let len = strlen(sn);
        if len > 5 {
            let mut n: u32 = 0;
            for &d in &sn[4..len] {
                let m = match d {
                    b'0'..=b'9' => (d - b'0') as u32,
                    b'A'..=b'F' => (d - b'A' + 10) as u32,
                    _ => break,
                };
                n = 16 * n + m;
            }
            if n > 0 {
                *self.product_code.lock() = n;
            }
        }
    }

    fn copy_to_slot(&self, idx: usize, bytes: &[u8], len: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(idx) {
            let n = len.min(wire::SERIAL_NUM_ASCII_SIZE);
            slot.text[..n].copy_from_slice(&bytes[..n]);
            slot.text[n] = 0;
            slot.len = n as u8;
        }
    }

    /// Set up the serial slot for the device at the other end of a link.
    ///
    /// The master port gets a temporary serial derived from the master's,
    /// with the final character replaced by the netIf index; every other
    /// port starts unset until the device reports its attach.
    pub fn netif_serial_setup(&self, manager: &Arc<NetIfManager>, netif_index: u8) {
        let Some(link) = manager.get_link_driver(netif_index) else {
            return;
        };
        if netif_index == wire::NETIF_USER_BASE {
            let idx = self.free.lock().pop();
            if let Some(idx) = idx {
                let len = strlen(&self.master_sn);
                self.copy_to_slot(idx, &self.master_sn, len);
                if len > 0 {
                    self.slots.lock()[idx].text[len - 1] = nibble_to_hex_char(netif_index);
                }
                link.set_serial_index(Some(idx));
                return;
            }
        }
        link.set_serial_index(None);
    }

    /// Look up the link whose stored serial number matches `wanted`.
    pub fn find_netif_by_serial(
        &self,
        manager: &NetIfManager,
        wanted: &[u8],
    ) -> Option<Arc<LinkDriver>> {
        let n = strlen(wanted);
        let slots = self.slots.lock();
        for netif in 0..=wire::NETIF_NUM_SIZE {
            if let Some(link) = manager.get_link_driver(netif) {
                if let Some(idx) = link.serial_index() {
                    let slot = &slots[idx];
                    if slot.len as usize == n && &slot.text[..n] == &wanted[..n] {
                        return Some(link);
                    }
                }
            }
        }
        None
    }

    /// Copy of the master serial with the final character replaced by the
    /// netIf index, as reported to devices during attach.
    pub fn copy_master_serial(&self, manager: &NetIfManager, netif_index: u8) -> Vec<u8> {
        let slots = self.slots.lock();
        let source: Vec<u8> = manager
            .get_link_driver(wire::NETIF_USER_BASE)
            .and_then(|link| link.serial_index())
            .and_then(|idx| slots.get(idx))
            .filter(|slot| slot.len > 0)
            .map(|slot| slot.text[..slot.len as usize + 1].to_vec())
            .unwrap_or_else(|| self.master_sn.clone());
        drop(slots);
        let mut out = source;
        let len = strlen(&out);
        if len > 0 {
            out[len - 1] = nibble_to_hex_char(netif_index);
        }
        out.truncate(len);
        out
    }

    /// Record the serial number reported by the device on a link.
    pub fn update_serial_numbers(
        &self,
        manager: &NetIfManager,
        serial: &[u8],
        netif_index: u8,
        sender_adrs: u16,
    ) {
        if netif_index == wire::NETIF_USER_BASE && sender_adrs == wire::ADRS_LOCAL {
            // The master's own serial: refresh the product code.
            self.update_product_code(serial);
        }
        if let Some(link) = manager.get_link_driver(netif_index) {
            let idx = match link.serial_index() {
                Some(idx) => Some(idx),
                None => {
                    let idx = self.free.lock().pop();
                    link.set_serial_index(idx);
                    idx
                }
            };
            if let Some(idx) = idx {
                self.copy_to_slot(idx, serial, strlen(serial));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::device::PipeDevice;
    use crate::driver::{LinkOptions, NoHooks};

    fn manager_with_user_link() -> Arc<NetIfManager> {
        let mgr = NetIfManager::new("0", "BBL-00A1-X0", LinkConfig::default());
        let (near, _far) = PipeDevice::pair("n", "f");
        let link = LinkDriver::new(
            &mgr,
            Arc::new(near),
            wire::NETIF_USER_BASE,
            LinkOptions::polled_link(),
            Box::new(NoHooks),
        );
        mgr.add_driver(link);
        mgr
    }

    #[test]
    fn test_product_code_from_master_serial() {
        let serials = SerialNumbers::new("0", "BBL-00A1-X0");
        assert_eq!(serials.product_code(), 0x00A1);
    }

    #[test]
    fn test_master_link_gets_suffixed_serial() {
        let mgr = manager_with_user_link();
        let link = mgr.get_link_driver(wire::NETIF_USER_BASE).unwrap();
        assert!(link.serial_index().is_some());
        let sn = mgr.serials().copy_master_serial(&mgr, wire::NETIF_C_PORT);
        assert_eq!(sn.last(), Some(&nibble_to_hex_char(wire::NETIF_C_PORT)));
        mgr.close();
    }

    #[test]
    fn test_update_and_find_by_serial() {
        let mgr = manager_with_user_link();
        mgr.serials()
            .update_serial_numbers(&mgr, b"DEV-1234-7\0", wire::NETIF_USER_BASE, 0x0007);
        let found = mgr
            .serials()
            .find_netif_by_serial(&mgr, b"DEV-1234-7\0")
            .expect("serial known");
        assert_eq!(found.netif_index(), wire::NETIF_USER_BASE);
        assert!(mgr
            .serials()
            .find_netif_by_serial(&mgr, b"DEV-0000-0\0")
            .is_none());
        mgr.close();
    }
}
