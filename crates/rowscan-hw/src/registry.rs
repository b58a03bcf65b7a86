//! Device discovery and stream port assignment.

use crate::backend::{DeviceBackend, DeviceInfo};
use std::collections::HashSet;
use std::sync::Arc;

/// Size of the port window above the configured base.
pub const PORT_WINDOW: u16 = 100;

/// A device that survived exclusion, with its preview port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub stream_port: u16,
}

pub struct DeviceRegistry {
    backend: Arc<dyn DeviceBackend>,
    excluded: Vec<String>,
    port_base: u16,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DeviceBackend>, excluded: Vec<String>, port_base: u16) -> Self {
        Self {
            backend,
            excluded,
            port_base,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Enumerate devices, drop excluded identities and assign ports.
    ///
    /// The result is sorted by identity so camera indices stay stable.
    pub fn discover(&self) -> Vec<DiscoveredDevice> {
        let mut found = self.backend.enumerate();
        found.sort_by(|a, b| a.identity.cmp(&b.identity));
        found.dedup_by(|a, b| a.identity == b.identity);

        let mut used: HashSet<u16> = HashSet::new();
        let mut devices = Vec::with_capacity(found.len());
        for info in found {
            if self.excluded.iter().any(|e| e == &info.identity) {
                tracing::info!(identity = %info.identity, "device excluded");
                continue;
            }
            let stream_port = self.assign_port(&info.identity, &mut used);
            tracing::info!(identity = %info.identity, model = %info.model, port = stream_port, "device discovered");
            devices.push(DiscoveredDevice { info, stream_port });
        }
        devices
    }

    fn assign_port(&self, identity: &str, used: &mut HashSet<u16>) -> u16 {
        if self.port_base == 0 {
            return 0;
        }
        let preferred = port_suffix(identity);
        for step in 0..PORT_WINDOW {
            let suffix = (preferred + step) % PORT_WINDOW;
            let Some(port) = self.port_base.checked_add(suffix) else {
                continue;
            };
            if used.insert(port) {
                if step > 0 {
                    tracing::warn!(
                        identity,
                        preferred = self.port_base.saturating_add(preferred),
                        port,
                        "stream port collision; using next free port"
                    );
                }
                return port;
            }
        }
        tracing::warn!(identity, "no free stream port in window; using an ephemeral port");
        0
    }
}

/// Port offset for an identity: its trailing decimal digits modulo the
/// window, or a hash of the whole identity when it has none.
pub fn port_suffix(identity: &str) -> u16 {
    let digits: String = identity
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return (fnv1a(identity.as_bytes()) % PORT_WINDOW as u64) as u16;
    }
    // Only the last two digits matter for a window of 100.
    let tail = &digits[digits.len().saturating_sub(2)..];
    tail.parse::<u16>().map(|v| v % PORT_WINDOW).unwrap_or(0)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
