//! Free-port negotiation for kernel sessions.
//!
//! A [`PortRegistry`] is owned by one kernel process and remembers every
//! port it handed out, so independent allocations never collide even before
//! the ports are actually bound.

use std::collections::HashSet;
use std::net::{TcpListener, UdpSocket};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;

use crate::types::{ConnectionInfo, Error, PortConfig, Result};

/// Process-scoped set of claimed ports.
#[derive(Debug, Default)]
pub struct PortRegistry {
    claimed: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claimed(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `port` if nobody has. Returns false when it was already claimed.
    pub fn claim(&self, port: u16) -> bool {
        self.claimed().insert(port)
    }

    pub fn release(&self, port: u16) -> bool {
        self.claimed().remove(&port)
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed().contains(&port)
    }

    pub fn len(&self) -> usize {
        self.claimed().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick, probe and claim one free port from the configured range.
    pub fn claim_free_port(&self, host: &str, config: &PortConfig) -> Result<u16> {
        if config.range_start > config.range_end {
            return Err(Error::validation(format!(
                "empty port range {}..={}",
                config.range_start, config.range_end
            )));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..config.max_attempts {
            let candidate = rng.gen_range(config.range_start..=config.range_end);
            if self.is_claimed(candidate) || !is_port_available(host, candidate) {
                continue;
            }
            // The probe and the claim are not atomic together; the claim is.
            if self.claim(candidate) {
                tracing::debug!("Claimed port {}", candidate);
                return Ok(candidate);
            }
        }

        Err(Error::PortsExhausted {
            start: config.range_start,
            end: config.range_end,
            attempts: config.max_attempts,
        })
    }

    /// Claim `count` distinct ports, releasing all of them on failure.
    pub fn claim_ports(&self, host: &str, config: &PortConfig, count: usize) -> Result<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            match self.claim_free_port(host, config) {
                Ok(port) => ports.push(port),
                Err(e) => {
                    for port in ports {
                        self.release(port);
                    }
                    return Err(e);
                }
            }
        }
        Ok(ports)
    }
}

/// Bind-and-release probe on both a stream and a datagram socket.
fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok() && UdpSocket::bind((host, port)).is_ok()
}

/// Fresh connection info: five distinct claimed ports and a random key.
pub fn allocate_connection_info(
    registry: &PortRegistry,
    ip: &str,
    config: &PortConfig,
) -> Result<ConnectionInfo> {
    let ports = registry.claim_ports(ip, config, 5)?;
    let info = ConnectionInfo {
        ip: ip.to_string(),
        shell_port: ports[0],
        iopub_port: ports[1],
        stdin_port: ports[2],
        control_port: ports[3],
        hb_port: ports[4],
        key: uuid::Uuid::new_v4().to_string(),
        ..ConnectionInfo::default()
    };
    tracing::info!(
        "Allocated connection ports shell={} iopub={} stdin={} control={} hb={}",
        info.shell_port,
        info.iopub_port,
        info.stdin_port,
        info.control_port,
        info.hb_port
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn range(start: u16, end: u16) -> PortConfig {
        PortConfig {
            range_start: start,
            range_end: end,
            max_attempts: 500,
        }
    }

    #[test]
    fn test_claim_is_insert_if_absent() {
        let registry = PortRegistry::new();
        assert!(registry.claim(40000));
        assert!(!registry.claim(40000));
        assert!(registry.release(40000));
        assert!(registry.claim(40000));
    }

    #[test]
    fn test_exhausted_range_fails() {
        let registry = PortRegistry::new();
        registry.claim(45123);
        let config = PortConfig {
            range_start: 45123,
            range_end: 45123,
            max_attempts: 10,
        };
        let err = registry.claim_free_port("127.0.0.1", &config).unwrap_err();
        assert!(matches!(
            err,
            Error::PortsExhausted {
                start: 45123,
                end: 45123,
                attempts: 10
            }
        ));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let registry = PortRegistry::new();
        assert!(registry.claim_free_port("127.0.0.1", &range(50, 10)).is_err());
    }

    #[test]
    fn test_concurrent_overlapping_requests_never_share_a_port() {
        let registry = Arc::new(PortRegistry::new());
        let handles: Vec<_> = [(46000, 46039), (46020, 46059)]
            .into_iter()
            .map(|(start, end)| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .claim_ports("127.0.0.1", &range(start, end), 8)
                        .unwrap()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(registry.len(), 16);
    }

    #[test]
    fn test_allocate_connection_info() {
        let registry = PortRegistry::new();
        let info = allocate_connection_info(&registry, "127.0.0.1", &range(47000, 47999)).unwrap();

        let mut ports = vec![
            info.shell_port,
            info.iopub_port,
            info.stdin_port,
            info.control_port,
            info.hb_port,
        ];
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
        assert!(ports.iter().all(|p| registry.is_claimed(*p)));
        assert!(!info.key.is_empty());
        assert_eq!(info.signature_scheme, "hmac-sha256");
    }
}
