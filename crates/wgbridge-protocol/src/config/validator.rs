//! Semantic validation of a parsed configuration

use super::ip::{detect_ip_conflicts, validate_ips};
use super::{ConfigError, ConfigSummary, Section};
use std::collections::HashSet;
use std::net::IpAddr;

/// Upper bound on peers per interface
pub const MAX_PEERS: usize = 100;

/// Smallest MTU accepted (IPv4 minimum datagram)
pub const MIN_MTU: u32 = 576;

/// Largest MTU accepted
pub const MAX_MTU: u32 = 65535;

const MAX_HOSTNAME_LEN: usize = 253;

/// Checks interface and peer properties beyond what the parser enforces
#[derive(Debug, Clone, Copy)]
pub struct ConfigValidator {
    strict: bool,
}

impl ConfigValidator {
    /// Create a validator; strict mode refuses catch-all routes and
    /// requires at least one peer
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Validate a parsed configuration
    pub fn validate(&self, summary: &ConfigSummary) -> Result<(), ConfigError> {
        self.validate_interface(&summary.interface)?;

        if summary.peers.len() > MAX_PEERS {
            return Err(ConfigError::ValidationError(format!(
                "too many peers: {} (max {})",
                summary.peers.len(),
                MAX_PEERS
            )));
        }
        if self.strict && summary.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        let mut seen = HashSet::new();
        for (idx, peer) in summary.peers.iter().enumerate() {
            self.validate_peer(idx + 1, peer)?;
            let key = peer.get("PublicKey").map(|k| k.trim()).unwrap_or_default();
            if !seen.insert(key) {
                return Err(ConfigError::Conflict(format!(
                    "peer {}: duplicate PublicKey {}",
                    idx + 1,
                    key
                )));
            }
        }

        detect_ip_conflicts(&summary.peers)
    }

    fn validate_interface(&self, iface: &Section) -> Result<(), ConfigError> {
        match iface.get("PrivateKey") {
            Some(key) => validate_key("PrivateKey", key).map_err(ConfigError::InvalidKey)?,
            None => return Err(ConfigError::MissingField("Interface.PrivateKey".into())),
        }

        // `Address =` with no value is left to wg-quick
        if let Some(address) = iface.get("Address").filter(|a| !a.trim().is_empty()) {
            validate_ips(address, false)
                .map_err(|e| ConfigError::ValidationError(format!("Address: {}", e)))?;
        }

        if let Some(port) = iface.get("ListenPort") {
            parse_ranged(port, 1, 65535)
                .map_err(|e| ConfigError::ValidationError(format!("ListenPort: {}", e)))?;
        }

        if let Some(dns) = iface.get("DNS") {
            for server in dns.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if server.parse::<IpAddr>().is_err() {
                    return Err(ConfigError::ValidationError(format!(
                        "DNS: {:?} is not an IP address",
                        server
                    )));
                }
            }
        }

        if let Some(mtu) = iface.get("MTU") {
            parse_ranged(mtu, MIN_MTU, MAX_MTU)
                .map_err(|e| ConfigError::ValidationError(format!("MTU: {}", e)))?;
        }

        Ok(())
    }

    fn validate_peer(&self, n: usize, peer: &Section) -> Result<(), ConfigError> {
        match peer.get("PublicKey") {
            Some(key) => validate_key("PublicKey", key)
                .map_err(|e| ConfigError::InvalidKey(format!("peer {}: {}", n, e)))?,
            None => return Err(ConfigError::MissingField(format!("peer {}: PublicKey", n))),
        }

        match peer.get("AllowedIPs") {
            Some(allowed) => validate_ips(allowed, self.strict).map_err(|e| match e {
                ConfigError::InvalidAddress(msg) => {
                    ConfigError::InvalidAddress(format!("peer {}: {}", n, msg))
                }
                other => other,
            })?,
            None => return Err(ConfigError::MissingField(format!("peer {}: AllowedIPs", n))),
        }

        if let Some(psk) = peer.get("PresharedKey") {
            validate_key("PresharedKey", psk)
                .map_err(|e| ConfigError::InvalidKey(format!("peer {}: {}", n, e)))?;
        }

        if let Some(endpoint) = peer.get("Endpoint") {
            validate_endpoint(endpoint)
                .map_err(|e| ConfigError::ValidationError(format!("peer {}: Endpoint: {}", n, e)))?;
        }

        if let Some(keepalive) = peer.get("PersistentKeepalive") {
            parse_ranged(keepalive, 0, 65535).map_err(|e| {
                ConfigError::ValidationError(format!("peer {}: PersistentKeepalive: {}", n, e))
            })?;
        }

        Ok(())
    }
}

/// WireGuard keys are base64 of exactly 32 bytes
fn validate_key(field: &str, value: &str) -> Result<(), String> {
    let bytes = base64::decode(value.trim())
        .map_err(|_| format!("{} is not valid base64", field))?;
    if bytes.len() != 32 {
        return Err(format!(
            "{} has wrong size: {} (expected 32)",
            field,
            bytes.len()
        ));
    }
    Ok(())
}

fn parse_ranged(value: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("{:?} is not a number", value))?;
    if n < min || n > max {
        return Err(format!("{} out of range {}-{}", n, min, max));
    }
    Ok(n)
}

/// `host:port` or `[v6addr]:port`
fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let endpoint = endpoint.trim();
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (addr, port) = rest
            .split_once("]:")
            .ok_or_else(|| "bracketed address must be followed by :port".to_string())?;
        addr.parse::<std::net::Ipv6Addr>()
            .map_err(|_| format!("{:?} is not an IPv6 address", addr))?;
        (addr, port)
    } else {
        endpoint
            .rsplit_once(':')
            .ok_or_else(|| "missing port".to_string())?
    };

    parse_ranged(port, 1, 65535)?;

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(format!("host length must be 1-{}", MAX_HOSTNAME_LEN));
    }
    if host.contains(':') && !endpoint.starts_with('[') {
        return Err("IPv6 endpoints must be bracketed".into());
    }
    Ok(())
}
