//! Address list validation and peer address conflict detection

use super::{ConfigError, Section};
use std::fmt;
use std::net::IpAddr;

/// A CIDR block, stored with host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Parse `addr/prefix`; the address is masked to the prefix
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: IpAddr = addr.parse().ok()?;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let prefix: u8 = prefix.parse().ok()?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Self {
            addr: mask(addr, prefix),
            prefix,
        })
    }

    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` lies inside this network (same address family only)
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (ip, self.addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix) == self.addr
            }
            _ => false,
        }
    }

    /// Whether two networks share any address.
    ///
    /// Tested as "either network address lies in the other". Because both
    /// sides are masked CIDR blocks (nested or disjoint, never partially
    /// overlapping) this is exact.
    pub fn overlaps(&self, other: &IpNetwork) -> bool {
        self.contains(other.addr) || other.contains(self.addr)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn mask(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix == 0 { 0 } else { !0u128 << (128 - prefix) };
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// One entry of an address list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEntry {
    /// CIDR notation
    Network(IpNetwork),
    /// Bare address
    Host(IpAddr),
}

impl AddressEntry {
    /// Classify an entry as CIDR or bare address
    pub fn parse(s: &str) -> Option<Self> {
        if s.contains('/') {
            IpNetwork::parse(s).map(Self::Network)
        } else {
            s.parse().ok().map(Self::Host)
        }
    }
}

fn entries(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|e| !e.is_empty())
}

/// Validate a comma-separated list of CIDR blocks or addresses.
///
/// Only a wholly empty string is refused; blank entries, including a list
/// of nothing but whitespace, are skipped. In strict mode the catch-all
/// routes `0.0.0.0/0` and `::/0` are refused.
pub fn validate_ips(list: &str, strict: bool) -> Result<(), ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::InvalidAddress("empty address list".into()));
    }

    for entry in entries(list) {
        if strict && (entry == "0.0.0.0/0" || entry == "::/0") {
            return Err(ConfigError::InvalidAddress(format!(
                "catch-all route {} not allowed in strict mode",
                entry
            )));
        }
        if AddressEntry::parse(entry).is_none() {
            return Err(ConfigError::InvalidAddress(format!(
                "{:?} is neither CIDR nor an IP address",
                entry
            )));
        }
    }
    Ok(())
}

/// Detect overlapping `AllowedIPs` across peers.
///
/// Peers are processed in order and the first conflict is reported, so the
/// message is deterministic for a given input. Entries that do not parse
/// are left to [`validate_ips`].
pub fn detect_ip_conflicts(peers: &[Section]) -> Result<(), ConfigError> {
    let mut networks: Vec<(IpNetwork, &str)> = Vec::new();
    let mut hosts: Vec<(IpAddr, &str)> = Vec::new();

    for (idx, peer) in peers.iter().enumerate() {
        let public_key = peer
            .get("PublicKey")
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingField(format!("peer {}: PublicKey", idx + 1)))?;
        let allowed = peer
            .get("AllowedIPs")
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField(format!("peer {}: AllowedIPs", idx + 1)))?;

        for entry in entries(allowed) {
            match AddressEntry::parse(entry) {
                Some(AddressEntry::Network(net)) => {
                    if let Some((prior, owner)) = networks.iter().find(|(n, _)| n.overlaps(&net)) {
                        return Err(ConfigError::Conflict(format!(
                            "{} (peer {}) overlaps {} (peer {})",
                            entry, public_key, prior, owner
                        )));
                    }
                    if let Some((prior, owner)) = hosts.iter().find(|(h, _)| net.contains(*h)) {
                        return Err(ConfigError::Conflict(format!(
                            "{} (peer {}) contains {} (peer {})",
                            entry, public_key, prior, owner
                        )));
                    }
                    networks.push((net, public_key));
                }
                Some(AddressEntry::Host(ip)) => {
                    if let Some((prior, owner)) = networks.iter().find(|(n, _)| n.contains(ip)) {
                        return Err(ConfigError::Conflict(format!(
                            "{} (peer {}) is inside {} (peer {})",
                            entry, public_key, prior, owner
                        )));
                    }
                    if let Some((_, owner)) = hosts.iter().find(|(h, _)| *h == ip) {
                        return Err(ConfigError::Conflict(format!(
                            "duplicate IP {} (peers {} and {})",
                            entry, owner, public_key
                        )));
                    }
                    hosts.push((ip, public_key));
                }
                None => {}
            }
        }
    }
    Ok(())
}
