//! WireGuard configuration text model
//!
//! Parses `wg-quick` style INI text into a [`ConfigSummary`]: one merged
//! `[Interface]` mapping plus an ordered list of `[Peer]` mappings. Values
//! are kept as text; semantic checks live in [`validator`] and [`ip`].

pub mod ip;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use ip::{detect_ip_conflicts, validate_ips, AddressEntry, IpNetwork};
pub use validator::ConfigValidator;

/// Properties of one section, keyed by the name as written (case-sensitive)
pub type Section = BTreeMap<String, String>;

/// Maximum length of a kernel interface name
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Parsed configuration: the interface properties and each peer's properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    /// `[Interface]` properties, merged across repeated headers
    pub interface: Section,
    /// `[Peer]` properties in file order
    pub peers: Vec<Section>,
}

impl ConfigSummary {
    /// `ListenPort` of the interface, if present and numeric
    pub fn listen_port(&self) -> Option<u16> {
        self.interface
            .get("ListenPort")
            .and_then(|p| p.trim().parse().ok())
    }

    /// Set of peer public keys
    pub fn peer_public_keys(&self) -> BTreeSet<String> {
        self.peers
            .iter()
            .filter_map(|p| p.get("PublicKey"))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Line-oriented configuration parser
#[derive(Debug, Clone, Copy, Default)]
pub struct Parser {
    strict: bool,
}

enum Current {
    None,
    Interface,
    Peer,
}

impl Parser {
    /// Create a parser; strict mode requires at least one peer
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Parse configuration text
    pub fn parse(&self, text: &str) -> Result<ConfigSummary, ConfigError> {
        let mut summary = ConfigSummary::default();
        let mut current = Current::None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                current = match name {
                    "Interface" => Current::Interface,
                    "Peer" => {
                        summary.peers.push(Section::new());
                        Current::Peer
                    }
                    other => {
                        return Err(ConfigError::UnknownSection {
                            section: other.to_string(),
                            line: line_no,
                        })
                    }
                };
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None if matches!(current, Current::None) => {
                    return Err(ConfigError::OutsideSection { line: line_no })
                }
                None => return Err(ConfigError::MalformedLine { line: line_no }),
            };

            let section = match current {
                Current::None => return Err(ConfigError::OutsideSection { line: line_no }),
                Current::Interface => &mut summary.interface,
                Current::Peer => match summary.peers.last_mut() {
                    Some(peer) => peer,
                    None => return Err(ConfigError::OutsideSection { line: line_no }),
                },
            };

            if key.is_empty() {
                return Err(ConfigError::EmptyKey { line: line_no });
            }

            section.insert(key.to_string(), value.to_string());
        }

        if summary.interface.is_empty() {
            return Err(ConfigError::MissingInterface);
        }
        if self.strict && summary.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        Ok(summary)
    }
}

/// Check that `name` is usable as an interface name and as a single path
/// component: 1-15 characters from `[A-Za-z0-9._-]`.
pub fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if name.is_empty() || name.len() > MAX_INTERFACE_NAME_LEN || !valid_chars {
        return Err(ConfigError::InvalidInterfaceName(name.to_string()));
    }
    // "." and ".." pass the character check but are not file names
    if name.chars().all(|c| c == '.') {
        return Err(ConfigError::InvalidInterfaceName(name.to_string()));
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A section header other than `[Interface]` or `[Peer]`
    #[error("unknown section {section:?} at line {line}")]
    UnknownSection {
        /// Section name as written
        section: String,
        /// 1-based line number
        line: usize,
    },

    /// A property line before any section header
    #[error("line {line}: property outside of section")]
    OutsideSection {
        /// 1-based line number
        line: usize,
    },

    /// A property line with nothing before `=`
    #[error("line {line}: empty key")]
    EmptyKey {
        /// 1-based line number
        line: usize,
    },

    /// A non-comment line inside a section that is not `key = value`
    #[error("line {line}: expected key = value")]
    MalformedLine {
        /// 1-based line number
        line: usize,
    },

    /// No `[Interface]` properties were found
    #[error("missing [Interface] section")]
    MissingInterface,

    /// Strict parsing found no `[Peer]` sections
    #[error("no [Peer] sections")]
    NoPeers,

    /// Interface name fails the naming rules
    #[error("invalid interface name {0:?}")]
    InvalidInterfaceName(String),

    /// An address or address list is malformed or disallowed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Invalid key encoding
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// Overlapping or duplicate peer addressing
    #[error("conflict: {0}")]
    Conflict(String),
}

impl ConfigError {
    /// Whether the error is an addressing/identity conflict rather than a
    /// malformed input
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
