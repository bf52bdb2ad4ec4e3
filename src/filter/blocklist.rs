//! Custom blocklist of answer addresses.
//!
//! Seeded at compile time with addresses known to be used by ISPs as
//! redirect targets for censored names, optionally extended from a file
//! or from configuration. Entries are single addresses or CIDR networks.

use rustc_hash::FxHashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::ConfigError;

/// Embedded list of known redirect addresses, loaded at compile time.
const KNOWN_REDIRECTS: &str = include_str!("known_redirects.txt");

/// An address range in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| format!("missing prefix in {s:?}"))?;
        let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address in {s:?}"))?;
        let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix in {s:?}"))?;
        Self::new(addr, prefix).ok_or_else(|| format!("prefix out of range in {s:?}"))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A matched custom blocklist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    Address(IpAddr),
    Network(Network),
}

impl fmt::Display for BlockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => addr.fmt(f),
            Self::Network(net) => net.fmt(f),
        }
    }
}

/// Immutable set of blocked answer addresses.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    addresses: FxHashSet<IpAddr>,
    networks: Vec<Network>,
}

impl Blocklist {
    /// Create a blocklist from the embedded known-redirect list.
    pub fn new() -> Self {
        let mut blocklist = Self::empty();
        blocklist.extend_from_text(KNOWN_REDIRECTS, "<embedded>");
        blocklist
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the full blocklist: embedded entries, an optional file, and
    /// extra entries from configuration.
    pub fn load(file: Option<&Path>, extra: &[String]) -> Result<Self, ConfigError> {
        let mut blocklist = Self::new();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                path: path.display().to_string(),
                source,
            })?;
            blocklist.extend_from_text(&text, &path.display().to_string());
        }

        for entry in extra {
            if !blocklist.insert(entry) {
                return Err(ConfigError::Validation(format!(
                    "invalid blocklist entry {entry:?}"
                )));
            }
        }

        Ok(blocklist)
    }

    /// Parse one entry per line, skipping blanks and `#` comments.
    /// Unparseable lines are logged and skipped.
    fn extend_from_text(&mut self, text: &str, source: &str) {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if !self.insert(line) {
                warn!(source, line = lineno + 1, entry = line, "Skipping invalid blocklist entry");
            }
        }
    }

    fn insert(&mut self, entry: &str) -> bool {
        if let Ok(addr) = entry.parse::<IpAddr>() {
            self.addresses.insert(addr);
            return true;
        }
        match entry.parse::<Network>() {
            Ok(net) => {
                self.networks.push(net);
                true
            }
            Err(_) => false,
        }
    }

    /// Return the entry matching `ip`, if any.
    pub fn matches(&self, ip: IpAddr) -> Option<BlockEntry> {
        if self.addresses.contains(&ip) {
            return Some(BlockEntry::Address(ip));
        }
        self.networks
            .iter()
            .find(|net| net.contains(ip))
            .map(|net| BlockEntry::Network(*net))
    }

    /// Returns the number of entries in the blocklist.
    pub fn len(&self) -> usize {
        self.addresses.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
