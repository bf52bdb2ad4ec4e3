//! Host resolver configuration.
//!
//! Used only at startup (to learn the original primary resolver and
//! point the host at the proxy) and at shutdown (to put things back).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::PlatformError;

pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

pub trait PlatformResolverConfig: Send + Sync {
    /// Nameservers currently configured on the host, in priority order.
    fn current_nameservers(&self) -> Result<Vec<IpAddr>, PlatformError>;

    /// The host's primary nameserver.
    fn current_primary(&self) -> Result<IpAddr, PlatformError> {
        self.current_nameservers()?
            .into_iter()
            .next()
            .ok_or(PlatformError::NoNameserver)
    }

    /// Point the host at `addr`.
    fn set_primary(&self, addr: IpAddr) -> Result<(), PlatformError>;

    /// Undo any change made by [`set_primary`](Self::set_primary).
    fn restore_original(&self) -> Result<(), PlatformError>;
}

/// Manages a `resolv.conf` style file.
///
/// The original contents are kept in memory on the first
/// `set_primary` and written back verbatim on restore.
pub struct ResolvConf {
    path: PathBuf,
    original: Mutex<Option<String>>,
}

impl ResolvConf {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            original: Mutex::new(None),
        }
    }

    fn read(&self) -> Result<String, PlatformError> {
        std::fs::read_to_string(&self.path).map_err(|source| PlatformError::Read {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write(&self, contents: &str) -> Result<(), PlatformError> {
        std::fs::write(&self.path, contents).map_err(|source| PlatformError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Nameserver addresses listed in resolv.conf text.
pub fn parse_nameservers(text: &str) -> Vec<IpAddr> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => fields.next(),
                _ => None,
            }
        })
        .filter_map(|addr| {
            // Drop zone ids such as "fe80::1%eth0".
            let addr = addr.split('%').next().unwrap_or(addr);
            addr.parse().ok()
        })
        .collect()
}

/// Split host nameservers into a primary and extra servers, skipping
/// loopback addresses (the proxy itself, or a local stub resolver).
pub fn host_upstreams(nameservers: &[IpAddr], port: u16) -> Option<(SocketAddr, Vec<SocketAddr>)> {
    let mut usable = nameservers
        .iter()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .map(|ip| SocketAddr::new(*ip, port));
    let primary = usable.next()?;
    Some((primary, usable.collect()))
}

impl PlatformResolverConfig for ResolvConf {
    fn current_nameservers(&self) -> Result<Vec<IpAddr>, PlatformError> {
        Ok(parse_nameservers(&self.read()?))
    }

    fn set_primary(&self, addr: IpAddr) -> Result<(), PlatformError> {
        let current = self.read()?;

        // Keep search/options lines, replace the nameservers.
        let mut contents: String = current
            .lines()
            .filter(|line| !line.trim_start().starts_with("nameserver"))
            .map(|line| format!("{line}\n"))
            .collect();
        contents.push_str(&format!("nameserver {addr}\n"));

        if let Ok(mut original) = self.original.lock() {
            original.get_or_insert(current);
        }
        self.write(&contents)?;
        info!(path = %self.path.display(), nameserver = %addr, "System resolver updated");
        Ok(())
    }

    fn restore_original(&self) -> Result<(), PlatformError> {
        let original = self.original.lock().ok().and_then(|mut o| o.take());
        match original {
            Some(contents) => {
                self.write(&contents)?;
                info!(path = %self.path.display(), "System resolver restored");
            }
            None => warn!(path = %self.path.display(), "Nothing to restore"),
        }
        Ok(())
    }
}

/// Fixed primary resolver; never touches the host.
pub struct Unmanaged {
    nameservers: Vec<IpAddr>,
}

impl Unmanaged {
    pub fn new(nameservers: Vec<IpAddr>) -> Self {
        Self { nameservers }
    }

    /// Snapshot the nameservers listed in a resolv.conf style file.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, PlatformError> {
        ResolvConf::new(path).current_nameservers().map(Self::new)
    }
}

impl PlatformResolverConfig for Unmanaged {
    fn current_nameservers(&self) -> Result<Vec<IpAddr>, PlatformError> {
        Ok(self.nameservers.clone())
    }

    fn set_primary(&self, _addr: IpAddr) -> Result<(), PlatformError> {
        Ok(())
    }

    fn restore_original(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}
