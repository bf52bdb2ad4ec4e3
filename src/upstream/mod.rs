//! Upstream resolver registry.
//!
//! Tracks the primary resolver and the fallback pool with rolling health
//! statistics, and ranks them for each query.
//!
//! ```text
//! Up ──[failure_threshold consecutive failures]──> Down(cooldown)
//!  ^                                                   │
//!  └──────────────[cooldown elapsed]───────────────────┘
//! ```
//!
//! A server back from cooldown keeps its failure count until its next
//! success, so a single further failure sends it straight back down.

pub mod client;

pub use client::{UdpUpstream, UpstreamTransport};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Public resolvers seeded into the fallback pool.
pub const DEFAULT_FALLBACKS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
];

/// Default consecutive failures before a server is marked down.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default cooldown for a server marked down.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Default EWMA weight of the newest latency sample.
pub const DEFAULT_LATENCY_SMOOTHING: f64 = 0.3;

/// Latency assumed for servers that have never answered.
const UNMEASURED_LATENCY_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Fallback,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Why an attempt failed. Both kinds are scored identically; the split
/// only feeds reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success { latency: Duration },
    Failure(FailureKind),
}

/// Health transition caused by a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkedDown { until: Instant },
}

/// A candidate upstream resolver and its rolling statistics.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub addr: SocketAddr,
    pub role: Role,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Subset of `total_failures` caused by blocked answers.
    pub blocked_answers: u64,
    /// Exponentially weighted average latency in milliseconds.
    pub avg_latency_ms: Option<f64>,
    pub down_until: Option<Instant>,
}

impl UpstreamServer {
    fn new(addr: SocketAddr, role: Role) -> Self {
        Self {
            addr,
            role,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            blocked_answers: 0,
            avg_latency_ms: None,
            down_until: None,
        }
    }

    pub fn is_down(&self, now: Instant) -> bool {
        self.down_until.is_some_and(|until| now < until)
    }

    /// Ranking score, higher is better.
    ///
    /// Laplace-smoothed success rate divided by a latency factor. Depends
    /// only on the counters.
    pub fn score(&self) -> f64 {
        let successes = self.total_successes as f64;
        let total = (self.total_successes + self.total_failures) as f64;
        let success_rate = (successes + 1.0) / (total + 2.0);
        let latency = self.avg_latency_ms.unwrap_or(UNMEASURED_LATENCY_MS);
        success_rate / (1.0 + latency / UNMEASURED_LATENCY_MS)
    }
}

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub latency_smoothing: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            latency_smoothing: DEFAULT_LATENCY_SMOOTHING,
        }
    }
}

/// Ranked pool of upstream resolvers.
///
/// Servers are kept in admission order, which also breaks score ties.
pub struct UpstreamRegistry {
    servers: RwLock<Vec<UpstreamServer>>,
    config: RegistryConfig,
}

impl UpstreamRegistry {
    pub fn new(primary: SocketAddr, fallbacks: &[SocketAddr], config: RegistryConfig) -> Self {
        let registry = Self {
            servers: RwLock::new(vec![UpstreamServer::new(primary, Role::Primary)]),
            config,
        };
        for addr in fallbacks {
            registry.admit(*addr);
        }
        registry
    }

    /// Add a fallback server. Returns false if it is already known.
    pub fn admit(&self, addr: SocketAddr) -> bool {
        let Ok(mut servers) = self.servers.write() else {
            return false;
        };
        if servers.iter().any(|s| s.addr == addr) {
            return false;
        }
        servers.push(UpstreamServer::new(addr, Role::Fallback));
        true
    }

    pub fn select_candidates(&self) -> Vec<SocketAddr> {
        self.select_candidates_at(Instant::now())
    }

    /// Candidates in the order they should be tried as of `now`.
    ///
    /// The primary comes first unless it is down; the rest are sorted by
    /// score. Servers in cooldown are left out entirely.
    pub fn select_candidates_at(&self, now: Instant) -> Vec<SocketAddr> {
        let Ok(servers) = self.servers.read() else {
            return Vec::new();
        };

        let primary = servers
            .iter()
            .filter(|s| s.role == Role::Primary && !s.is_down(now))
            .map(|s| s.addr);

        let mut fallbacks: Vec<(usize, f64, SocketAddr)> = servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == Role::Fallback && !s.is_down(now))
            .map(|(i, s)| (i, s.score(), s.addr))
            .collect();
        fallbacks.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        primary.chain(fallbacks.into_iter().map(|(_, _, addr)| addr)).collect()
    }

    pub fn record_outcome(&self, addr: SocketAddr, outcome: Outcome) -> Option<Transition> {
        self.record_outcome_at(addr, outcome, Instant::now())
    }

    /// Update `addr`'s counters. Unknown servers are ignored.
    pub fn record_outcome_at(
        &self,
        addr: SocketAddr,
        outcome: Outcome,
        now: Instant,
    ) -> Option<Transition> {
        let Ok(mut servers) = self.servers.write() else {
            return None;
        };
        let server = servers.iter_mut().find(|s| s.addr == addr)?;

        match outcome {
            Outcome::Success { latency } => {
                let sample = latency.as_secs_f64() * 1000.0;
                let alpha = self.config.latency_smoothing;
                server.avg_latency_ms = Some(match server.avg_latency_ms {
                    Some(avg) => alpha * sample + (1.0 - alpha) * avg,
                    None => sample,
                });
                server.total_successes += 1;
                server.consecutive_failures = 0;
                server.down_until = None;
                None
            }
            Outcome::Failure(kind) => {
                server.total_failures += 1;
                if kind == FailureKind::Blocked {
                    server.blocked_answers += 1;
                }
                server.consecutive_failures = server.consecutive_failures.saturating_add(1);

                if server.consecutive_failures >= self.config.failure_threshold && !server.is_down(now) {
                    let until = now + self.config.cooldown;
                    server.down_until = Some(until);
                    Some(Transition::MarkedDown { until })
                } else {
                    None
                }
            }
        }
    }

    /// Copy of one server's statistics.
    pub fn get(&self, addr: SocketAddr) -> Option<UpstreamServer> {
        self.servers
            .read()
            .ok()?
            .iter()
            .find(|s| s.addr == addr)
            .cloned()
    }

    pub fn primary(&self) -> Option<SocketAddr> {
        self.servers
            .read()
            .ok()?
            .iter()
            .find(|s| s.role == Role::Primary)
            .map(|s| s.addr)
    }

    /// Copy of every server's statistics, in admission order.
    pub fn snapshot(&self) -> Vec<UpstreamServer> {
        self.servers.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.servers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
