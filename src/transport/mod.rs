//! Client-facing transport for the proxy.
//!
//! Receives DNS queries from local clients over UDP, hands them to the
//! resolver, and sends the encoded answer back.

pub mod udp;

use std::net::SocketAddr;
use tracing::info;

use crate::dns::QueryKey;

/// Logger for per-query outcomes.
///
/// Emits one event per answered query under the `sidestep::query` target
/// when enabled, so the lines can be filtered independently of the rest.
#[derive(Debug, Clone, Copy)]
pub struct QueryLogger {
    enabled: bool,
}

impl QueryLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn cached(&self, key: &QueryKey, elapsed_ms: f64) {
        if self.enabled {
            info!(target: "sidestep::query", query = %key, total_ms = elapsed_ms, "CACHED");
        }
    }

    pub fn forwarded(&self, key: &QueryKey, total_ms: f64, from: SocketAddr, fallback: bool, attempts: usize) {
        if self.enabled {
            info!(
                target: "sidestep::query",
                query = %key,
                total_ms,
                upstream = %from,
                fallback,
                attempts,
                "FORWARDED"
            );
        }
    }

    pub fn failed(&self, key: &QueryKey, total_ms: f64, attempts: usize) {
        if self.enabled {
            info!(target: "sidestep::query", query = %key, total_ms, attempts, "SERVFAIL");
        }
    }
}
