//! DNS proxy orchestration.
//!
//! Binds the listener and runs it alongside the periodic stats report and
//! cache sweep until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::integrations::SafetyMonitor;
use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::transport::QueryLogger;
use crate::transport::udp::{Dispatcher, UdpTransport};

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:53)
    pub bind_addr: SocketAddr,
    pub max_in_flight: usize,
    pub stats_interval: Duration,
    pub purge_interval: Duration,
    /// Log one line per answered query.
    pub log_queries: bool,
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_in_flight: 256,
            stats_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60),
            log_queries: false,
        }
    }
}

/// A bound, not yet serving, proxy.
pub struct Proxy {
    transport: UdpTransport,
    dispatcher: Arc<Dispatcher>,
    config: ProxyConfig,
}

impl Proxy {
    /// Bind the listener. Failure here is fatal for the service.
    pub async fn bind(
        config: ProxyConfig,
        resolver: Arc<Resolver>,
        safety: Option<SafetyMonitor>,
    ) -> Result<Self, ProxyError> {
        let transport = UdpTransport::bind(config.bind_addr, config.max_in_flight)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        let dispatcher = Arc::new(Dispatcher {
            resolver,
            stats: Arc::new(Stats::new()),
            logger: QueryLogger::new(config.log_queries),
            safety,
        });

        Ok(Self {
            transport,
            dispatcher,
            config,
        })
    }

    /// Address actually bound; differs from the configured one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr().unwrap_or(self.config.bind_addr)
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.dispatcher.stats.clone()
    }

    /// Serve queries until `shutdown` completes.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let resolver = self.dispatcher.resolver.clone();
        info!(
            addr = %self.local_addr(),
            upstreams = resolver.registry().len(),
            max_in_flight = self.config.max_in_flight,
            "DNS proxy listening"
        );

        let stats_task = tokio::spawn(report_stats(
            self.dispatcher.clone(),
            self.config.stats_interval,
        ));
        let purge_task = tokio::spawn(purge_cache(resolver, self.config.purge_interval));

        tokio::select! {
            _ = self.transport.run(self.dispatcher.clone()) => {}
            _ = shutdown => info!("Shutdown requested"),
        }

        stats_task.abort();
        purge_task.abort();
    }
}

async fn report_stats(dispatcher: Arc<Dispatcher>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let started = Instant::now();
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = dispatcher.stats.snapshot_and_reset();
        let cache = dispatcher.resolver.cache();
        info!(
            uptime_secs = started.elapsed().as_secs(),
            cache = cache.len(),
            requests = stats.requests,
            cached = stats.cached,
            forwarded = stats.forwarded,
            fallback = stats.fallback,
            failed = stats.failed,
            dropped = stats.dropped,
            avg_response_ms = (stats.avg_response_ms * 100.0).round() / 100.0,
            "stats"
        );
        for server in dispatcher.resolver.registry().snapshot() {
            debug!(
                server = %server.addr,
                role = %server.role,
                successes = server.total_successes,
                failures = server.total_failures,
                blocked = server.blocked_answers,
                consecutive_failures = server.consecutive_failures,
                latency_ms = server.avg_latency_ms.unwrap_or_default(),
                score = server.score(),
                down = server.is_down(Instant::now()),
                "upstream"
            );
        }
    }
}

async fn purge_cache(resolver: Arc<Resolver>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let purged = resolver.cache().purge_expired();
        if purged > 0 {
            debug!(purged, remaining = resolver.cache().len(), "Purged expired cache entries");
        }
    }
}
