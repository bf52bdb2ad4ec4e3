//! UDP listener for DNS queries.
//!
//! A single receive loop decodes each datagram and spawns a task per
//! query, admitted through a semaphore so a burst of clients cannot
//! create unbounded work. Each task resolves, replies with the client's
//! own transaction id and question, and records the outcome.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dns::{DnsQuery, MAX_MESSAGE_SIZE};
use crate::integrations::SafetyMonitor;
use crate::resolver::{Resolution, Resolver};
use crate::stats::Stats;

use super::QueryLogger;

/// Everything a query task needs once the datagram is decoded.
pub struct Dispatcher {
    pub resolver: Arc<Resolver>,
    pub stats: Arc<Stats>,
    pub logger: QueryLogger,
    /// Advisory content checks run after the reply is sent.
    pub safety: Option<SafetyMonitor>,
}

/// UDP transport for the proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    permits: Arc<Semaphore>,
}

impl UdpTransport {
    /// Bind the listening socket with address (and on unix, port) reuse.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(addr: SocketAddr, max_in_flight: usize) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: Arc::new(UdpSocket::from_std(std_socket)?),
            permits: Arc::new(Semaphore::new(max_in_flight)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and dispatch queries until the task is dropped.
    pub async fn run(&self, dispatcher: Arc<Dispatcher>) {
        // One spare byte so oversized datagrams are detectable.
        let mut buf = [0u8; MAX_MESSAGE_SIZE + 1];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP recv error");
                    continue;
                }
            };

            let query = match DnsQuery::parse(&buf[..len]) {
                Ok(query) => query,
                Err(e) => {
                    debug!(client = %src, bytes = len, error = %e, "Dropping undecodable datagram");
                    dispatcher.stats.record_dropped();
                    continue;
                }
            };

            // Waits here when the in-flight limit is reached.
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return;
            };
            let socket = self.socket.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_query(&socket, &dispatcher, query, src).await;
            });
        }
    }
}

async fn handle_query(socket: &UdpSocket, dispatcher: &Dispatcher, query: DnsQuery, client: SocketAddr) {
    let start_time = Instant::now();
    let key = query.key();
    let resolution = dispatcher.resolver.resolve(&query).await;
    let response = resolution.encode(&query);

    if let Err(e) = socket.send_to(&response, client).await {
        warn!(client = %client, query = %key, error = %e, "Failed to send response");
    }

    let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
    match &resolution {
        Resolution::Cached(_) => {
            dispatcher.stats.record_cached(elapsed_ms);
            dispatcher.logger.cached(&key, elapsed_ms);
        }
        Resolution::Resolved {
            server,
            fallback,
            attempt,
            ..
        } => {
            dispatcher.stats.record_forwarded(elapsed_ms, *fallback);
            dispatcher
                .logger
                .forwarded(&key, elapsed_ms, *server, *fallback, attempt.len());
        }
        Resolution::Failed(attempt) => {
            dispatcher.stats.record_failed(elapsed_ms);
            dispatcher.logger.failed(&key, elapsed_ms, attempt.len());
        }
    }

    if resolution.answers().is_some() {
        if let Some(safety) = &dispatcher.safety {
            safety.spawn_assessment(query.domain);
        }
    }
}
