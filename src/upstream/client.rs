//! UDP client for upstream resolvers.
//!
//! Each attempt uses its own ephemeral socket connected to the server, so
//! ICMP port-unreachable surfaces as a refusal and replies from other
//! sources are filtered by the kernel. Replies whose id does not match
//! are discarded and the wait continues until the deadline.

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::dns::{DnsQuery, DnsReply, MAX_MESSAGE_SIZE, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED};
use crate::error::UpstreamError;

/// Sends one question to one upstream server.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Query `server` for `query`'s question, giving up after `timeout`.
    ///
    /// Returns the parsed reply for NOERROR and NXDOMAIN responses; every
    /// other outcome is an error.
    async fn query(
        &self,
        server: SocketAddr,
        query: &DnsQuery,
        timeout: Duration,
    ) -> Result<DnsReply, UpstreamError>;
}

/// Plain DNS over UDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpUpstream;

impl UdpUpstream {
    pub fn new() -> Self {
        Self
    }

    async fn exchange(&self, server: SocketAddr, query: &DnsQuery) -> Result<DnsReply, UpstreamError> {
        let io_err = |source: io::Error| {
            if source.kind() == io::ErrorKind::ConnectionRefused {
                UpstreamError::Refused { server }
            } else {
                UpstreamError::Io { server, source }
            }
        };

        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
        socket.connect(server).await.map_err(io_err)?;

        let id = rand::random::<u16>();
        let message = query.upstream_message(id);
        socket.send(&message).await.map_err(io_err)?;
        debug!(server = %server, id, bytes_sent = message.len(), "Upstream query sent");

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let len = socket.recv(&mut buf).await.map_err(io_err)?;
            let reply = DnsReply::parse(&buf[..len]).map_err(|e| UpstreamError::Malformed {
                server,
                reason: e.to_string(),
            })?;

            if reply.id != id {
                trace!(server = %server, expected = id, got = reply.id, "Discarding reply with mismatched id");
                continue;
            }

            return match reply.rcode {
                RCODE_NOERROR | RCODE_NXDOMAIN => Ok(reply),
                RCODE_REFUSED => Err(UpstreamError::Refused { server }),
                rcode => Err(UpstreamError::Rcode { server, rcode }),
            };
        }
    }
}

#[async_trait]
impl UpstreamTransport for UdpUpstream {
    async fn query(
        &self,
        server: SocketAddr,
        query: &DnsQuery,
        timeout: Duration,
    ) -> Result<DnsReply, UpstreamError> {
        tokio::time::timeout(timeout, self.exchange(server, query))
            .await
            .map_err(|_| UpstreamError::Timeout { server, timeout })?
    }
}
