#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sidestep::cache::DnsCache;
use sidestep::dns::{DnsQuery, DnsRecord, DnsReply, RCODE_NOERROR, TYPE_A, build_query};
use sidestep::error::UpstreamError;
use sidestep::filter::{Blocklist, IpValidator};
use sidestep::integrations::RecordingNotifier;
use sidestep::resolver::{Resolver, ResolverSettings};
use sidestep::upstream::{RegistryConfig, UpstreamRegistry, UpstreamTransport};

/// What a scripted server does with a query.
pub enum Reply {
    Answer(Vec<DnsRecord>),
    /// Sleeps for the whole attempt timeout, then times out.
    Silent,
    Refused,
}

type Script = Arc<dyn Fn(&DnsQuery) -> Reply + Send + Sync>;

/// Upstream transport driven by per-server closures.
#[derive(Default)]
pub struct MockUpstream {
    scripts: HashMap<SocketAddr, Script>,
    calls: Mutex<Vec<(SocketAddr, String)>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<F>(mut self, server: SocketAddr, f: F) -> Self
    where
        F: Fn(&DnsQuery) -> Reply + Send + Sync + 'static,
    {
        self.scripts.insert(server, Arc::new(f));
        self
    }

    /// `server` answers every query with one A record per address.
    pub fn answers(self, server: SocketAddr, addrs: &[Ipv4Addr], ttl: u32) -> Self {
        let addrs = addrs.to_vec();
        self.script(server, move |q| {
            Reply::Answer(addrs.iter().map(|a| DnsRecord::a(&q.domain, *a, ttl)).collect())
        })
    }

    pub fn silent(self, server: SocketAddr) -> Self {
        self.script(server, |_| Reply::Silent)
    }

    pub fn calls(&self) -> Vec<(SocketAddr, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn servers_called(&self) -> Vec<SocketAddr> {
        self.calls().into_iter().map(|(server, _)| server).collect()
    }
}

#[async_trait]
impl UpstreamTransport for MockUpstream {
    async fn query(
        &self,
        server: SocketAddr,
        query: &DnsQuery,
        timeout: Duration,
    ) -> Result<DnsReply, UpstreamError> {
        self.calls.lock().unwrap().push((server, query.domain.clone()));

        let reply = match self.scripts.get(&server) {
            Some(script) => script(query),
            None => Reply::Silent,
        };
        match reply {
            Reply::Answer(answers) => Ok(DnsReply {
                id: query.id,
                rcode: RCODE_NOERROR,
                truncated: false,
                answers,
            }),
            Reply::Silent => {
                tokio::time::sleep(timeout).await;
                Err(UpstreamError::Timeout { server, timeout })
            }
            Reply::Refused => Err(UpstreamError::Refused { server }),
        }
    }
}

pub fn server(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, last)), 53)
}

pub fn query(id: u16, domain: &str) -> DnsQuery {
    DnsQuery::parse(&build_query(id, domain, TYPE_A)).unwrap()
}

pub struct Harness {
    pub resolver: Arc<Resolver>,
    pub upstream: Arc<MockUpstream>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(upstream: MockUpstream, primary: SocketAddr, fallbacks: &[SocketAddr], capacity: usize) -> Harness {
    let upstream = Arc::new(upstream);
    let notifier = Arc::new(RecordingNotifier::new());
    let resolver = Resolver::new(
        Arc::new(DnsCache::new(capacity, Duration::from_secs(300))),
        Arc::new(UpstreamRegistry::new(primary, fallbacks, RegistryConfig::default())),
        IpValidator::new(Blocklist::new()),
        upstream.clone(),
        notifier.clone(),
        ResolverSettings::default(),
    );
    Harness {
        resolver: Arc::new(resolver),
        upstream,
        notifier,
    }
}
