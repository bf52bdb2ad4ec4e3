use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use sidestep::cache::DnsCache;
use sidestep::dns::{DnsQuery, DnsRecord, DnsReply, MAX_MESSAGE_SIZE, RCODE_NOERROR, TYPE_A, build_query};
use sidestep::filter::{Blocklist, IpValidator};
use sidestep::integrations::LogNotifier;
use sidestep::proxy::{Proxy, ProxyConfig};
use sidestep::resolver::{Resolver, ResolverSettings};
use sidestep::stats::Stats;
use sidestep::upstream::{RegistryConfig, UdpUpstream, UpstreamRegistry};

/// Real UDP upstream answering every A query with `addr`.
async fn spawn_upstream(addr: Ipv4Addr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = DnsQuery::parse(&buf[..len]) else {
                continue;
            };
            let reply = query.answer(&[DnsRecord::a(&query.domain, addr, 60)]);
            let _ = socket.send_to(&reply, src).await;
        }
    });
    local
}

/// Slow upstream that records how many queries it is holding at once.
async fn spawn_slow_upstream(delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let local = socket.local_addr().unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let seen = peak.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = DnsQuery::parse(&buf[..len]) else {
                continue;
            };
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            let socket = socket.clone();
            let active = active.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let reply = query.answer(&[DnsRecord::a(&query.domain, Ipv4Addr::new(93, 184, 216, 34), 60)]);
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = socket.send_to(&reply, src).await;
            });
        }
    });
    (local, seen)
}

struct Running {
    addr: SocketAddr,
    stats: Arc<Stats>,
    shutdown: oneshot::Sender<()>,
}

async fn start_proxy(primary: SocketAddr) -> Running {
    start_proxy_with(primary, ProxyConfig::new("127.0.0.1:0".parse().unwrap())).await
}

async fn start_proxy_with(primary: SocketAddr, config: ProxyConfig) -> Running {
    let resolver = Resolver::new(
        Arc::new(DnsCache::default()),
        Arc::new(UpstreamRegistry::new(primary, &[], RegistryConfig::default())),
        IpValidator::new(Blocklist::new()),
        Arc::new(UdpUpstream::new()),
        Arc::new(LogNotifier),
        ResolverSettings {
            attempt_timeout: Duration::from_secs(2),
            ..ResolverSettings::default()
        },
    );

    let proxy = Proxy::bind(config, Arc::new(resolver), None).await.unwrap();
    let addr = proxy.local_addr();
    let stats = proxy.stats();
    let (shutdown, rx) = oneshot::channel::<()>();
    tokio::spawn(proxy.serve(async {
        let _ = rx.await;
    }));

    Running { addr, stats, shutdown }
}

async fn exchange(client: &UdpSocket, proxy: SocketAddr, packet: &[u8]) -> DnsReply {
    client.send_to(packet, proxy).await.unwrap();
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("proxy answered")
        .unwrap();
    DnsReply::parse(&buf[..len]).unwrap()
}

#[tokio::test]
async fn answers_over_udp_with_client_id() {
    let upstream = spawn_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
    let proxy = start_proxy(upstream).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let reply = exchange(&client, proxy.addr, &build_query(0x1234, "example.com", TYPE_A)).await;

    assert_eq!(reply.id, 0x1234);
    assert_eq!(reply.rcode, RCODE_NOERROR);
    assert_eq!(
        reply.answers[0].address(),
        Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
    );

    let again = exchange(&client, proxy.addr, &build_query(0x4321, "example.com", TYPE_A)).await;
    assert_eq!(again.id, 0x4321);
    assert_eq!(again.answers.len(), 1);

    // Counters are bumped after the reply goes out.
    let mut cached = 0;
    for _ in 0..50 {
        cached = proxy.stats.cached.load(Ordering::Relaxed);
        if cached == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cached, 1);

    let _ = proxy.shutdown.send(());
}

#[tokio::test]
async fn malformed_datagrams_are_dropped() {
    let upstream = spawn_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
    let proxy = start_proxy(upstream).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(&[0xde, 0xad, 0xbe], proxy.addr).await.unwrap();
    client.send_to(&vec![0u8; MAX_MESSAGE_SIZE + 1], proxy.addr).await.unwrap();

    // The next reply belongs to the valid query; the junk got no answer.
    let reply = exchange(&client, proxy.addr, &build_query(9, "example.com", TYPE_A)).await;
    assert_eq!(reply.id, 9);
    assert_eq!(proxy.stats.dropped.load(Ordering::Relaxed), 2);

    let _ = proxy.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_queries_are_bounded() {
    let (upstream, peak) = spawn_slow_upstream(Duration::from_millis(150)).await;
    let proxy = start_proxy_with(
        upstream,
        ProxyConfig {
            max_in_flight: 2,
            ..ProxyConfig::new("127.0.0.1:0".parse().unwrap())
        },
    )
    .await;

    let clients = (0..6u16).map(|i| {
        let addr = proxy.addr;
        tokio::spawn(async move {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let packet = build_query(i, &format!("slow{i}.example"), TYPE_A);
            exchange(&client, addr, &packet).await
        })
    });
    for (i, reply) in futures::future::join_all(clients).await.into_iter().enumerate() {
        let reply = reply.unwrap();
        assert_eq!(reply.id, i as u16);
        assert_eq!(reply.answers.len(), 1);
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let _ = proxy.shutdown.send(());
}
