//! Benchmarks for end-to-end UDP request handling.
//!
//! Measures proxy performance with simulated upstream latency.
//! Uses realistic latency based on public DNS benchmarks:
//! - Cloudflare (1.1.1.1): ~5-18ms average
//! - Google (8.8.8.8): ~7-24ms average
//! We simulate ~15ms average with ±5ms jitter.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;

use sidestep::cache::DnsCache;
use sidestep::dns::{DnsQuery, DnsRecord, MAX_MESSAGE_SIZE, TYPE_A, build_query};
use sidestep::filter::IpValidator;
use sidestep::integrations::LogNotifier;
use sidestep::proxy::{Proxy, ProxyConfig};
use sidestep::resolver::{Resolver, ResolverSettings};
use sidestep::upstream::{RegistryConfig, UdpUpstream, UpstreamRegistry};

/// Simulated upstream latency (based on real-world DNS benchmarks)
const BASE_LATENCY_MS: u64 = 15;
const JITTER_MS: u64 = 5;

/// Simulate realistic upstream latency with jitter
async fn simulate_upstream_latency() {
    let jitter = rand::rng().random_range(0..=JITTER_MS * 2);
    let latency = BASE_LATENCY_MS - JITTER_MS + jitter;
    tokio::time::sleep(Duration::from_millis(latency)).await;
}

/// Mock UDP upstream answering every query with `answer`.
async fn mock_udp_upstream(socket: UdpSocket, answer: Ipv4Addr) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let Ok(query) = DnsQuery::parse(&buf[..len]) else {
            continue;
        };
        let socket = socket.clone();
        tokio::spawn(async move {
            simulate_upstream_latency().await;
            let response = query.answer(&[DnsRecord::a(&query.domain, answer, 300)]);
            let _ = socket.send_to(&response, src).await;
        });
    }
}

fn start_mock_upstream(answer: Ipv4Addr) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            tx.send(socket.local_addr().unwrap()).unwrap();
            mock_udp_upstream(socket, answer).await;
        });
    });

    rx.recv().unwrap()
}

fn start_proxy(primary: SocketAddr, fallbacks: Vec<SocketAddr>) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let resolver = Resolver::new(
                Arc::new(DnsCache::default()),
                Arc::new(UpstreamRegistry::new(primary, &fallbacks, RegistryConfig::default())),
                IpValidator::default(),
                Arc::new(UdpUpstream::new()),
                Arc::new(LogNotifier),
                ResolverSettings::default(),
            );
            let proxy = Proxy::bind(
                ProxyConfig::new("127.0.0.1:0".parse().unwrap()),
                Arc::new(resolver),
                None,
            )
            .await
            .unwrap();
            tx.send(proxy.local_addr()).unwrap();
            proxy.serve(std::future::pending()).await;
        });
    });

    rx.recv().unwrap()
}

async fn request(proxy_addr: SocketAddr, query: &[u8]) -> usize {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, proxy_addr).await.unwrap();

    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap()
        .0
}

fn bench_udp_request(c: &mut Criterion) {
    let real = start_mock_upstream(Ipv4Addr::new(93, 184, 216, 34));
    let censoring = start_mock_upstream(Ipv4Addr::LOCALHOST);
    let direct = start_proxy(real, Vec::new());
    let rerouted = start_proxy(censoring, vec![real]);

    let rt = Runtime::new().unwrap();
    let counter = AtomicU32::new(0);

    let mut group = c.benchmark_group("udp");
    group.throughput(Throughput::Elements(1));

    let cached_query = build_query(0x1234, "example.com", TYPE_A);
    rt.block_on(request(direct, &cached_query));
    group.bench_function(BenchmarkId::new("request_handling", "cache_hit"), |b| {
        b.to_async(&rt).iter(|| request(direct, &cached_query));
    });

    group.bench_function(BenchmarkId::new("request_handling", "primary"), |b| {
        b.to_async(&rt).iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let query = build_query(n as u16, &format!("miss{n}.example.com"), TYPE_A);
            async move { request(direct, &query).await }
        });
    });

    group.bench_function(BenchmarkId::new("request_handling", "fallback"), |b| {
        b.to_async(&rt).iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let query = build_query(n as u16, &format!("censored{n}.example.com"), TYPE_A);
            async move { request(rerouted, &query).await }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_udp_request);
criterion_main!(benches);
