use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use sidestep::cache::DnsCache;
use sidestep::config::{CliOverrides, Config, DNS_PORT};
use sidestep::filter::{Blocklist, IpValidator};
use sidestep::integrations::{
    Disabled, Event, LogNotifier, Notifier, PlatformResolverConfig, ResolvConf, SafetyMonitor,
    Unmanaged, host_upstreams,
};
use sidestep::proxy::{Proxy, ProxyConfig};
use sidestep::resolver::{Resolver, ResolverSettings};
use sidestep::upstream::{UdpUpstream, UpstreamRegistry};

#[derive(Parser)]
#[command(name = "sidestep")]
#[command(about = "Local DNS proxy that routes around censored answers", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./sidestep.toml, then /etc/sidestep/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Primary upstream resolver (ip or ip:port), instead of the host's
    #[arg(long)]
    primary: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Point the system resolver at the proxy while it runs
    #[arg(long)]
    manage_system_resolver: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = CliOverrides {
        port: args.port,
        bind_address: args.bind,
        primary: args.primary,
        log_level: args.log_level,
        manage_resolver: args.manage_system_resolver,
    };
    let config = Config::load(args.config.as_deref(), overrides).context("failed to load configuration")?;

    init_logging(&config);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(config))
}

fn init_logging(config: &Config) {
    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn run(config: Config) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let platform = platform_for(&config);

    let fallbacks = config.fallbacks()?;
    let (primary, extra) = choose_primary(&config, platform.as_ref(), &fallbacks, notifier.as_ref())?;

    let registry = Arc::new(UpstreamRegistry::new(primary, &fallbacks, config.registry()));
    for server in extra {
        if registry.admit(server) {
            info!(server = %server, "Admitted host nameserver as fallback");
        }
    }

    let blocklist = Blocklist::load(config.blocking.file.as_deref(), &config.blocking.addresses)?;
    info!(entries = blocklist.len(), "Blocklist loaded");

    let resolver = Arc::new(Resolver::new(
        Arc::new(DnsCache::new(config.cache.capacity, config.cache_ttl())),
        registry.clone(),
        IpValidator::new(blocklist),
        Arc::new(UdpUpstream::new()),
        notifier.clone(),
        ResolverSettings {
            attempt_timeout: config.attempt_timeout(),
            max_attempts: config.upstream.max_attempts,
            budget: config.resolution_budget(),
            max_ttl: config.cache_ttl(),
        },
    ));

    let safety = config.content_safety.enabled.then(|| {
        SafetyMonitor::new(
            Arc::new(Disabled),
            notifier.clone(),
            config.content_safety.max_in_flight,
            config.content_safety_timeout(),
        )
    });
    if safety.as_ref().is_some_and(|monitor| !monitor.is_active()) {
        warn!("Content safety is enabled but no checking backend is configured, domains will not be assessed");
    }

    let proxy_config = ProxyConfig {
        bind_addr: config.listen_addr()?,
        max_in_flight: config.server.max_in_flight,
        stats_interval: config.stats_interval(),
        purge_interval: config.purge_interval(),
        log_queries: config.logging.queries,
    };
    let proxy = Proxy::bind(proxy_config, resolver, safety).await?;

    if config.system.manage_resolver {
        point_host_at_proxy(platform.as_ref(), proxy.local_addr(), notifier.as_ref());
    }

    notifier.notify(Event::ServiceStarted {
        primary,
        fallbacks: registry.len() - 1,
    });

    proxy
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if config.system.manage_resolver {
        if let Err(e) = platform.restore_original() {
            notifier.notify(Event::ResolverError(format!("failed to restore system resolver: {e}")));
        }
    }
    notifier.notify(Event::ServiceStopped);
    Ok(())
}

fn platform_for(config: &Config) -> Arc<dyn PlatformResolverConfig> {
    let path = &config.system.resolv_conf;
    if config.system.manage_resolver {
        return Arc::new(ResolvConf::new(path));
    }
    match Unmanaged::from_file(path) {
        Ok(platform) => Arc::new(platform),
        Err(e) => {
            warn!(error = %e, "Could not read host resolver configuration");
            Arc::new(Unmanaged::new(Vec::new()))
        }
    }
}

/// The primary upstream and any extra host nameservers.
///
/// An explicit override wins. Otherwise the host's first non-loopback
/// nameserver is used, falling back to the first configured fallback.
fn choose_primary(
    config: &Config,
    platform: &dyn PlatformResolverConfig,
    fallbacks: &[SocketAddr],
    notifier: &dyn Notifier,
) -> Result<(SocketAddr, Vec<SocketAddr>)> {
    if let Some(primary) = config.primary_override()? {
        return Ok((primary, Vec::new()));
    }

    let default = fallbacks
        .first()
        .copied()
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT));

    match platform.current_nameservers() {
        Ok(nameservers) => match host_upstreams(&nameservers, DNS_PORT) {
            Some(found) => Ok(found),
            None => {
                warn!(fallback = %default, "Host has no usable nameserver, using fallback as primary");
                Ok((default, Vec::new()))
            }
        },
        Err(e) => {
            notifier.notify(Event::ResolverError(format!("could not detect primary resolver: {e}")));
            Ok((default, Vec::new()))
        }
    }
}

fn point_host_at_proxy(platform: &dyn PlatformResolverConfig, listen: SocketAddr, notifier: &dyn Notifier) {
    if listen.port() != DNS_PORT {
        warn!(addr = %listen, "Not listening on port 53, leaving system resolver unchanged");
        return;
    }
    let target = if listen.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        listen.ip()
    };

    let previous = platform
        .current_primary()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "none".to_string());
    match platform.set_primary(target) {
        Ok(()) => notifier.notify(Event::ResolverChanged {
            from: previous,
            to: target,
        }),
        Err(e) => notifier.notify(Event::ResolverError(format!("failed to update system resolver: {e}"))),
    }
}
