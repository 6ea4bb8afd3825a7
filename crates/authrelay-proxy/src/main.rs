use anyhow::Context;
use authrelay_proxy::config::{Config, MetricsConfig, UpstreamProxyConfig};
use authrelay_proxy::metrics_server::MetricsServer;
use authrelay_proxy::{CredentialSource, Proxy, ProxySettings};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "authrelay")]
#[command(author, version, about = "Local proxy that authenticates against upstream proxies")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "AUTHRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listener endpoints, e.g. "127.0.0.1:8888,backlog=64;[::1]:8888"
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream proxy as host:port (replaces the configured endpoints)
    #[arg(short, long)]
    proxy: Option<String>,

    /// Additional attempts per request after a 407
    #[arg(long)]
    retry_count: Option<usize>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(proxy) = &self.proxy {
            let bypass = config
                .upstream
                .take()
                .map(|u| u.bypass)
                .unwrap_or_default();
            config.upstream = Some(UpstreamProxyConfig {
                endpoints: vec![proxy.clone()],
                bypass,
            });
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(port) = self.metrics_port {
            config.metrics = Some(MetricsConfig { port });
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.load_config()?;
    let settings = ProxySettings::from_config(&config)?;
    let source = config.credential_source()?;
    if source.is_empty() && config.upstream.is_some() {
        warn!("No credentials configured; authentication challenges are passed to clients");
    }
    let source: Arc<dyn CredentialSource> = Arc::new(source);

    if let Some(metrics) = &config.metrics {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
        tokio::spawn(async move {
            if let Err(e) = MetricsServer::new(addr).run().await {
                warn!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let proxy = Proxy::new(settings);
    proxy
        .start(source)
        .await
        .context("Failed to start proxy")?;
    for addr in proxy.listener_addrs() {
        info!("authrelay listening on {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");

    if !proxy.stop(config.stop_timeout()).await {
        warn!(
            timeout_ms = config.stop_timeout_ms,
            "Some connections did not stop in time"
        );
    }
    proxy.dispose()?;
    Ok(())
}
