use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use metriclink::client::{AuthFailed, Coordinator};
use metriclink::config::{self, ClientConfig, ProxyConfig};
use metriclink::server;

#[derive(Parser, Debug)]
#[command(
    name = "metriclink",
    version = env!("CARGO_PKG_VERSION"),
    about = "Reverse-tunnel metrics proxy",
    long_about = "MetricLink lets a metrics scraper reach HTTP endpoints behind NAT: \
                  clients dial out to the proxy and hold an encrypted tunnel through \
                  which scrapes are pushed back to them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "METRICLINK_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy server scrapers talk to
    Proxy {
        /// Address to listen on for proxied scrape requests
        #[arg(long = "web.proxy-address", default_value = "0.0.0.0:8080")]
        proxy_address: String,

        /// Address to listen on for client tunnel connections
        #[arg(long = "web.server-address", default_value = "0.0.0.0:7080")]
        server_address: String,

        /// Any scrape with a higher timeout is clamped to this
        #[arg(long = "scrape.max-timeout", default_value = "5m", value_parser = config::parse_duration)]
        max_timeout: Duration,

        /// Timeout used for scrapes that do not carry one
        #[arg(long = "scrape.default-timeout", default_value = "15s", value_parser = config::parse_duration)]
        default_timeout: Duration,

        /// Comma-separated accepted tokens, e.g. pwd-a,token-x
        #[arg(long = "auth.tokens", default_value = "")]
        tokens: String,

        /// File with comma-separated tokens; overrides --auth.tokens
        #[arg(long = "auth.token-file")]
        token_file: Option<PathBuf>,
    },

    /// Run the client that tunnels local scrape endpoints out
    Client {
        /// Proxy server address to dial
        #[arg(long, default_value = "127.0.0.1:7080")]
        proxy_addr: String,

        /// Shared token used to authenticate against the proxy
        #[arg(long, default_value = "")]
        auth_token: String,

        /// FQDN to register with; a random one is generated if omitted
        #[arg(long)]
        fqdn: Option<String>,

        /// Comma-separated metric endpoints, e.g. http://127.0.0.1:9100/metrics
        #[arg(long)]
        metrics: Option<String>,

        /// Label pairs injected into scraped metrics, e.g. node=my-node,region=shanghai
        #[arg(long)]
        label_pairs: Option<String>,

        /// Config file; values in it take priority over flags
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,
    },
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Proxy {
            proxy_address,
            server_address,
            max_timeout,
            default_timeout,
            tokens,
            token_file,
        } => {
            let tokens = config::resolve_tokens(&tokens, token_file.as_deref())?;
            server::run(ProxyConfig {
                proxy_address,
                server_address,
                max_scrape_timeout: max_timeout,
                default_scrape_timeout: default_timeout,
                tokens,
            })
            .await
        }

        Commands::Client {
            proxy_addr,
            auth_token,
            fqdn,
            metrics,
            label_pairs,
            config: config_file,
        } => {
            let mut cfg = ClientConfig {
                token: auth_token,
                proxy_addr,
                fqdn: fqdn.unwrap_or_default(),
                endpoints: metrics
                    .as_deref()
                    .map(config::parse_metric_endpoints)
                    .transpose()?
                    .unwrap_or_default(),
                label_pairs: label_pairs
                    .as_deref()
                    .map(config::parse_label_pairs)
                    .transpose()?
                    .unwrap_or_default(),
            };
            if let Some(path) = config_file {
                cfg = cfg.merge_file(ClientConfig::load(&path)?);
            }
            cfg.complete();
            run_client(cfg).await
        }
    }
}

/// Runs the client coordinator, restarting it with exponential backoff
/// until ctrl-c. A rejected handshake is fatal.
async fn run_client(cfg: ClientConfig) -> Result<()> {
    let coordinator = Coordinator::new(&cfg)?;
    info!("client fqdn: {}", coordinator.fqdn());

    let mut delay = INITIAL_BACKOFF;
    loop {
        let run = tokio::select! {
            result = coordinator.clone().run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down client");
                return Ok(());
            }
        };
        match run {
            Err(err) if err.is::<AuthFailed>() => return Err(err),
            Err(err) => warn!("coordinator exited: {err:#}"),
            Ok(()) => warn!("coordinator exited"),
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down client");
                return Ok(());
            }
        }
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}
