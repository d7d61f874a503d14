use clap::Parser;
use policy_core::{
    api::build_router, directives::SqliteDirectiveTable, store::SqliteSettingsStore, Engine,
    EngineConfig,
};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use tracing::info;
use url::Url;

const DEFAULT_PORT: u16 = 17610;

#[derive(Parser, Debug)]
#[command(name = "policy_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17610
    /// - ip (implies port 17610), e.g. 127.0.0.1
    /// - localhost[:port]
    #[arg(long, default_value = "127.0.0.1:17610")]
    listen: String,

    /// SQLite database path. Settings and installed directives share it.
    #[arg(long, default_value = "./data/policy-core.db")]
    db: PathBuf,

    /// Block page that redirects point at.
    #[arg(long, default_value = "chrome-extension://policy-guard/block.html")]
    interstitial_url: String,

    /// How long a temporary allow keeps a rule uninstalled.
    #[arg(long, default_value_t = 15)]
    grace_seconds: u64,

    /// Pending engine commands before callers wait.
    #[arg(long, default_value_t = 64)]
    queue_depth: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "policy_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let interstitial = Url::parse(&args.interstitial_url).map_err(|e| {
        anyhow::anyhow!("invalid --interstitial-url '{}': {e}", args.interstitial_url)
    })?;

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = SqliteSettingsStore::open(&args.db)?;
    let table = SqliteDirectiveTable::open(&args.db)?;
    let engine = Engine::new(
        store,
        table,
        EngineConfig {
            interstitial,
            grace: Duration::from_secs(args.grace_seconds),
        },
    );
    let (handle, engine_task) = engine.spawn(args.queue_depth);

    let app = build_router(handle);
    let addr = parse_listen(&args.listen)?;
    info!("Policy core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last handle; the engine drains and exits.
    engine_task.await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        let port: u16 = port_str.parse().map_err(|_| {
            anyhow::anyhow!(
                "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                input,
                DEFAULT_PORT
            )
        })?;
        if host == "localhost" {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
        // Fully written IPv6 without brackets, e.g. fe80:0:0:0:0:0:0:1:17610.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
