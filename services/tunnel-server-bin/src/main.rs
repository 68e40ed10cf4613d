// tunnel-server: standalone HTTP long-polling tunnel relay.

mod config;

use tracing::info;
use tunnel_server::ConnectionRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tunnel-server starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        bind = %cfg.bind,
        poll_timeout_secs = cfg.poll_timeout_secs,
        cache_max_entries = cfg.cache_max_entries,
        cache_ttl_secs = cfg.cache_ttl_secs,
        reassembler_max_groups = cfg.reassembler_max_groups,
        "config loaded (cache/reassembler overrides reserved for future use; \
         poll/cache/reassembler bounds are currently fixed server-side)",
    );

    let registry = ConnectionRegistry::new();
    let app = tunnel_server::http::router(registry.clone()).route(
        "/healthz",
        axum::routing::get({
            let registry = registry.clone();
            move || {
                let registry = registry.clone();
                async move { axum::Json(tunnel_server::http::health_status(&registry).await) }
            }
        }),
    );

    let listener = match tokio::net::TcpListener::bind(&cfg.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind '{}': {}", cfg.bind, e);
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.bind, "listening");

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("FATAL: server error: {}", e);
        std::process::exit(1);
    }
}
