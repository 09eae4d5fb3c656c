use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oidc_gate::{
    config::Config, router, session::SessionManager, store::MemorySessionStore, AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oidc_gate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Starting OIDC relying-party gateway");

    // Create HTTP client shared by discovery, token, and JWKS fetches
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
        .build()?;

    // Session store lives for the process lifetime only
    let repository = Arc::new(MemorySessionStore::new());

    let sessions = Arc::new(SessionManager::new(
        repository,
        http_client,
        config.client_id.clone(),
        config.client_host.clone(),
        config.well_known_url.clone(),
    ));

    let app_state = AppState {
        config: config.clone(),
        sessions,
    };

    let app = router(app_state);

    // Start server
    let addr = config.server_address();
    info!("Listening on {}", addr);

    println!("\nOIDC Gate");
    println!("=========");
    println!("Server running at: http://localhost:{}", config.port);
    println!("  Login:  http://localhost:{}/auth/login", config.port);
    println!("  Status: http://localhost:{}/auth/status", config.port);
    println!("  Proxy:  http://localhost:{}/api/*\n", config.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
