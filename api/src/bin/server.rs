use murmur_api::AppState;
use murmur_api::config::AppConfig;
use murmur_api::db;
use murmur_api::realtime::Hub;
use murmur_api::realtime::relay::Relay;
use murmur_api::routes::build_router;
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_api=debug,tower_http=debug".parse().unwrap()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("starting server on {}", config.listen_addr);

    let pool = db::connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    db::migrate(&pool).await.expect("failed to run migrations");

    #[cfg(feature = "postgres")]
    let relay = Relay::postgres(pool.clone());
    #[cfg(not(feature = "postgres"))]
    let relay = Relay::local();

    let hub = Hub::new(pool, config.hub.clone(), relay.clone());
    if relay.spawn_listener(hub.registry().clone()).is_some() {
        tracing::info!(origin = relay.origin(), "cross-process relay enabled");
    }

    {
        let hub = hub.clone();
        let interval = config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let stats = hub.purge_expired().await;
                if !stats.is_empty() {
                    tracing::info!(
                        guard = stats.guard,
                        drafts = stats.drafts,
                        lanes = stats.lanes,
                        relay_spill = stats.relay_spill,
                        "expired entries purged"
                    );
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        hub,
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");
    tracing::info!("listening on {}", config.listen_addr);
    axum::serve(listener, app).await.expect("server error");
}
