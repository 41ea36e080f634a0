use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpServer};
use fanout_service::consumers::FanoutConsumer;
use fanout_service::handlers::{events, feed, websocket as ws_routes};
use fanout_service::queue::{FanoutQueue, QueueConfig, RetryPolicy};
use fanout_service::stores::{FeedStore, RedisFeedStore, RedisSocialGraphStore, SocialGraphStore};
use fanout_service::{metrics, AppState, Config, FanoutService, PushHub};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fanout service");

    let config = Config::from_env()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let client = redis::Client::open(config.redis.url.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("redis client: {}", e)))?;
    let redis = redis::aio::ConnectionManager::new(client)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("redis connect: {}", e)))?;
    tracing::info!("Connected to Redis");

    let feeds: Arc<dyn FeedStore> = Arc::new(RedisFeedStore::new(
        redis.clone(),
        config.feed.capacity,
        config.feed.tombstone_ttl_secs,
    ));
    let graph: Arc<dyn SocialGraphStore> = Arc::new(RedisSocialGraphStore::new(redis.clone()));
    let hub = PushHub::new();

    let queue = FanoutQueue::new(
        redis,
        QueueConfig {
            stream: config.fanout.stream.clone(),
            group: config.fanout.group.clone(),
            consumer_name: config.fanout.consumer_name.clone(),
            batch_size: config.fanout.batch_size,
            visibility_timeout: Duration::from_secs(config.fanout.visibility_timeout_secs),
            ..QueueConfig::default()
        },
    );

    let service = Arc::new(FanoutService::new(
        feeds.clone(),
        graph.clone(),
        hub.clone(),
        config.fanout.chunk_size,
        config.fanout.follower_page_size,
    ));

    let consumer = FanoutConsumer::new(
        queue.clone(),
        service,
        RetryPolicy::new(config.fanout.retry_base_secs, config.fanout.retry_max_secs),
        config.fanout.max_attempts,
    );
    tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            tracing::error!(error = %e, "Fan-out consumer exited");
        }
    });

    let state = AppState {
        feeds,
        graph,
        hub,
        queue,
    };

    let addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Starting HTTP server on {}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(|cfg| {
                events::register_routes(cfg);
                feed::register_routes(cfg);
                ws_routes::register_routes(cfg);
            })
    })
    .bind(&addr)?
    .run()
    .await
}
