//! DDoS defense engine
//!
//! Driver binary: loads configuration, wires the collaborators, starts the
//! orchestrator and serves the HTTP control surface.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chrono::{Duration, Utc};
use dotenv::dotenv;
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;

use ddos_defense_engine::api::{self, ApiState};
use ddos_defense_engine::config;
use ddos_defense_engine::core::cloudflare::CloudflareEnforcer;
use ddos_defense_engine::core::reputation::HttpReputationClient;
use ddos_defense_engine::core::{
    BlockEventStore, DefenseContext, DefenseOrchestrator, Enforcer, LogOnlyEnforcer,
    MemoryBlockStore, RedisBlockStore,
};

const STORE_PRUNE_INTERVAL_SECS: u64 = 3600;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting DDoS defense engine...");

    let mut settings = config::load_config().context("Failed to load configuration")?;
    settings.block_rules.malicious_score_threshold = settings.reputation.malicious_score_threshold;
    settings.block_rules.reputation_cache_ttl_secs = settings.reputation.cache_ttl_secs;

    if settings.metrics.enabled {
        let addr: SocketAddr = settings
            .metrics
            .listen_address
            .parse()
            .context("Invalid metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics on {}", addr);
    }

    let store: Arc<dyn BlockEventStore> = if settings.redis.enabled {
        let redis_client = Client::open(settings.redis.url.as_str())
            .context("Failed to create Redis client")?;
        let store = Arc::new(RedisBlockStore::new(redis_client));
        let retention = Duration::days(settings.redis.retention_days);
        let pruner = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(STORE_PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match pruner.prune_before(Utc::now() - retention).await {
                    Ok(removed) => info!("Pruned {} expired block events", removed),
                    Err(e) => error!("Block event pruning failed: {}", e),
                }
            }
        });
        store
    } else {
        Arc::new(MemoryBlockStore::new(settings.history.memory_capacity))
    };

    let enforcer: Arc<dyn Enforcer> = if settings.cloudflare.enabled {
        info!("Enforcing blocks through Cloudflare zone {}", settings.cloudflare.zone_id);
        Arc::new(CloudflareEnforcer::new(settings.cloudflare.clone()))
    } else {
        info!("No enforcer configured, blocks are logged only");
        Arc::new(LogOnlyEnforcer)
    };

    let mut context = DefenseContext::from_config(&settings, store, enforcer)?;
    if settings.reputation.enabled {
        let client = HttpReputationClient::new(settings.reputation.clone())?;
        context = context.with_reputation(Arc::new(client));
    }

    let orchestrator = Arc::new(DefenseOrchestrator::new(
        Arc::new(context),
        settings.orchestrator.clone(),
    ));
    orchestrator.start()?;

    // Create API state
    let state = web::Data::new(ApiState {
        orchestrator: Arc::clone(&orchestrator),
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((settings.server.host.as_str(), settings.server.port))?
        .run()
        .await?;

    orchestrator.stop().await?;
    info!("DDoS defense engine stopped");
    Ok(())
}
