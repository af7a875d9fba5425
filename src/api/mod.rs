//! HTTP control surface for the defense engine.
//!
//! An external capture agent posts packets and socket-table snapshots here;
//! operators read statistics, inspect blocks and history, and lift blocks by
//! hand.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Duration, Utc};
use log::error;
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::DefenseOrchestrator;
use crate::core::rule_engine::ConnectionFact;
use crate::core::size_distribution::SizeDistributionStats;
use crate::core::{ConnectionRecord, PacketRecord, StatisticsSnapshot};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

pub struct ApiState {
    pub orchestrator: Arc<DefenseOrchestrator>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/stats").route(web::get().to(stats)))
            .service(web::resource("/packets").route(web::post().to(ingest_packets)))
            .service(web::resource("/connections").route(web::post().to(ingest_connections)))
            .service(web::resource("/evaluate").route(web::post().to(evaluate)))
            .service(web::resource("/rate-limits/blocked").route(web::get().to(blocked)))
            .service(web::resource("/rate-limits/ip/{ip}").route(web::delete().to(unblock_ip)))
            .service(web::resource("/history").route(web::get().to(history)))
            .service(web::resource("/signatures").route(web::get().to(signatures))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    running: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    statistics: StatisticsSnapshot,
    size_distribution: SizeDistributionStats,
    tracked_limiters: usize,
    signatures: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    /// Packets refused for a timestamp too far from the local clock
    #[serde(default)]
    pub rejected: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running: state.orchestrator.is_running(),
    })
}

async fn stats(state: web::Data<ApiState>) -> impl Responder {
    let context = state.orchestrator.context();
    HttpResponse::Ok().json(StatsResponse {
        statistics: context.statistics.snapshot(),
        size_distribution: context.analyzer.size_analyzer().distribution_statistics(),
        tracked_limiters: context.rate_limiter.tracked_limiters(),
        signatures: context.analyzer.signatures().len(),
    })
}

fn stopped() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(ErrorResponse {
        error: "defense system is stopped".to_string(),
    })
}

/// Packet intake for an external capture agent
async fn ingest_packets(
    state: web::Data<ApiState>,
    packets: web::Json<Vec<PacketRecord>>,
) -> impl Responder {
    if !state.orchestrator.is_running() {
        return stopped();
    }
    let packets = packets.into_inner();
    let total = packets.len();
    let accepted = state.orchestrator.submit_batch(packets);
    HttpResponse::Accepted().json(IngestResponse {
        accepted,
        rejected: total - accepted,
    })
}

/// Socket-table snapshot intake; replaces any snapshot not yet analyzed
async fn ingest_connections(
    state: web::Data<ApiState>,
    connections: web::Json<Vec<ConnectionRecord>>,
) -> impl Responder {
    let connections = connections.into_inner();
    let accepted = connections.len();
    if !state.orchestrator.submit_connections(connections) {
        return stopped();
    }
    HttpResponse::Accepted().json(IngestResponse {
        accepted,
        rejected: 0,
    })
}

async fn evaluate(state: web::Data<ApiState>, fact: web::Json<ConnectionFact>) -> impl Responder {
    let decision = state.orchestrator.context().rule_engine.evaluate(&fact);
    HttpResponse::Ok().json(decision)
}

async fn blocked(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.orchestrator.context().rate_limiter.blocked(Utc::now()))
}

/// Manual override: lifts the limiter block and any enforced block
async fn unblock_ip(state: web::Data<ApiState>, ip: web::Path<IpAddr>) -> impl Responder {
    let result = state.orchestrator.remove_block(ip.into_inner()).await;
    HttpResponse::Ok().json(result)
}

async fn history(state: web::Data<ApiState>, query: web::Query<HistoryQuery>) -> impl Responder {
    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);

    match state.orchestrator.context().store.get_history(since, limit).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => {
            error!("Failed to load block history: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse { error: e.to_string() })
        }
    }
}

async fn signatures(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.orchestrator.context().analyzer.signatures().signatures())
}
