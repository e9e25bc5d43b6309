//! Health check HTTP endpoint for monitoring.

use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::metrics;
use crate::resilience::BreakerState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthResponse {
    /// "healthy", "degraded", or "critical".
    pub status: String,
    pub version: String,
    pub account_id: i64,
    pub contract: String,
    /// Event-channel health label.
    pub connection: String,
    /// "closed" or "open".
    pub breaker_state: String,
    pub position_open: bool,
    pub position_side: Option<String>,
    pub position_quantity: i64,
    /// Realized P&L for the current trading day, decimal as string.
    pub daily_pnl: String,
    pub trades_today: u32,
    /// True when daily limits or cooldown block new entries.
    pub trading_paused: bool,
    pub uptime_seconds: u64,
    pub timestamp: i64,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            account_id: 0,
            contract: String::new(),
            connection: "healthy".to_string(),
            breaker_state: "closed".to_string(),
            position_open: false,
            position_side: None,
            position_quantity: 0,
            daily_pnl: "0".to_string(),
            trades_today: 0,
            trading_paused: false,
            uptime_seconds: 0,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Shared health state, written by the engine each cycle.
pub type HealthState = Arc<RwLock<HealthResponse>>;

pub fn create_health_state() -> HealthState {
    Arc::new(RwLock::new(HealthResponse::default()))
}

/// Apply one engine-side update. Derives the overall status and stamps
/// the response time.
pub async fn update<F>(state: &HealthState, apply: F)
where
    F: FnOnce(&mut HealthResponse),
{
    let mut health = state.write().await;
    apply(&mut health);
    health.status = derive_status(&health);
    health.timestamp = Utc::now().timestamp();
}

fn derive_status(health: &HealthResponse) -> String {
    if health.connection == "dead" {
        return "critical".to_string();
    }
    if health.connection == "degraded"
        || health.breaker_state == "open"
        || health.trading_paused
    {
        return "degraded".to_string();
    }
    "healthy".to_string()
}

pub fn format_breaker_state(state: BreakerState) -> String {
    match state {
        BreakerState::Closed => "closed".to_string(),
        BreakerState::Open => "open".to_string(),
    }
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> Json<HealthResponse> {
    let health = state.read().await.clone();
    Json(health)
}

async fn metrics_endpoint() -> String {
    metrics::gather_metrics()
}

pub async fn run_health_server(port: u16, state: HealthState) {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Health check server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(
                "Health server failed to bind to {}: {}. Engine continues without health endpoint.",
                addr,
                e
            );
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Health check server failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_follows_connection_and_breaker() {
        let state = create_health_state();

        update(&state, |h| h.connection = "degraded".to_string()).await;
        assert_eq!(state.read().await.status, "degraded");

        update(&state, |h| h.connection = "dead".to_string()).await;
        assert_eq!(state.read().await.status, "critical");

        update(&state, |h| {
            h.connection = "healthy".to_string();
            h.breaker_state = "open".to_string();
        })
        .await;
        assert_eq!(state.read().await.status, "degraded");

        update(&state, |h| h.breaker_state = "closed".to_string()).await;
        assert_eq!(state.read().await.status, "healthy");
    }

    #[tokio::test]
    async fn paused_trading_degrades_status() {
        let state = create_health_state();
        update(&state, |h| h.trading_paused = true).await;
        let health = state.read().await.clone();
        assert_eq!(health.status, "degraded");
        assert!(health.trading_paused);
    }
}
