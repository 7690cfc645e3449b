//! Local query surface: the Prometheus scrape endpoint and JSON read
//! endpoints over the store and providers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vigil_discovery::Discovery;
use vigil_facts::{FactProvider, ProcessProvider};
use vigil_metrics::{render::render_families, GatherState, Registry};
use vigil_store::Store;
use vigil_task::{Runner, Shutdown};

pub struct ApiState {
    pub registry: Arc<Registry>,
    pub store: Store,
    pub facts: Arc<FactProvider>,
    pub processes: Arc<ProcessProvider>,
    pub discovery: Arc<Discovery>,
}

pub struct LocalApi {
    bind_address: String,
    state: Arc<ApiState>,
}

impl LocalApi {
    pub fn new(bind_address: String, state: Arc<ApiState>) -> LocalApi {
        LocalApi {
            bind_address,
            state,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics))
            .route("/v1/facts", get(facts))
            .route("/v1/processes", get(processes))
            .route("/v1/services", get(services))
            .route("/v1/points", get(points))
            .with_state(self.state.clone())
    }
}

async fn metrics(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let gather_state = GatherState::from_query(&params);
    let families = state.registry.gather_with_state(gather_state).await;
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_families(&families),
    )
}

async fn facts(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.facts.facts(Duration::from_secs(3600)))
}

async fn processes(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.processes.top_info(Duration::from_secs(10)).await {
        Ok(top) => Json(top).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "process listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn services(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.discovery.discovery(Duration::from_secs(3600)).await {
        Ok(services) => Json(services).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "discovery failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn points(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let since_secs: i64 = params
        .get("since_secs")
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);
    let since = Utc::now() - ChronoDuration::seconds(since_secs);
    let points: Vec<serde_json::Value> = state
        .store
        .latest_points()
        .into_iter()
        .filter(|p| p.time >= since)
        .map(|p| {
            json!({
                "labels": p.labels,
                "time": p.time,
                "value": p.value,
                "status": p.annotations.status,
            })
        })
        .collect();
    Json(points)
}

#[async_trait]
impl Runner for LocalApi {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .with_context(|| format!("unable to bind local API on {}", self.bind_address))?;
        tracing::info!(address = %self.bind_address, "local API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .context("local API server failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::MetricPoint;
    use vigil_common::PointPusher;

    #[tokio::test]
    async fn points_endpoint_serializes_store_content() {
        let store = Store::new();
        store.push_points(vec![MetricPoint::new("cpu_used", Utc::now(), 42.0)]);

        let points: Vec<serde_json::Value> = store
            .latest_points()
            .into_iter()
            .map(|p| json!({"labels": p.labels, "value": p.value}))
            .collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["value"], 42.0);
        assert_eq!(points[0]["labels"]["__name__"], "cpu_used");
    }
}
