use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::poll::CycleReport;

/// Tracks poll cycles for health reporting.
#[derive(Debug, Default)]
pub struct PollTracker {
    cycles: u64,
    failed_cycles: u64,
    last_report: Option<CycleReport>,
    last_error: Option<String>,
    last_cycle_at: Option<DateTime<Utc>>,
}

/// Serializable snapshot for the health endpoint.
#[derive(Debug, Serialize)]
pub struct PollSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

impl PollTracker {
    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.last_report = Some(report.clone());
        self.last_error = None;
        self.last_cycle_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &str) {
        self.cycles += 1;
        self.failed_cycles += 1;
        self.last_error = Some(error.to_string());
        self.last_cycle_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
            last_cycle_at: self.last_cycle_at,
            last_report: self.last_report.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

pub type SharedTracker = Arc<Mutex<PollTracker>>;

pub fn router(tracker: SharedTracker) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(tracker)
}

async fn health(State(tracker): State<SharedTracker>) -> Json<Value> {
    let snapshot = match tracker.lock() {
        Ok(t) => t.snapshot(),
        Err(poisoned) => poisoned.into_inner().snapshot(),
    };
    let status = if snapshot.last_error.is_some() { "degraded" } else { "ok" };
    Json(json!({"status": status, "role": "poll", "poll": snapshot}))
}

pub async fn run_health_server(port: u16, tracker: SharedTracker) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(tracker)).await?;
    Ok(())
}
