//! Read-only admin HTTP surface plus the manual reseed trigger.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::data_model::Member;
use crate::metrics::StatsSnapshot;
use crate::scheduler::EtcdScheduler;

#[derive(Clone)]
pub struct RouteState {
    pub scheduler: Arc<EtcdScheduler>,
}

pub fn create_routes(state: RouteState) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/members", get(members))
        .route("/reseed", post(reseed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn stats(State(state): State<RouteState>) -> Json<StatsSnapshot> {
    Json(state.scheduler.stats.snapshot())
}

async fn members(State(state): State<RouteState>) -> Json<Vec<Member>> {
    let mut members: Vec<Member> = state
        .scheduler
        .running_copy()
        .await
        .into_values()
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    Json(members)
}

async fn reseed(State(state): State<RouteState>) -> &'static str {
    info!("manual reseed requested over the admin api");
    tokio::spawn(state.scheduler.clone().reseed_cluster());
    "reseeding"
}
