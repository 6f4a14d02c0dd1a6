pub mod health;
pub mod queues;

use axum::{
    routing::{get, post},
    Router,
};
use event_bus::DurableQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state for the operator API
#[derive(Clone, Default)]
pub struct AppState {
    queues: Arc<HashMap<String, Arc<dyn DurableQueue>>>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(queues: Vec<Arc<dyn DurableQueue>>) -> Self {
        let queues = queues
            .into_iter()
            .map(|q| (q.name().to_string(), q))
            .collect();
        Self {
            queues: Arc::new(queues),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<dyn DurableQueue>> {
        self.queues.get(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ready", get(health::ready))
        .route("/api/queues/{queue}/depth", get(queues::get_depth))
        .route("/api/queues/{queue}/dead-letters", get(queues::list_dead_letters))
        .route(
            "/api/queues/{queue}/dead-letters/{message_id}/redrive",
            post(queues::redrive),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}
