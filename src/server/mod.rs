// # HTTP Server
//
// The request layer: an axum router over an explicit `ServerContext` (the
// warehouse pool, the coordination store, the cache manager, the executor,
// and configuration). No ambient globals; everything a handler needs rides
// in the shared state.

pub mod auth;
mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheManager;
use crate::config::ServerConfig;
use crate::coordination::CoordinationStore;
use crate::error::FlowError;
use crate::executor::QueryRunner;
use crate::identity::QueryId;
use crate::state::QueryStateMachine;
use crate::warehouse::Warehouse;

/// Shared state for request handling.
pub struct ServerContext {
    pub config: ServerConfig,
    pub warehouse: Arc<dyn Warehouse>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub cache: CacheManager,
    pub runner: QueryRunner,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        warehouse: Arc<dyn Warehouse>,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Arc<Self> {
        let cache = CacheManager::new(Arc::clone(&warehouse), Arc::clone(&coordination));
        let runner = QueryRunner::new(
            Arc::clone(&warehouse),
            Arc::clone(&coordination),
            config.max_concurrent_executions,
        );
        Arc::new(Self {
            config,
            warehouse,
            coordination,
            cache,
            runner,
        })
    }

    pub fn state_machine(&self, qid: &QueryId) -> QueryStateMachine {
        QueryStateMachine::new(Arc::clone(&self.coordination), qid.clone())
    }
}

/// Assemble the router with the standard middleware stack.
pub fn build_router(context: Arc<ServerContext>) -> Router {
    let request_timeout = context.config.request_timeout;
    let max_body_size = context.config.max_body_size;
    Router::new()
        .route("/run", post(handlers::run_query))
        .route("/poll/{qid}", get(handlers::poll_query))
        .route("/get_result/{qid}", get(handlers::get_result))
        .route("/geography/{level}", get(handlers::geography))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_size))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(context)
}

impl IntoResponse for FlowError {
    fn into_response(self) -> Response {
        let status = match &self {
            FlowError::QueryParamsValidation(_)
            | FlowError::InvalidQueryKind(_)
            | FlowError::AggregationNotSupported(_) => StatusCode::BAD_REQUEST,
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match self {
            FlowError::QueryParamsValidation(messages) => {
                json!({ "error": "query parameters failed validation", "messages": messages })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
