mod handlers;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use rolegate_core::sync::EnforcementEngine;
use rolegate_storage::{DirectoryStore, IdentityProvider, MappingStore};

const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024; // 1 MB

const BASE_PATH: &str = "/auth/v3/partner/{partner}/organization/{organization}";

use crate::metrics::{self, Metrics};
use crate::service::UserService;

pub struct AppState<S, I, E>
where
    S: DirectoryStore + MappingStore,
    I: IdentityProvider,
    E: EnforcementEngine,
{
    pub service: Arc<UserService<S, I, E>>,
    pub metrics: Arc<Metrics>,
}

impl<S, I, E> Clone for AppState<S, I, E>
where
    S: DirectoryStore + MappingStore,
    I: IdentityProvider,
    E: EnforcementEngine,
{
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    metrics.record_request();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    if response.status().is_success() {
        metrics.record_success();
    } else {
        metrics.record_error();
    }
    tracing::debug!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );

    response
}

pub fn create_router<S, I, E>(state: AppState<S, I, E>) -> Router
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let metrics = Arc::clone(&state.metrics);

    Router::new()
        .route(
            &format!("{BASE_PATH}/users"),
            post(handlers::create_user).get(handlers::list_users),
        )
        // Shadows `/user/{name}/..` for a user named `id`; create rejects that name.
        .route(
            &format!("{BASE_PATH}/user/id/{{id}}"),
            get(handlers::get_user_by_id),
        )
        .route(
            &format!("{BASE_PATH}/user/{{name}}"),
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route(
            &format!("{BASE_PATH}/user/{{name}}/info"),
            get(handlers::user_info),
        )
        .route(
            &format!("{BASE_PATH}/user/{{name}}/reconcile"),
            post(handlers::reconcile_user),
        )
        .route(
            &format!("{BASE_PATH}/group/{{name}}/roles"),
            get(handlers::group_roles).put(handlers::set_group_roles),
        )
        .route("/healthz", get(handlers::healthz))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&metrics),
            metrics_middleware,
        ))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::metrics_handler).with_state(metrics),
        )
}
