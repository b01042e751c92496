use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rolegate_core::sync::EnforcementEngine;
use rolegate_storage::{DirectoryStore, IdentityProvider, MappingStore};
use serde::Deserialize;

use crate::error::ApiError;
use crate::service::ListOptions;

use super::AppState;
use super::types::*;

#[derive(Debug, Deserialize)]
pub struct TenantPath {
    partner: String,
    organization: String,
}

#[derive(Debug, Deserialize)]
pub struct NamePath {
    partner: String,
    organization: String,
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct IdPath {
    partner: String,
    organization: String,
    id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub async fn create_user<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<TenantPath>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let user = state
        .service
        .create(&path.partner, &path.organization, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

pub async fn list_users<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<TenantPath>,
    Query(options): Query<ListOptions>,
) -> Result<Json<UserListResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let list = state
        .service
        .list(&path.partner, &path.organization, &options)
        .await?;
    Ok(Json(list.into()))
}

pub async fn get_user<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
) -> Result<Json<UserResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let user = state
        .service
        .get_by_name(&path.partner, &path.organization, &path.name)
        .await?;
    Ok(Json(user.into()))
}

pub async fn get_user_by_id<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<IdPath>,
) -> Result<Json<UserResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let user = state
        .service
        .get_by_id(&path.partner, &path.organization, &path.id)
        .await?;
    Ok(Json(user.into()))
}

pub async fn update_user<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let user = state
        .service
        .update(&path.partner, &path.organization, &path.name, req.into())
        .await?;
    Ok(Json(user.into()))
}

pub async fn delete_user<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
) -> Result<StatusCode, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    state
        .service
        .delete(&path.partner, &path.organization, &path.name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn user_info<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
) -> Result<Json<UserInfoResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let info = state
        .service
        .user_info(&path.partner, &path.organization, &path.name)
        .await?;
    Ok(Json(info.into()))
}

pub async fn reconcile_user<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
) -> Result<Json<ReconcileResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let report = state
        .service
        .reconcile(&path.partner, &path.organization, &path.name)
        .await?;
    Ok(Json(report.into()))
}

pub async fn group_roles<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
) -> Result<Json<GroupRolesResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let roles = state
        .service
        .group_roles(&path.partner, &path.organization, &path.name)
        .await?;
    Ok(Json(roles.into()))
}

pub async fn set_group_roles<S, I, E>(
    State(state): State<AppState<S, I, E>>,
    Path(path): Path<NamePath>,
    Json(req): Json<GroupRolesRequest>,
) -> Result<Json<GroupRolesResponse>, ApiError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let roles = state
        .service
        .set_group_roles(&path.partner, &path.organization, &path.name, &req.roles)
        .await?;
    Ok(Json(roles.into()))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
