//! Live migration endpoints

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::Json;

use super::schemas::{
    CreateMigrationRequest, DeletedEnvelope, MigrationDto, MigrationEnvelope,
};
use super::{handle_error, ApiError, ApiResult, AppState};
use crate::types::HostId;

#[utoipa::path(
    get,
    path = "/api/migrations",
    tag = "migration",
    responses((status = 200, description = "All migration records", body = [MigrationDto]))
)]
pub async fn list_migrations(
    Extension(state): Extension<AppState>,
) -> ApiResult<Vec<MigrationDto>> {
    let records = state.control.list_migrations().map_err(handle_error)?;
    Ok(Json(records.iter().map(MigrationDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/migrations",
    tag = "migration",
    request_body = CreateMigrationRequest,
    responses(
        (status = 202, description = "Migration started; poll the status URL", body = MigrationEnvelope),
        (status = 409, description = "VM not running or already migrating", body = ErrorResponse)
    )
)]
pub async fn create_migration(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateMigrationRequest>,
) -> Result<(StatusCode, Json<MigrationEnvelope>), ApiError> {
    let destination: HostId = request.destination.parse().map_err(handle_error)?;
    let vm = state
        .control
        .start_migration(
            &request.vm_name,
            destination,
            request.bandwidth_limit,
            request.max_downtime_ms,
            request.compressed,
            request.shared_storage,
        )
        .map_err(handle_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MigrationEnvelope {
            status: "accepted".into(),
            status_url: format!("/api/migrations/{}/status", vm),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/migrations/{vm}/status",
    tag = "migration",
    params(("vm" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "Current migration record", body = MigrationDto),
        (status = 404, description = "No migration for this VM", body = ErrorResponse)
    )
)]
pub async fn migration_status(
    Extension(state): Extension<AppState>,
    Path(vm): Path<String>,
) -> ApiResult<MigrationDto> {
    let (record, _) = state.control.migration_status(&vm).map_err(handle_error)?;
    Ok(Json((&record).into()))
}

#[utoipa::path(
    delete,
    path = "/api/migrations/{vm}",
    tag = "migration",
    params(("vm" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "Abort requested on the source hypervisor", body = DeletedEnvelope),
        (status = 409, description = "Migration already finished", body = ErrorResponse)
    )
)]
pub async fn cancel_migration(
    Extension(state): Extension<AppState>,
    Path(vm): Path<String>,
) -> ApiResult<DeletedEnvelope> {
    state
        .control
        .cancel_migration(&vm)
        .await
        .map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "cancelling".into(),
        revision: 0,
    }))
}
