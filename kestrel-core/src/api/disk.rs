//! Block volume endpoints

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::Json;

use super::schemas::{
    CreateDiskRequest, DeletedEnvelope, DiskAttachRequest, DiskDto, DiskEnvelope,
    ResizeDiskRequest,
};
use super::{handle_error, ApiError, ApiResult, AppState};
use crate::types::DiskId;

#[utoipa::path(
    get,
    path = "/api/disks",
    tag = "disk",
    responses((status = 200, description = "All disks", body = [DiskDto]))
)]
pub async fn list_disks(Extension(state): Extension<AppState>) -> ApiResult<Vec<DiskDto>> {
    let disks = state.control.list_disks().map_err(handle_error)?;
    Ok(Json(disks.iter().map(DiskDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/disks",
    tag = "disk",
    request_body = CreateDiskRequest,
    responses(
        (status = 201, description = "Disk created", body = DiskEnvelope),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    )
)]
pub async fn create_disk(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateDiskRequest>,
) -> Result<(StatusCode, Json<DiskEnvelope>), ApiError> {
    let (disk, revision) = state
        .control
        .create_disk(&request.name, request.size_gb)
        .map_err(handle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(DiskEnvelope {
            status: "created".into(),
            resource: (&disk).into(),
            revision,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/disks/{id}",
    tag = "disk",
    params(("id" = String, Path, description = "Disk id")),
    responses(
        (status = 200, description = "Disk deleted", body = DeletedEnvelope),
        (status = 409, description = "Disk is attached", body = ErrorResponse)
    )
)]
pub async fn delete_disk(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeletedEnvelope> {
    let id: DiskId = id.parse().map_err(handle_error)?;
    let revision = state.control.delete_disk(&id).map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "deleted".into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/disks/{id}/resize",
    tag = "disk",
    params(("id" = String, Path, description = "Disk id")),
    request_body = ResizeDiskRequest,
    responses(
        (status = 200, description = "Disk grown", body = DiskEnvelope),
        (status = 409, description = "Attached disk and its VM is not stopped", body = ErrorResponse)
    )
)]
pub async fn resize_disk(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeDiskRequest>,
) -> ApiResult<DiskEnvelope> {
    let id: DiskId = id.parse().map_err(handle_error)?;
    let (disk, revision) = state
        .control
        .resize_disk(&id, request.size_gb)
        .await
        .map_err(handle_error)?;
    Ok(Json(DiskEnvelope {
        status: "resized".into(),
        resource: (&disk).into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/disks/attach",
    tag = "disk",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = DiskAttachRequest,
    responses(
        (status = 200, description = "Disk attached", body = DiskEnvelope),
        (status = 409, description = "Disk unavailable or VM unplaced", body = ErrorResponse)
    )
)]
pub async fn attach_disk(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DiskAttachRequest>,
) -> ApiResult<DiskEnvelope> {
    let disk_id: DiskId = request.disk_id.parse().map_err(handle_error)?;
    let (disk, revision) = state
        .control
        .attach_disk(&disk_id, &id)
        .await
        .map_err(handle_error)?;
    Ok(Json(DiskEnvelope {
        status: "attached".into(),
        resource: (&disk).into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/disks/detach",
    tag = "disk",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = DiskAttachRequest,
    responses(
        (status = 200, description = "Disk detached and available again", body = DiskEnvelope),
        (status = 409, description = "Disk attached elsewhere", body = ErrorResponse)
    )
)]
pub async fn detach_disk(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DiskAttachRequest>,
) -> ApiResult<DiskEnvelope> {
    let disk_id: DiskId = request.disk_id.parse().map_err(handle_error)?;
    let (disk, revision) = state
        .control
        .detach_disk(&disk_id, &id)
        .await
        .map_err(handle_error)?;
    Ok(Json(DiskEnvelope {
        status: "detached".into(),
        resource: (&disk).into(),
        revision,
    }))
}
