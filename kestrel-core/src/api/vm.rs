//! VM lifecycle endpoints

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use ulid::Ulid;

use super::schemas::{
    CreateVmRequest, ResizeVmRequest, SerialConsoleResponse, VmActionRequest,
    VmDto, VmEnvelope, VmMetricsResponse, VmStatusResponse,
};
use super::{handle_error, ApiError, ApiResult, AppState};
use crate::control::CreateVm;
use crate::error::KestrelError;

#[utoipa::path(
    get,
    path = "/api/vms",
    tag = "vm",
    responses((status = 200, description = "All VMs", body = [VmDto]))
)]
pub async fn list_vms(Extension(state): Extension<AppState>) -> ApiResult<Vec<VmDto>> {
    let vms = state.control.list_vms().map_err(handle_error)?;
    Ok(Json(vms.iter().map(VmDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/vms",
    tag = "vm",
    request_body = CreateVmRequest,
    responses(
        (status = 202, description = "VM accepted; poll the status URL", body = VmEnvelope),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Unknown VPC or image", body = ErrorResponse),
        (status = 409, description = "Name already taken", body = ErrorResponse),
        (status = 422, description = "Architecture mismatch", body = ErrorResponse)
    )
)]
pub async fn create_vm(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateVmRequest>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let vpc = request
        .vpc
        .clone()
        .or_else(|| request.network_name.clone())
        .ok_or_else(|| {
            handle_error(KestrelError::validation("vpc", "a VPC name is required"))
        })?;
    let (vm, revision) = state
        .control
        .create_vm(CreateVm {
            name: request.name,
            vpc,
            cpu_cores: request.cpu_cores,
            memory_mb: request.memory_mb,
            disk_size_gb: request.disk_size_gb,
            image_id: request.image_id,
            arch: request.arch,
            cloud_init: request.cloud_init,
            anti_affinity: request.anti_affinity,
            client_token: request.client_token,
        })
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    get,
    path = "/api/vms/{id}",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "VM detail", body = VmDto),
        (status = 404, description = "Unknown VM", body = ErrorResponse)
    )
)]
pub async fn get_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<VmDto> {
    let (vm, _) = state.control.resolve_vm(&id).map_err(handle_error)?;
    Ok(Json((&vm).into()))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/start",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = VmActionRequest,
    responses(
        (status = 202, description = "Start accepted", body = VmEnvelope),
        (status = 409, description = "Generation mismatch", body = ErrorResponse)
    )
)]
pub async fn start_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<VmActionRequest>>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let generation = body.and_then(|Json(b)| b.generation);
    let (vm, revision) = state
        .control
        .start_vm(&id, generation)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/stop",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = VmActionRequest,
    responses((status = 202, description = "Stop accepted", body = VmEnvelope))
)]
pub async fn stop_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<VmActionRequest>>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let generation = body.and_then(|Json(b)| b.generation);
    let (vm, revision) = state
        .control
        .stop_vm(&id, generation)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/restart",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = VmActionRequest,
    responses((status = 202, description = "Restart accepted", body = VmEnvelope))
)]
pub async fn restart_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<VmActionRequest>>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let generation = body.and_then(|Json(b)| b.generation);
    let (vm, revision) = state
        .control
        .restart_vm(&id, generation)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/terminate",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = VmActionRequest,
    responses((status = 202, description = "Termination accepted", body = VmEnvelope))
)]
pub async fn terminate_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<VmActionRequest>>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let generation = body.and_then(|Json(b)| b.generation);
    let (vm, revision) = state
        .control
        .terminate_vm(&id, generation)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

/// DELETE /vms/{id} is terminate.
pub async fn terminate_vm_delete(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let (vm, revision) = state
        .control
        .terminate_vm(&id, None)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/resize",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = ResizeVmRequest,
    responses(
        (status = 202, description = "Resize accepted (applied offline)", body = VmEnvelope),
        (status = 409, description = "VM state does not allow a resize", body = ErrorResponse)
    )
)]
pub async fn resize_vm(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeVmRequest>,
) -> Result<(StatusCode, Json<VmEnvelope>), ApiError> {
    let (vm, revision) = state
        .control
        .resize_vm(&id, request.cpu_cores, request.memory_mb, request.generation)
        .map_err(handle_error)?;
    Ok((StatusCode::ACCEPTED, Json(VmEnvelope::accepted(&vm, revision))))
}

#[utoipa::path(
    get,
    path = "/api/vms/{id}/status",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    responses((status = 200, description = "Store row merged with the driver view", body = VmStatusResponse))
)]
pub async fn vm_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<VmStatusResponse> {
    let (vm, observed) = state.control.vm_status(&id).await.map_err(handle_error)?;
    Ok(Json(VmStatusResponse {
        vm: (&vm).into(),
        observed: observed.map(|s| format!("{:?}", s).to_lowercase()),
        observed_at: Utc::now(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/vms/{id}/metrics",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "Last driver metrics sample", body = VmMetricsResponse),
        (status = 409, description = "VM not placed", body = ErrorResponse)
    )
)]
pub async fn vm_metrics(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<VmMetricsResponse> {
    let metrics = state.control.vm_metrics(&id).await.map_err(handle_error)?;
    Ok(Json(VmMetricsResponse {
        cpu_time_ns: metrics.cpu_time_ns,
        memory_actual_mib: metrics.memory_actual_mib,
        memory_available_mib: metrics.memory_available_mib,
        sampled_at: metrics.sampled_at,
    }))
}

#[utoipa::path(
    get,
    path = "/api/vms/{id}/serial-console",
    tag = "vm",
    params(("id" = String, Path, description = "VM id or name")),
    responses((status = 200, description = "Signed WebSocket URL", body = SerialConsoleResponse))
)]
pub async fn serial_console(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SerialConsoleResponse> {
    let (vm, _) = state.control.resolve_vm(&id).map_err(handle_error)?;
    // The token is opaque; the outer auth layer signs real deployments.
    let token = Ulid::new().to_string();
    Ok(Json(SerialConsoleResponse {
        url: format!("/ws?vm={}&token={}", vm.name, token),
    }))
}
