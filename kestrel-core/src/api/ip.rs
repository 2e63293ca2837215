//! Floating IP endpoints

use std::net::Ipv4Addr;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::Json;

use super::schemas::{
    CreateFloatingIpRequest, DeletedEnvelope, FloatingIpDto, FloatingIpEnvelope,
    IpAttachRequest, IpDetachRequest,
};
use super::{handle_error, ApiError, ApiResult, AppState};
use crate::error::KestrelError;

fn parse_addr(raw: &str) -> Result<Ipv4Addr, ApiError> {
    raw.parse::<Ipv4Addr>().map_err(|_| {
        handle_error(KestrelError::validation(
            "address",
            format!("not an IPv4 address: {}", raw),
        ))
    })
}

#[utoipa::path(
    get,
    path = "/api/ips",
    tag = "ip",
    responses((status = 200, description = "Public pool state", body = [FloatingIpDto]))
)]
pub async fn list_ips(Extension(state): Extension<AppState>) -> ApiResult<Vec<FloatingIpDto>> {
    let ips = state.control.list_floating_ips().map_err(handle_error)?;
    Ok(Json(ips.iter().map(FloatingIpDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/ips",
    tag = "ip",
    request_body = CreateFloatingIpRequest,
    responses(
        (status = 201, description = "Address added to the public pool", body = FloatingIpEnvelope),
        (status = 409, description = "Address already pooled", body = ErrorResponse)
    )
)]
pub async fn create_ip(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateFloatingIpRequest>,
) -> Result<(StatusCode, Json<FloatingIpEnvelope>), ApiError> {
    let address = parse_addr(&request.address)?;
    let (fip, revision) = state
        .control
        .add_floating_ip(address)
        .map_err(handle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(FloatingIpEnvelope {
            status: "created".into(),
            resource: (&fip).into(),
            revision,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/ips/{addr}",
    tag = "ip",
    params(("addr" = String, Path, description = "Pool address")),
    responses(
        (status = 200, description = "Address removed from the pool", body = DeletedEnvelope),
        (status = 409, description = "Address is bound to a VM", body = ErrorResponse)
    )
)]
pub async fn delete_ip(
    Extension(state): Extension<AppState>,
    Path(addr): Path<String>,
) -> ApiResult<DeletedEnvelope> {
    let address = parse_addr(&addr)?;
    let revision = state
        .control
        .remove_floating_ip(address)
        .map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "deleted".into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/ips/attach",
    tag = "ip",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = IpAttachRequest,
    responses(
        (status = 200, description = "Floating IP bound", body = FloatingIpEnvelope),
        (status = 409, description = "VM already has a floating IP", body = ErrorResponse),
        (status = 507, description = "Pool exhausted", body = ErrorResponse)
    )
)]
pub async fn attach_ip(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Option<Json<IpAttachRequest>>,
) -> ApiResult<FloatingIpEnvelope> {
    let address = match body.and_then(|Json(b)| b.address) {
        Some(raw) => Some(parse_addr(&raw)?),
        None => None,
    };
    let (fip, revision) = state
        .control
        .attach_ip(&id, address)
        .await
        .map_err(handle_error)?;
    Ok(Json(FloatingIpEnvelope {
        status: "attached".into(),
        resource: (&fip).into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/vms/{id}/ips/detach",
    tag = "ip",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = IpDetachRequest,
    responses(
        (status = 200, description = "Floating IP released", body = FloatingIpEnvelope),
        (status = 409, description = "Address not attached to this VM", body = ErrorResponse)
    )
)]
pub async fn detach_ip(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(request): Json<IpDetachRequest>,
) -> ApiResult<FloatingIpEnvelope> {
    let address = parse_addr(&request.address)?;
    let (fip, revision) = state
        .control
        .detach_ip(&id, address)
        .await
        .map_err(handle_error)?;
    Ok(Json(FloatingIpEnvelope {
        status: "detached".into(),
        resource: (&fip).into(),
        revision,
    }))
}
