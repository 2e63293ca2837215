//! VPC, subnet and firewall-rule endpoints

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::Json;

use super::schemas::{
    CreateFirewallRuleRequest, CreateSubnetRequest, CreateVpcRequest, DeletedEnvelope, FirewallRuleDto, FirewallRuleEnvelope, SubnetEnvelope, VpcDto, VpcEnvelope,
};
use super::{handle_error, ApiError, ApiResult, AppState};
use crate::types::RuleId;

const DEFAULT_MTU: u32 = 1500;

#[utoipa::path(
    get,
    path = "/api/vpcs",
    tag = "vpc",
    responses(
        (status = 200, description = "All VPCs", body = [VpcDto])
    )
)]
pub async fn list_vpcs(Extension(state): Extension<AppState>) -> ApiResult<Vec<VpcDto>> {
    let vpcs = state.control.list_vpcs().map_err(handle_error)?;
    Ok(Json(vpcs.iter().map(VpcDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/vpcs",
    tag = "vpc",
    request_body = CreateVpcRequest,
    responses(
        (status = 201, description = "VPC created", body = VpcEnvelope),
        (status = 400, description = "Invalid name or CIDR", body = ErrorResponse),
        (status = 409, description = "VPC already exists", body = ErrorResponse)
    )
)]
pub async fn create_vpc(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateVpcRequest>,
) -> Result<(StatusCode, Json<VpcEnvelope>), ApiError> {
    let (vpc, revision) = state
        .control
        .create_vpc(
            &request.name,
            request.cidr.as_deref(),
            request.mtu.unwrap_or(DEFAULT_MTU),
        )
        .map_err(handle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(VpcEnvelope {
            status: "created".into(),
            resource: (&vpc).into(),
            revision,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/vpcs/{name}",
    tag = "vpc",
    params(("name" = String, Path, description = "VPC name")),
    responses(
        (status = 200, description = "VPC detail", body = VpcDto),
        (status = 404, description = "Unknown VPC", body = ErrorResponse)
    )
)]
pub async fn get_vpc(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> ApiResult<VpcDto> {
    let (vpc, _) = state.control.get_vpc(&name).map_err(handle_error)?;
    Ok(Json((&vpc).into()))
}

#[utoipa::path(
    delete,
    path = "/api/vpcs/{name}",
    tag = "vpc",
    params(("name" = String, Path, description = "VPC name")),
    responses(
        (status = 200, description = "VPC deleted", body = DeletedEnvelope),
        (status = 404, description = "Unknown VPC", body = ErrorResponse),
        (status = 409, description = "VMs or allocations still reference the VPC", body = ErrorResponse)
    )
)]
pub async fn delete_vpc(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> ApiResult<DeletedEnvelope> {
    let revision = state.control.delete_vpc(&name).map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "deleted".into(),
        revision,
    }))
}

#[utoipa::path(
    post,
    path = "/api/vpcs/{name}/subnets",
    tag = "vpc",
    params(("name" = String, Path, description = "VPC name")),
    request_body = CreateSubnetRequest,
    responses(
        (status = 201, description = "Subnet added", body = SubnetEnvelope),
        (status = 400, description = "CIDR not inside the VPC", body = ErrorResponse)
    )
)]
pub async fn create_subnet(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CreateSubnetRequest>,
) -> Result<(StatusCode, Json<SubnetEnvelope>), ApiError> {
    let (subnet, revision) = state
        .control
        .add_subnet(&name, &request.name, &request.cidr)
        .map_err(handle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(SubnetEnvelope {
            status: "created".into(),
            resource: (&subnet).into(),
            revision,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/vpcs/{name}/subnets/{subnet}",
    tag = "vpc",
    params(
        ("name" = String, Path, description = "VPC name"),
        ("subnet" = String, Path, description = "Subnet name")
    ),
    responses(
        (status = 200, description = "Subnet removed", body = DeletedEnvelope),
        (status = 409, description = "Allocations still exist inside the subnet", body = ErrorResponse)
    )
)]
pub async fn delete_subnet(
    Extension(state): Extension<AppState>,
    Path((name, subnet)): Path<(String, String)>,
) -> ApiResult<DeletedEnvelope> {
    let revision = state
        .control
        .remove_subnet(&name, &subnet)
        .map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "deleted".into(),
        revision,
    }))
}

#[utoipa::path(
    get,
    path = "/api/vpcs/{name}/firewall-rules",
    tag = "firewall",
    params(("name" = String, Path, description = "VPC name")),
    responses(
        (status = 200, description = "Rules for the VPC", body = [FirewallRuleDto])
    )
)]
pub async fn list_firewall_rules(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Vec<FirewallRuleDto>> {
    let rules = state
        .control
        .list_firewall_rules(&name)
        .map_err(handle_error)?;
    Ok(Json(rules.iter().map(FirewallRuleDto::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/vpcs/{name}/firewall-rules",
    tag = "firewall",
    params(("name" = String, Path, description = "VPC name")),
    request_body = CreateFirewallRuleRequest,
    responses(
        (status = 201, description = "Rule created and queued for push", body = FirewallRuleEnvelope),
        (status = 400, description = "Invalid rule", body = ErrorResponse)
    )
)]
pub async fn create_firewall_rule(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CreateFirewallRuleRequest>,
) -> Result<(StatusCode, Json<FirewallRuleEnvelope>), ApiError> {
    let range = request.parsed_range().map_err(handle_error)?;
    let (rule, revision) = state
        .control
        .add_firewall_rule(
            &name,
            request.direction,
            request.protocol,
            range,
            &request.cidr,
            request.description.as_deref().unwrap_or(""),
            request.priority,
        )
        .map_err(handle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(FirewallRuleEnvelope {
            status: "created".into(),
            resource: (&rule).into(),
            revision,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/vpcs/{name}/firewall-rules/{rule}",
    tag = "firewall",
    params(
        ("name" = String, Path, description = "VPC name"),
        ("rule" = String, Path, description = "Rule id")
    ),
    responses(
        (status = 200, description = "Rule removed and chains re-pushed", body = DeletedEnvelope),
        (status = 404, description = "Unknown rule", body = ErrorResponse)
    )
)]
pub async fn delete_firewall_rule(
    Extension(state): Extension<AppState>,
    Path((name, rule)): Path<(String, String)>,
) -> ApiResult<DeletedEnvelope> {
    let rule: RuleId = rule.parse().map_err(handle_error)?;
    let revision = state
        .control
        .delete_firewall_rule(&name, &rule)
        .map_err(handle_error)?;
    Ok(Json(DeletedEnvelope {
        status: "deleted".into(),
        revision,
    }))
}
