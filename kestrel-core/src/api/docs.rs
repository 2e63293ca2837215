//! OpenAPI document for the REST surface

use axum::response::Json;
use utoipa::OpenApi;

use super::schemas::{
    CreateDiskRequest, CreateFirewallRuleRequest, CreateFloatingIpRequest,
    CreateMigrationRequest, CreateSubnetRequest, CreateVmRequest, CreateVpcRequest,
    DeletedEnvelope, DiskAttachRequest, DiskDto, DiskEnvelope, ErrorResponse, FirewallRuleDto,
    FirewallRuleEnvelope, FloatingIpDto, FloatingIpEnvelope, HostDto, ImageDto, IpAttachRequest,
    IpDetachRequest, LastErrorDto, MigrationDto, MigrationEnvelope, NetworkInfoDto, NicDto,
    ResizeDiskRequest, ResizeVmRequest, SerialConsoleResponse, SubnetDto, SubnetEnvelope,
    VmActionRequest, VmDto, VmEnvelope, VmMetricsResponse, VmStatusResponse, VpcDto, VpcEnvelope,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Kestrel API",
        description = "Multi-tenant VM control plane",
        license(name = "MIT OR Apache-2.0")
    ),
    paths(
        super::health::health_check,
        super::health::list_images,
        super::vpc::list_vpcs,
        super::vpc::create_vpc,
        super::vpc::get_vpc,
        super::vpc::delete_vpc,
        super::vpc::create_subnet,
        super::vpc::delete_subnet,
        super::vpc::list_firewall_rules,
        super::vpc::create_firewall_rule,
        super::vpc::delete_firewall_rule,
        super::vm::list_vms,
        super::vm::create_vm,
        super::vm::get_vm,
        super::vm::start_vm,
        super::vm::stop_vm,
        super::vm::restart_vm,
        super::vm::terminate_vm,
        super::vm::resize_vm,
        super::vm::vm_status,
        super::vm::vm_metrics,
        super::vm::serial_console,
        super::disk::list_disks,
        super::disk::create_disk,
        super::disk::delete_disk,
        super::disk::resize_disk,
        super::disk::attach_disk,
        super::disk::detach_disk,
        super::ip::list_ips,
        super::ip::create_ip,
        super::ip::delete_ip,
        super::ip::attach_ip,
        super::ip::detach_ip,
        super::migrate::list_migrations,
        super::migrate::create_migration,
        super::migrate::migration_status,
        super::migrate::cancel_migration,
    ),
    components(schemas(
        ErrorResponse,
        VpcDto,
        VpcEnvelope,
        SubnetDto,
        SubnetEnvelope,
        NicDto,
        NetworkInfoDto,
        LastErrorDto,
        VmDto,
        VmEnvelope,
        VmActionRequest,
        VmStatusResponse,
        VmMetricsResponse,
        SerialConsoleResponse,
        DiskDto,
        DiskEnvelope,
        FloatingIpDto,
        FloatingIpEnvelope,
        ImageDto,
        HostDto,
        FirewallRuleDto,
        FirewallRuleEnvelope,
        MigrationDto,
        MigrationEnvelope,
        DeletedEnvelope,
        CreateVpcRequest,
        CreateSubnetRequest,
        CreateFirewallRuleRequest,
        CreateVmRequest,
        ResizeVmRequest,
        CreateDiskRequest,
        ResizeDiskRequest,
        DiskAttachRequest,
        CreateFloatingIpRequest,
        IpAttachRequest,
        IpDetachRequest,
        CreateMigrationRequest,
    ))
)]
pub struct ApiDoc;

pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
