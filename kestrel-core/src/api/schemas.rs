//! Wire schemas for the REST API
//!
//! DTOs are decoupled from the store records so the wire contract can stay
//! stable while the internals move. Every mutating endpoint answers with an
//! envelope carrying the resource, the store revision of the write, and the
//! VM generation where applicable; errors share one `{code, message,
//! details?}` shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::{
    Arch, CloudInitDoc, Direction, DiskRecord, DiskStatus, FirewallRule, FloatingIp,
    FloatingIpStatus, HostRecord, ImageRecord, MigrationPhase, MigrationRecord, PortRange,
    PowerState, Protocol, Subnet, VmRecord, VmStatus, Vpc,
};

/// The error envelope used by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable code (`validation`, `not_found`, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VpcDto {
    pub name: String,
    pub cidr: String,
    pub gateway: String,
    pub mtu: u32,
    pub chain: String,
    pub subnets: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Vpc> for VpcDto {
    fn from(vpc: &Vpc) -> Self {
        Self {
            name: vpc.name.clone(),
            cidr: vpc.cidr.to_string(),
            gateway: vpc.gateway.to_string(),
            mtu: vpc.mtu,
            chain: vpc.chain.clone(),
            subnets: vpc.subnets.iter().map(|id| id.to_string()).collect(),
            created_at: vpc.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubnetDto {
    pub id: String,
    pub name: String,
    pub vpc: String,
    pub cidr: String,
}

impl From<&Subnet> for SubnetDto {
    fn from(subnet: &Subnet) -> Self {
        Self {
            id: subnet.id.to_string(),
            name: subnet.name.clone(),
            vpc: subnet.vpc.clone(),
            cidr: subnet.cidr.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NicDto {
    pub mac: String,
    pub ip: String,
    pub bridge: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NetworkInfoDto {
    pub private: Option<NicDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LastErrorDto {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub step: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmDto {
    pub id: String,
    pub name: String,
    pub status: VmStatus,
    pub vpc: String,
    pub image_id: String,
    pub arch: Arch,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub desired_power: PowerState,
    pub observed_power: PowerState,
    pub host: Option<String>,
    pub network_info: NetworkInfoDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastErrorDto>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&VmRecord> for VmDto {
    fn from(vm: &VmRecord) -> Self {
        Self {
            id: vm.id.to_string(),
            name: vm.name.clone(),
            status: vm.status,
            vpc: vm.vpc.clone(),
            image_id: vm.image.clone(),
            arch: vm.arch,
            cpu_cores: vm.vcpus,
            memory_mb: vm.memory_mib,
            disk_size_gb: vm.root_disk_gb,
            desired_power: vm.desired_power,
            observed_power: vm.observed_power,
            host: vm.owner_host.map(|h| h.to_string()),
            network_info: NetworkInfoDto {
                private: vm.nics.first().map(|nic| NicDto {
                    mac: nic.mac.clone(),
                    ip: nic.private_ip.to_string(),
                    bridge: nic.bridge.clone(),
                }),
                public: vm.floating_ip.map(|ip| ip.to_string()),
            },
            ssh_port: vm.ssh_nat_port,
            vnc_port: vm.vnc_port,
            generation: vm.generation,
            last_error: vm.last_error.as_ref().map(|e| LastErrorDto {
                code: e.code.clone(),
                message: e.message.clone(),
                timestamp: e.timestamp,
                step: e.step.clone(),
            }),
            created_at: vm.created_at,
            updated_at: vm.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DiskDto {
    pub id: String,
    pub name: String,
    pub size_gb: u64,
    pub status: DiskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl From<&DiskRecord> for DiskDto {
    fn from(disk: &DiskRecord) -> Self {
        Self {
            id: disk.id.to_string(),
            name: disk.name.clone(),
            size_gb: disk.size_gb,
            status: disk.status,
            attached_to: disk.attachment.as_ref().map(|(vm, _)| vm.to_string()),
            device: disk.attachment.as_ref().map(|(_, slot)| slot.clone()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FloatingIpDto {
    pub address: String,
    pub status: FloatingIpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_vm: Option<String>,
}

impl From<&FloatingIp> for FloatingIpDto {
    fn from(fip: &FloatingIp) -> Self {
        Self {
            address: fip.address.to_string(),
            status: fip.status,
            bound_vm: fip.bound_vm.map(|vm| vm.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ImageDto {
    pub id: String,
    pub name: String,
    pub arch: Arch,
    pub sha256: String,
}

impl From<&ImageRecord> for ImageDto {
    fn from(image: &ImageRecord) -> Self {
        Self {
            id: image.id.clone(),
            name: image.name.clone(),
            arch: image.arch,
            sha256: image.sha256.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HostDto {
    pub id: String,
    pub address: String,
    pub arch: Arch,
    pub health: String,
    pub vcpus: u32,
    pub memory_mib: u64,
}

impl From<&HostRecord> for HostDto {
    fn from(host: &HostRecord) -> Self {
        Self {
            id: host.id.to_string(),
            address: host.address.clone(),
            arch: host.arch,
            health: format!("{:?}", host.health).to_lowercase(),
            vcpus: host.capacity.vcpus,
            memory_mib: host.capacity.memory_mib,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FirewallRuleDto {
    pub id: String,
    pub vpc: String,
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    pub cidr: String,
    pub description: String,
    pub priority: u16,
}

impl From<&FirewallRule> for FirewallRuleDto {
    fn from(rule: &FirewallRule) -> Self {
        Self {
            id: rule.id.to_string(),
            vpc: rule.vpc.clone(),
            direction: rule.direction,
            protocol: rule.protocol,
            port_range: rule.port_range.map(|r| {
                if r.start == r.end {
                    r.start.to_string()
                } else {
                    format!("{}-{}", r.start, r.end)
                }
            }),
            cidr: rule.cidr.to_string(),
            description: rule.description.clone(),
            priority: rule.priority,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MigrationDto {
    pub id: String,
    pub vm: String,
    pub source: String,
    pub destination: String,
    pub phase: MigrationPhase,
    pub progress_percent: f32,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&MigrationRecord> for MigrationDto {
    fn from(record: &MigrationRecord) -> Self {
        Self {
            id: record.id.to_string(),
            vm: record.vm.to_string(),
            source: record.source.to_string(),
            destination: record.destination.to_string(),
            phase: record.phase,
            progress_percent: record.progress_percent,
            compressed: record.compressed,
            reason: record.reason.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

// ---------------------------------------------------------------------
// Requests

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateVpcRequest {
    pub name: String,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSubnetRequest {
    pub name: String,
    pub cidr: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateFirewallRuleRequest {
    pub direction: Direction,
    pub protocol: Protocol,
    /// "80" or "8000-8100"; omitted for icmp
    #[serde(default)]
    pub port_range: Option<String>,
    /// Source CIDR for inbound rules, destination CIDR for outbound
    pub cidr: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u16,
}

fn default_priority() -> u16 {
    100
}

impl CreateFirewallRuleRequest {
    pub fn parsed_range(&self) -> crate::error::KestrelResult<Option<PortRange>> {
        let Some(raw) = &self.port_range else {
            return Ok(None);
        };
        let parse = |s: &str| {
            s.parse::<u16>().map_err(|_| {
                crate::error::KestrelError::validation(
                    "port_range",
                    format!("invalid port: {}", s),
                )
            })
        };
        let range = match raw.split_once('-') {
            Some((start, end)) => PortRange {
                start: parse(start.trim())?,
                end: parse(end.trim())?,
            },
            None => PortRange::single(parse(raw.trim())?),
        };
        range.validate()?;
        Ok(Some(range))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateVmRequest {
    pub name: String,
    /// VPC name. `network_name` is accepted as a deprecated alias.
    #[serde(default)]
    pub vpc: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub image_id: String,
    #[serde(default)]
    pub arch: Option<Arch>,
    #[serde(default)]
    pub cloud_init: Option<CloudInitDoc>,
    #[serde(default)]
    pub anti_affinity: Option<String>,
    /// Re-issuing an identical create with the same token returns the same
    /// VM and performs no side effects.
    #[serde(default)]
    pub client_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct VmActionRequest {
    /// Optimistic-concurrency check against the VM's generation
    #[serde(default)]
    pub generation: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResizeVmRequest {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub generation: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDiskRequest {
    pub name: String,
    pub size_gb: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResizeDiskRequest {
    pub size_gb: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DiskAttachRequest {
    pub disk_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateFloatingIpRequest {
    pub address: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct IpAttachRequest {
    /// A specific pool address; omitted picks the next free one
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IpDetachRequest {
    pub address: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateMigrationRequest {
    pub vm_name: String,
    /// Destination host id
    pub destination: String,
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    #[serde(default)]
    pub max_downtime_ms: Option<u64>,
    #[serde(default = "default_compressed")]
    pub compressed: bool,
    #[serde(default)]
    pub shared_storage: bool,
}

fn default_compressed() -> bool {
    true
}

// ---------------------------------------------------------------------
// Responses

/// Envelope for mutating endpoints
#[derive(Debug, Serialize, ToSchema)]
pub struct VmEnvelope {
    pub status: String,
    pub resource: VmDto,
    pub revision: u64,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

impl VmEnvelope {
    pub fn accepted(vm: &VmRecord, revision: u64) -> Self {
        Self {
            status: "accepted".into(),
            resource: vm.into(),
            revision,
            generation: vm.generation,
            status_url: Some(format!("/api/vms/{}/status", vm.id)),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VpcEnvelope {
    pub status: String,
    pub resource: VpcDto,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubnetEnvelope {
    pub status: String,
    pub resource: SubnetDto,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DiskEnvelope {
    pub status: String,
    pub resource: DiskDto,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FloatingIpEnvelope {
    pub status: String,
    pub resource: FloatingIpDto,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FirewallRuleEnvelope {
    pub status: String,
    pub resource: FirewallRuleDto,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeletedEnvelope {
    pub status: String,
    pub revision: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VmStatusResponse {
    pub vm: VmDto,
    /// Live state as last reported by the host driver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VmMetricsResponse {
    pub cpu_time_ns: u64,
    pub memory_actual_mib: u64,
    pub memory_available_mib: u64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SerialConsoleResponse {
    /// Signed WebSocket URL for the console session
    pub url: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MigrationEnvelope {
    pub status: String,
    pub status_url: String,
}
