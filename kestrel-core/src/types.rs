//! Core entity model for the Kestrel control plane
//!
//! Every entity row lives in the store and references other entities by id
//! only. Host-local artifacts (domain XML, qcow2 files, bridges, chains) are
//! derived from these rows by the driver and are never stored here.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{KestrelError, KestrelResult};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:expr) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KestrelError;

            fn from_str(s: &str) -> KestrelResult<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|_| KestrelError::validation($prefix, format!("invalid id '{}'", s)))
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a virtual machine
    VmId, "vm_id"
);
ulid_id!(
    /// Unique identifier for a block volume
    DiskId, "disk_id"
);
ulid_id!(
    /// Unique identifier for a hypervisor host
    HostId, "host_id"
);
ulid_id!(
    /// Unique identifier for a subnet within a VPC
    SubnetId, "subnet_id"
);
ulid_id!(
    /// Unique identifier for a firewall rule
    RuleId, "rule_id"
);
ulid_id!(
    /// Unique identifier for a live migration
    MigrationId, "migration_id"
);

/// Guest CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

impl FromStr for Arch {
    type Err = KestrelError;

    fn from_str(s: &str) -> KestrelResult<Self> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            other => Err(KestrelError::UnsupportedArch { arch: other.into() }),
        }
    }
}

/// Desired power state of a VM, set by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

/// Observed lifecycle state of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
    Migrating,
    Resizing,
    Terminating,
    Error,
    Terminated,
}

impl VmStatus {
    /// Terminated rows stay in the store for audit but count toward nothing.
    pub fn is_terminated(&self) -> bool {
        matches!(self, VmStatus::Terminated)
    }
}

/// A pending offline resize, applied by the reconciler while the VM is
/// stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub vcpus: u32,
    pub memory_mib: u64,
}

/// Last error recorded by the reconciler on a VM row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub step: String,
}

/// A NIC attached to a VM, bound to its VPC bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicRecord {
    pub mac: String,
    pub private_ip: Ipv4Addr,
    pub subnet: Option<SubnetId>,
    pub bridge: String,
}

/// A disk attachment as seen from the VM side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub disk: DiskId,
    /// Guest device slot, e.g. "vdb"
    pub slot: String,
}

/// Authoritative VM row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    pub owner_host: Option<HostId>,
    pub image: String,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub root_disk_gb: u64,
    pub vpc: String,
    pub nics: Vec<NicRecord>,
    pub disks: Vec<DiskAttachment>,
    pub desired_power: PowerState,
    pub observed_power: PowerState,
    pub status: VmStatus,
    pub cloud_init: Option<CloudInitDoc>,
    pub floating_ip: Option<Ipv4Addr>,
    pub ssh_nat_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub serial_socket: Option<String>,
    pub pending_resize: Option<ResizeSpec>,
    pub anti_affinity: Option<String>,
    pub client_token: Option<String>,
    /// Increases on every observed-state transition; echoed by the API for
    /// optimistic-concurrency checks.
    pub generation: u64,
    pub last_error: Option<LastError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// Bump the generation counter on an observed-state transition.
    pub fn transition(&mut self, status: VmStatus) {
        self.status = status;
        self.generation += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, step: &str, err: &KestrelError) {
        self.last_error = Some(LastError {
            code: err.code().to_string(),
            message: err.to_string(),
            timestamp: Utc::now(),
            step: step.to_string(),
        });
        self.transition(VmStatus::Error);
    }
}

/// A virtual private network, keyed by its unique name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vpc {
    pub name: String,
    pub cidr: Ipv4Net,
    pub subnets: Vec<SubnetId>,
    pub gateway: Ipv4Addr,
    pub mtu: u32,
    /// Base name of the per-VPC iptables chains and the Linux bridge.
    pub chain: String,
    pub created_at: DateTime<Utc>,
}

impl Vpc {
    /// Deterministic chain/bridge base name derived from the VPC name.
    /// Interface names are capped at 15 chars, so the fingerprint stays short.
    pub fn chain_name(name: &str) -> String {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in name.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100_0000_01b3);
        }
        format!("kbr-{:08x}", (h >> 32) as u32 ^ h as u32)
    }

    pub fn new(name: String, cidr: Ipv4Net, mtu: u32) -> Self {
        let gateway = first_host(&cidr);
        let chain = Self::chain_name(&name);
        Self {
            name,
            cidr,
            subnets: Vec::new(),
            gateway,
            mtu,
            chain,
            created_at: Utc::now(),
        }
    }
}

/// First usable host address of a network (the VPC gateway convention).
pub fn first_host(net: &Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()) + 1)
}

/// A CIDR slice of a VPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub name: String,
    pub vpc: String,
    pub cidr: Ipv4Net,
    pub created_at: DateTime<Utc>,
}

/// Allocation scope for the IPAM
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpScope {
    /// Private addresses inside one VPC's CIDR
    VpcPrivate(String),
    /// The region-wide public pool
    PublicPool,
}

impl IpScope {
    /// Store key fragment, stable across releases.
    pub fn key_fragment(&self) -> String {
        match self {
            IpScope::VpcPrivate(vpc) => format!("vpc/{}", vpc),
            IpScope::PublicPool => "public".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Reserved,
    Bound,
    Released,
}

/// One row per (scope, address); at most one non-released row may exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub scope: IpScope,
    pub address: Ipv4Addr,
    pub owner: Option<VmId>,
    pub status: AllocationStatus,
    pub reserved_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FloatingIpStatus {
    Available,
    Bound,
}

/// A publicly routable address exposed via DNAT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIp {
    pub address: Ipv4Addr,
    pub status: FloatingIpStatus,
    pub bound_vm: Option<VmId>,
    pub last_rebind: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Available,
    #[serde(rename = "in-use")]
    InUse,
    Resizing,
    Error,
}

/// A block volume; survives the VMs it is attached to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: DiskId,
    pub name: String,
    pub size_gb: u64,
    /// qcow2 path on the owning host, set once the volume exists.
    pub backing_path: Option<String>,
    pub host: Option<HostId>,
    pub status: DiskStatus,
    /// Exclusive attachment (vm, device slot)
    pub attachment: Option<(VmId, String)>,
    pub created_at: DateTime<Utc>,
}

/// An immutable base image; presence on a host is a boolean predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub arch: Arch,
    pub sha256: String,
    /// Hosts the image is known to be present on.
    pub hosts: Vec<HostId>,
}

impl ImageRecord {
    pub fn present_on(&self, host: &HostId) -> bool {
        self.hosts.contains(host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostHealth {
    Ready,
    Degraded,
    Down,
}

/// Schedulable capacity of a hypervisor host
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_bytes: u64,
}

/// A hypervisor host registered with the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub address: String,
    pub arch: Arch,
    pub ssh_user: String,
    pub ssh_identity: Option<String>,
    pub capacity: HostCapacity,
    pub health: HostHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Root of the per-host workspace: `<vm_root>/{images,disks,volumes}`.
    pub vm_root: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// Inclusive port range; a single port has start == end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn validate(&self) -> KestrelResult<()> {
        if self.start == 0 {
            return Err(KestrelError::validation("port_range", "port 0 is invalid"));
        }
        if self.start > self.end {
            return Err(KestrelError::validation(
                "port_range",
                "start port must not exceed end port",
            ));
        }
        Ok(())
    }
}

/// A firewall rule scoped to a VPC, applied to every VM NIC on that VPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: RuleId,
    pub vpc: String,
    pub direction: Direction,
    pub protocol: Protocol,
    /// None for protocols without ports (icmp)
    pub port_range: Option<PortRange>,
    /// Source CIDR for inbound, destination CIDR for outbound.
    pub cidr: Ipv4Net,
    pub description: String,
    pub priority: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Prepare,
    Precopy,
    Switchover,
    Finalize,
    Aborted,
}

/// One live migration per VM at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub vm: VmId,
    pub source: HostId,
    pub destination: HostId,
    pub phase: MigrationPhase,
    pub bandwidth_limit: Option<u64>,
    pub max_downtime_ms: Option<u64>,
    pub compressed: bool,
    pub progress_percent: f32,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The recognized cloud-init option set. Unknown keys are rejected at the
/// API boundary rather than silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CloudInitDoc {
    pub hostname: Option<String>,
    #[serde(default)]
    pub users: Vec<CloudInitUser>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub runcmd: Vec<String>,
    #[serde(default)]
    pub write_files: Vec<WriteFile>,
    pub timezone: Option<String>,
    #[serde(default, rename = "apt")]
    pub apt_sources: BTreeMap<String, AptSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CloudInitUser {
    pub name: String,
    pub sudo: Option<String>,
    pub shell: Option<String>,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AptSource {
    pub source: String,
    pub keyid: Option<String>,
}
