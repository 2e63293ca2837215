//! Host driver capability interface
//!
//! A driver instance is bound to one hypervisor host and exposes the uniform
//! verb set the reconciler plans against. Implementations live outside this
//! crate (`kestrel-host` drives libvirt locally or over SSH); the mock here
//! backs the test suite.
//!
//! Every verb is idempotent: re-issuing a verb whose goal state already
//! holds is a no-op. Errors distinguish retry-safe failures
//! (`driver_unavailable`, `driver_timeout`) from terminal ones
//! (`driver_terminal`), which the reconciler maps to rollback.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{KestrelError, KestrelResult};
use crate::types::{Arch, CloudInitDoc, VmId};

/// Duplex byte stream to a VM serial console
pub trait ConsoleStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConsoleStream for T {}

/// NIC wiring for a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub bridge: String,
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// Everything the driver needs to define a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSpec {
    pub vm: VmId,
    pub name: String,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory_mib: u64,
    /// Root disk qcow2 path on the host
    pub root_disk: String,
    /// Additional volumes as (guest slot, path)
    pub extra_disks: Vec<(String, String)>,
    /// Cloud-init seed ISO path, attached as a cdrom when present
    pub cidata_iso: Option<String>,
    pub nic: Option<NicSpec>,
    /// UNIX socket path for the serial console
    pub serial_socket: String,
    pub vnc_port: u16,
}

/// Cloud-init seed to render and pack on the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitSpec {
    /// instance-id in meta-data
    pub instance_id: String,
    pub hostname: String,
    pub doc: CloudInitDoc,
    /// NIC address rendered into the network section, when static
    pub ip: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    /// Where the packed ISO lands on the host
    pub iso_path: String,
}

/// A qcow2 volume to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub path: String,
    pub size_gb: u64,
    /// Backing file for copy-on-write root disks
    pub backing: Option<String>,
}

/// Per-VPC network artifacts on a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Bridge (and chain) base name, deterministic from the VPC
    pub bridge: String,
    /// Gateway address with prefix, e.g. "10.0.0.1/24"
    pub gateway_cidr: String,
    pub mtu: u32,
}

/// Live migration parameters handed to the source driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationParams {
    /// Destination URI, e.g. "qemu+ssh://198.51.100.2/system"
    pub destination_uri: String,
    pub bandwidth_limit: Option<u64>,
    pub max_downtime_ms: Option<u64>,
    pub compressed: bool,
    /// Stream disk contents into the pre-created destination volumes; off
    /// when the volumes live on shared storage.
    pub copy_storage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationJobState {
    None,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Progress sample from the source hypervisor's migration job
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub state: MigrationJobState,
    pub processed_bytes: u64,
    pub remaining_bytes: u64,
    pub total_bytes: u64,
}

impl MigrationProgress {
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.processed_bytes as f64 / self.total_bytes as f64 * 100.0) as f32
    }
}

/// Observed power state of a domain on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Absent,
    Shutoff,
    Running,
    Paused,
    Crashed,
}

/// Last-known metrics sample returned by the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetrics {
    pub cpu_time_ns: u64,
    pub memory_actual_mib: u64,
    pub memory_available_mib: u64,
    pub sampled_at: chrono::DateTime<chrono::Utc>,
}

/// Cached facts about a host, filled on first contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    pub arch: Arch,
    pub libvirt_version: String,
    /// Primary uplink carrying the MASQUERADE rule
    pub uplink: String,
}

/// The uniform host verb set
#[async_trait]
pub trait HostDriver: Send + Sync {
    async fn host_facts(&self) -> KestrelResult<HostFacts>;

    /// Check that an image file is present (and optionally fetchable).
    async fn ensure_image(&self, path: &str, sha256: &str) -> KestrelResult<()>;

    async fn define_domain(&self, spec: &DomainSpec) -> KestrelResult<()>;
    async fn undefine_domain(&self, name: &str) -> KestrelResult<()>;
    async fn start_domain(&self, name: &str) -> KestrelResult<()>;
    async fn stop_domain(&self, name: &str, force: bool) -> KestrelResult<()>;
    async fn reboot_domain(&self, name: &str) -> KestrelResult<()>;
    async fn domain_state(&self, name: &str) -> KestrelResult<DomainState>;
    async fn domain_metrics(&self, name: &str) -> KestrelResult<VmMetrics>;

    async fn attach_volume(&self, name: &str, slot: &str, path: &str) -> KestrelResult<()>;
    async fn detach_volume(&self, name: &str, slot: &str) -> KestrelResult<()>;
    /// Offline only: the domain must be shut off.
    async fn resize_cpu_mem(&self, name: &str, vcpus: u32, memory_mib: u64) -> KestrelResult<()>;

    async fn create_volume(&self, spec: &VolumeSpec) -> KestrelResult<()>;
    async fn resize_volume(&self, path: &str, new_size_gb: u64) -> KestrelResult<()>;
    async fn delete_volume(&self, path: &str) -> KestrelResult<()>;

    /// Render user-data/meta-data and pack the cidata ISO on the host.
    async fn create_cloud_init(&self, spec: &CloudInitSpec) -> KestrelResult<()>;

    async fn define_network(&self, spec: &NetworkSpec) -> KestrelResult<()>;
    async fn destroy_network(&self, bridge: &str) -> KestrelResult<()>;
    /// Push a compiled iptables script for a VPC chain. Byte-identical
    /// scripts are skipped.
    async fn apply_iptables(&self, chain: &str, script: &str) -> KestrelResult<()>;
    /// DNAT `host:port` to the VM's private address, port 22.
    async fn map_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()>;
    async fn unmap_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()>;
    /// 1:1 DNAT from a floating public address to the VM's private address.
    async fn map_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()>;
    async fn unmap_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()>;

    async fn open_serial_console(&self, socket_path: &str)
        -> KestrelResult<Box<dyn ConsoleStream>>;

    async fn begin_migration(&self, name: &str, params: &MigrationParams) -> KestrelResult<()>;
    async fn query_migration(&self, name: &str) -> KestrelResult<MigrationProgress>;
    async fn cancel_migration(&self, name: &str) -> KestrelResult<()>;
}

/// Drivers keyed by host, shared by the reconciler, the migration
/// coordinator and the console hub.
#[derive(Default)]
pub struct DriverPool {
    drivers: dashmap::DashMap<crate::types::HostId, std::sync::Arc<dyn HostDriver>>,
}

impl DriverPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: crate::types::HostId, driver: std::sync::Arc<dyn HostDriver>) {
        self.drivers.insert(host, driver);
    }

    pub fn remove(&self, host: &crate::types::HostId) {
        self.drivers.remove(host);
    }

    pub fn get(&self, host: &crate::types::HostId) -> KestrelResult<std::sync::Arc<dyn HostDriver>> {
        self.drivers
            .get(host)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KestrelError::DriverUnavailable {
                host: host.to_string(),
                message: "no driver connected for host".into(),
            })
    }
}

/// In-memory driver used by tests and the simulation harness.
///
/// Tracks domain and volume state, logs every verb for idempotence
/// assertions, and supports failure injection per verb.
pub struct MockDriver {
    arch: Arch,
    domains: parking_lot::Mutex<HashMap<String, DomainState>>,
    volumes: parking_lot::Mutex<HashMap<String, u64>>,
    networks: parking_lot::Mutex<HashMap<String, NetworkSpec>>,
    chains: parking_lot::Mutex<HashMap<String, String>>,
    nat_rules: parking_lot::Mutex<Vec<(u16, Ipv4Addr)>>,
    floating_rules: parking_lot::Mutex<Vec<(Ipv4Addr, Ipv4Addr)>>,
    images: parking_lot::Mutex<Vec<String>>,
    operations: parking_lot::Mutex<Vec<String>>,
    /// verb -> remaining transient failures to inject
    transient_failures: parking_lot::Mutex<HashMap<String, u32>>,
    /// verbs that fail terminally
    terminal_failures: parking_lot::Mutex<Vec<String>>,
    /// migration ticks until completion, per domain
    migrations: parking_lot::Mutex<HashMap<String, u32>>,
    console_peers: parking_lot::Mutex<HashMap<String, tokio::io::DuplexStream>>,
}

impl MockDriver {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            domains: Default::default(),
            volumes: Default::default(),
            networks: Default::default(),
            chains: Default::default(),
            nat_rules: Default::default(),
            floating_rules: Default::default(),
            images: Default::default(),
            operations: Default::default(),
            transient_failures: Default::default(),
            terminal_failures: Default::default(),
            migrations: Default::default(),
            console_peers: Default::default(),
        }
    }

    /// Seed an image path so `ensure_image` succeeds.
    pub fn seed_image(&self, path: &str) {
        self.images.lock().push(path.to_string());
    }

    /// Inject `count` transient failures on a verb.
    pub fn fail_transient(&self, verb: &str, count: u32) {
        self.transient_failures.lock().insert(verb.to_string(), count);
    }

    /// Make a verb fail terminally until cleared.
    pub fn fail_terminal(&self, verb: &str) {
        self.terminal_failures.lock().push(verb.to_string());
    }

    pub fn clear_failures(&self) {
        self.transient_failures.lock().clear();
        self.terminal_failures.lock().clear();
    }

    /// Every verb issued so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    pub fn domain_state_sync(&self, name: &str) -> DomainState {
        self.domains
            .lock()
            .get(name)
            .copied()
            .unwrap_or(DomainState::Absent)
    }

    pub fn volume_exists(&self, path: &str) -> bool {
        self.volumes.lock().contains_key(path)
    }

    pub fn applied_chain(&self, chain: &str) -> Option<String> {
        self.chains.lock().get(chain).cloned()
    }

    pub fn nat_rules(&self) -> Vec<(u16, Ipv4Addr)> {
        self.nat_rules.lock().clone()
    }

    pub fn floating_rules(&self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        self.floating_rules.lock().clone()
    }

    /// Number of migration poll ticks before the mock reports completion.
    pub fn set_migration_ticks(&self, name: &str, ticks: u32) {
        self.migrations.lock().insert(name.to_string(), ticks);
    }

    /// Take the far end of a console opened via `open_serial_console`.
    pub fn take_console_peer(&self, socket_path: &str) -> Option<tokio::io::DuplexStream> {
        self.console_peers.lock().remove(socket_path)
    }

    fn gate(&self, verb: &str) -> KestrelResult<()> {
        self.operations.lock().push(verb.to_string());
        if self.terminal_failures.lock().iter().any(|v| v == verb) {
            return Err(KestrelError::driver_terminal(verb, "injected terminal failure"));
        }
        let mut transient = self.transient_failures.lock();
        if let Some(remaining) = transient.get_mut(verb) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KestrelError::DriverUnavailable {
                    host: "mock".into(),
                    message: format!("injected transient failure on {}", verb),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HostDriver for MockDriver {
    async fn host_facts(&self) -> KestrelResult<HostFacts> {
        self.gate("host_facts")?;
        Ok(HostFacts {
            arch: self.arch,
            libvirt_version: "10.0.0".into(),
            uplink: "eth0".into(),
        })
    }

    async fn ensure_image(&self, path: &str, _sha256: &str) -> KestrelResult<()> {
        self.gate("ensure_image")?;
        if self.images.lock().iter().any(|p| p == path) {
            Ok(())
        } else {
            Err(KestrelError::driver_terminal(
                "ensure_image",
                format!("image not present: {}", path),
            ))
        }
    }

    async fn define_domain(&self, spec: &DomainSpec) -> KestrelResult<()> {
        self.gate("define_domain")?;
        let mut domains = self.domains.lock();
        // Re-defining an existing domain refreshes its config; state sticks.
        domains.entry(spec.name.clone()).or_insert(DomainState::Shutoff);
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> KestrelResult<()> {
        self.gate("undefine_domain")?;
        self.domains.lock().remove(name);
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> KestrelResult<()> {
        self.gate("start_domain")?;
        let mut domains = self.domains.lock();
        match domains.get(name) {
            None => Err(KestrelError::driver_terminal(
                "start_domain",
                format!("domain {} is not defined", name),
            )),
            Some(DomainState::Running) => Ok(()),
            Some(_) => {
                domains.insert(name.to_string(), DomainState::Running);
                Ok(())
            }
        }
    }

    async fn stop_domain(&self, name: &str, _force: bool) -> KestrelResult<()> {
        self.gate("stop_domain")?;
        let mut domains = self.domains.lock();
        if domains.contains_key(name) {
            domains.insert(name.to_string(), DomainState::Shutoff);
        }
        Ok(())
    }

    async fn reboot_domain(&self, name: &str) -> KestrelResult<()> {
        self.gate("reboot_domain")?;
        match self.domains.lock().get(name) {
            Some(DomainState::Running) => Ok(()),
            _ => Err(KestrelError::driver_terminal(
                "reboot_domain",
                format!("domain {} is not running", name),
            )),
        }
    }

    async fn domain_state(&self, name: &str) -> KestrelResult<DomainState> {
        self.gate("domain_state")?;
        Ok(self.domain_state_sync(name))
    }

    async fn domain_metrics(&self, name: &str) -> KestrelResult<VmMetrics> {
        self.gate("domain_metrics")?;
        match self.domain_state_sync(name) {
            DomainState::Absent => Err(KestrelError::not_found(format!("domain {}", name))),
            _ => Ok(VmMetrics {
                cpu_time_ns: 1_000_000,
                memory_actual_mib: 512,
                memory_available_mib: 256,
                sampled_at: chrono::Utc::now(),
            }),
        }
    }

    async fn attach_volume(&self, name: &str, _slot: &str, path: &str) -> KestrelResult<()> {
        self.gate("attach_volume")?;
        if self.domain_state_sync(name) == DomainState::Absent {
            return Err(KestrelError::driver_terminal(
                "attach_volume",
                format!("domain {} is not defined", name),
            ));
        }
        if !self.volume_exists(path) {
            return Err(KestrelError::driver_terminal(
                "attach_volume",
                format!("volume missing: {}", path),
            ));
        }
        Ok(())
    }

    async fn detach_volume(&self, _name: &str, _slot: &str) -> KestrelResult<()> {
        self.gate("detach_volume")
    }

    async fn resize_cpu_mem(&self, name: &str, _vcpus: u32, _memory_mib: u64) -> KestrelResult<()> {
        self.gate("resize_cpu_mem")?;
        match self.domain_state_sync(name) {
            DomainState::Shutoff => Ok(()),
            DomainState::Absent => Err(KestrelError::driver_terminal(
                "resize_cpu_mem",
                format!("domain {} is not defined", name),
            )),
            other => Err(KestrelError::driver_terminal(
                "resize_cpu_mem",
                format!("domain {} must be shut off, is {:?}", name, other),
            )),
        }
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> KestrelResult<()> {
        self.gate("create_volume")?;
        self.volumes.lock().insert(spec.path.clone(), spec.size_gb);
        Ok(())
    }

    async fn resize_volume(&self, path: &str, new_size_gb: u64) -> KestrelResult<()> {
        self.gate("resize_volume")?;
        let mut volumes = self.volumes.lock();
        match volumes.get_mut(path) {
            Some(size) => {
                *size = new_size_gb;
                Ok(())
            }
            None => Err(KestrelError::driver_terminal(
                "resize_volume",
                format!("volume missing: {}", path),
            )),
        }
    }

    async fn delete_volume(&self, path: &str) -> KestrelResult<()> {
        self.gate("delete_volume")?;
        self.volumes.lock().remove(path);
        Ok(())
    }

    async fn create_cloud_init(&self, spec: &CloudInitSpec) -> KestrelResult<()> {
        self.gate("create_cloud_init")?;
        // The ISO behaves like any other host file for cleanup purposes.
        self.volumes.lock().insert(spec.iso_path.clone(), 0);
        Ok(())
    }

    async fn define_network(&self, spec: &NetworkSpec) -> KestrelResult<()> {
        self.gate("define_network")?;
        self.networks
            .lock()
            .insert(spec.bridge.clone(), spec.clone());
        Ok(())
    }

    async fn destroy_network(&self, bridge: &str) -> KestrelResult<()> {
        self.gate("destroy_network")?;
        self.networks.lock().remove(bridge);
        Ok(())
    }

    async fn apply_iptables(&self, chain: &str, script: &str) -> KestrelResult<()> {
        self.gate("apply_iptables")?;
        let mut chains = self.chains.lock();
        if chains.get(chain).map(String::as_str) == Some(script) {
            return Ok(());
        }
        chains.insert(chain.to_string(), script.to_string());
        Ok(())
    }

    async fn map_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()> {
        self.gate("map_ssh_nat")?;
        let mut rules = self.nat_rules.lock();
        if !rules.contains(&(host_port, vm_ip)) {
            rules.push((host_port, vm_ip));
        }
        Ok(())
    }

    async fn unmap_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()> {
        self.gate("unmap_ssh_nat")?;
        self.nat_rules.lock().retain(|r| *r != (host_port, vm_ip));
        Ok(())
    }

    async fn map_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()> {
        self.gate("map_floating_ip")?;
        let mut rules = self.floating_rules.lock();
        if !rules.contains(&(public, private)) {
            rules.push((public, private));
        }
        Ok(())
    }

    async fn unmap_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()> {
        self.gate("unmap_floating_ip")?;
        self.floating_rules
            .lock()
            .retain(|r| *r != (public, private));
        Ok(())
    }

    async fn open_serial_console(
        &self,
        socket_path: &str,
    ) -> KestrelResult<Box<dyn ConsoleStream>> {
        self.gate("open_serial_console")?;
        let (near, far) = tokio::io::duplex(16 * 1024);
        self.console_peers
            .lock()
            .insert(socket_path.to_string(), far);
        Ok(Box::new(near))
    }

    async fn begin_migration(&self, name: &str, _params: &MigrationParams) -> KestrelResult<()> {
        self.gate("begin_migration")?;
        if self.domain_state_sync(name) != DomainState::Running {
            return Err(KestrelError::driver_terminal(
                "begin_migration",
                format!("domain {} must be running to migrate", name),
            ));
        }
        self.migrations.lock().entry(name.to_string()).or_insert(3);
        Ok(())
    }

    async fn query_migration(&self, name: &str) -> KestrelResult<MigrationProgress> {
        self.gate("query_migration")?;
        let mut migrations = self.migrations.lock();
        match migrations.get_mut(name) {
            None => Ok(MigrationProgress {
                state: MigrationJobState::None,
                processed_bytes: 0,
                remaining_bytes: 0,
                total_bytes: 0,
            }),
            Some(0) => {
                migrations.remove(name);
                // The source domain shuts off as the job completes.
                self.domains
                    .lock()
                    .insert(name.to_string(), DomainState::Shutoff);
                Ok(MigrationProgress {
                    state: MigrationJobState::Completed,
                    processed_bytes: 4096,
                    remaining_bytes: 0,
                    total_bytes: 4096,
                })
            }
            Some(ticks) => {
                *ticks -= 1;
                let done = 4096 - (*ticks as u64 + 1) * 1024;
                Ok(MigrationProgress {
                    state: MigrationJobState::Active,
                    processed_bytes: done,
                    remaining_bytes: 4096 - done,
                    total_bytes: 4096,
                })
            }
        }
    }

    async fn cancel_migration(&self, name: &str) -> KestrelResult<()> {
        self.gate("cancel_migration")?;
        self.migrations.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verbs_are_idempotent() {
        let driver = MockDriver::new(Arch::X86_64);
        let spec = DomainSpec {
            vm: VmId::new(),
            name: "a".into(),
            arch: Arch::X86_64,
            vcpus: 1,
            memory_mib: 1024,
            root_disk: "/v/a.qcow2".into(),
            extra_disks: Vec::new(),
            cidata_iso: None,
            nic: None,
            serial_socket: "/run/a.sock".into(),
            vnc_port: 5901,
        };

        driver.define_domain(&spec).await.unwrap();
        driver.define_domain(&spec).await.unwrap();
        driver.start_domain("a").await.unwrap();
        driver.start_domain("a").await.unwrap();
        assert_eq!(driver.domain_state("a").await.unwrap(), DomainState::Running);

        driver.stop_domain("a", false).await.unwrap();
        driver.stop_domain("a", false).await.unwrap();
        assert_eq!(driver.domain_state("a").await.unwrap(), DomainState::Shutoff);

        driver.undefine_domain("a").await.unwrap();
        driver.undefine_domain("a").await.unwrap();
        assert_eq!(driver.domain_state("a").await.unwrap(), DomainState::Absent);
    }

    #[tokio::test]
    async fn start_of_undefined_domain_is_terminal() {
        let driver = MockDriver::new(Arch::X86_64);
        let err = driver.start_domain("ghost").await.unwrap_err();
        assert_eq!(err.code(), "driver_terminal");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn transient_failures_drain() {
        let driver = MockDriver::new(Arch::X86_64);
        driver.fail_transient("create_volume", 2);
        let spec = VolumeSpec {
            path: "/v/d.qcow2".into(),
            size_gb: 5,
            backing: None,
        };
        assert!(driver.create_volume(&spec).await.unwrap_err().is_retryable());
        assert!(driver.create_volume(&spec).await.unwrap_err().is_retryable());
        driver.create_volume(&spec).await.unwrap();
        assert!(driver.volume_exists("/v/d.qcow2"));
    }

    #[tokio::test]
    async fn migration_progress_advances_to_completion() {
        let driver = MockDriver::new(Arch::X86_64);
        let spec = DomainSpec {
            vm: VmId::new(),
            name: "m".into(),
            arch: Arch::X86_64,
            vcpus: 1,
            memory_mib: 1024,
            root_disk: "/v/m.qcow2".into(),
            extra_disks: Vec::new(),
            cidata_iso: None,
            nic: None,
            serial_socket: "/run/m.sock".into(),
            vnc_port: 5902,
        };
        driver.define_domain(&spec).await.unwrap();
        driver.start_domain("m").await.unwrap();
        driver
            .begin_migration(
                "m",
                &MigrationParams {
                    destination_uri: "qemu+ssh://dest/system".into(),
                    bandwidth_limit: None,
                    max_downtime_ms: Some(300),
                    compressed: true,
                    copy_storage: true,
                },
            )
            .await
            .unwrap();

        let mut last = driver.query_migration("m").await.unwrap();
        let mut polls = 1;
        while last.state == MigrationJobState::Active {
            last = driver.query_migration("m").await.unwrap();
            polls += 1;
            assert!(polls < 10, "mock migration never completed");
        }
        assert_eq!(last.state, MigrationJobState::Completed);
        assert_eq!(driver.domain_state("m").await.unwrap(), DomainState::Shutoff);
    }
}
