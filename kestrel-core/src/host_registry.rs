//! Hypervisor host inventory
//!
//! Hosts are registered by the operator, heartbeat through their drivers,
//! and are marked down when the heartbeat goes stale. Allocation accounting
//! is derived from the non-terminated VM rows rather than stored, so it can
//! never drift from the authoritative state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{KestrelError, KestrelResult};
use crate::store::{keys, Expected, Store};
use crate::types::{Arch, HostCapacity, HostHealth, HostId, HostRecord, VmRecord, VmStatus};

/// What a host has left after subtracting every non-terminated VM placed on
/// it.
#[derive(Debug, Clone, Copy)]
pub struct HostUsage {
    pub used_vcpus: u32,
    pub used_memory_mib: u64,
    pub active_vms: u32,
}

pub struct HostRegistry {
    store: Arc<Store>,
    heartbeat_staleness: Duration,
}

impl HostRegistry {
    pub fn new(store: Arc<Store>, heartbeat_staleness: Duration) -> Self {
        Self {
            store,
            heartbeat_staleness,
        }
    }

    /// Register a new host. Fails if a host with the same address exists.
    pub fn register(
        &self,
        address: String,
        arch: Arch,
        ssh_user: String,
        ssh_identity: Option<String>,
        capacity: HostCapacity,
        vm_root: String,
    ) -> KestrelResult<HostRecord> {
        for (existing, _) in self.store.list_typed::<HostRecord>(keys::HOST_PREFIX)? {
            if existing.address == address {
                return Err(KestrelError::AlreadyExists {
                    resource: format!("host {}", address),
                });
            }
        }
        let host = HostRecord {
            id: HostId::new(),
            address,
            arch,
            ssh_user,
            ssh_identity,
            capacity,
            health: HostHealth::Ready,
            last_heartbeat: Some(Utc::now()),
            vm_root,
            registered_at: Utc::now(),
        };
        self.store
            .put_typed(&keys::host(&host.id), &host, Expected::Absent)?;
        tracing::info!(host = %host.id, address = %host.address, "registered host");
        Ok(host)
    }

    /// Deregister a host. Refused while any non-terminated VM is placed on
    /// it.
    pub fn deregister(&self, id: &HostId) -> KestrelResult<()> {
        let usage = self.usage(id)?;
        if usage.active_vms > 0 {
            return Err(KestrelError::conflict(
                format!("host {}", id),
                format!("{} VMs still placed on host", usage.active_vms),
            ));
        }
        self.store.delete(&keys::host(id), Expected::Any)?;
        tracing::info!(host = %id, "deregistered host");
        Ok(())
    }

    pub fn get(&self, id: &HostId) -> KestrelResult<HostRecord> {
        self.store
            .get_typed::<HostRecord>(&keys::host(id))?
            .map(|(host, _)| host)
            .ok_or_else(|| KestrelError::not_found(format!("host {}", id)))
    }

    /// All hosts with staleness-derived health applied.
    pub fn list(&self) -> KestrelResult<Vec<HostRecord>> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.heartbeat_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(self
            .store
            .list_typed::<HostRecord>(keys::HOST_PREFIX)?
            .into_iter()
            .map(|(mut host, _)| {
                let stale = match host.last_heartbeat {
                    Some(at) => now - at > staleness,
                    None => true,
                };
                if stale && host.health == HostHealth::Ready {
                    host.health = HostHealth::Down;
                }
                host
            })
            .collect())
    }

    /// Record a heartbeat from a host's driver, marking it ready.
    pub fn heartbeat(&self, id: &HostId) -> KestrelResult<()> {
        let key = keys::host(id);
        let (mut host, rev) = self
            .store
            .get_typed::<HostRecord>(&key)?
            .ok_or_else(|| KestrelError::not_found(format!("host {}", id)))?;
        host.last_heartbeat = Some(Utc::now());
        host.health = HostHealth::Ready;
        self.store.put_typed(&key, &host, Expected::Rev(rev))?;
        Ok(())
    }

    /// Explicitly set health (driver error paths mark hosts degraded).
    pub fn set_health(&self, id: &HostId, health: HostHealth) -> KestrelResult<()> {
        let key = keys::host(id);
        let (mut host, rev) = self
            .store
            .get_typed::<HostRecord>(&key)?
            .ok_or_else(|| KestrelError::not_found(format!("host {}", id)))?;
        if host.health != health {
            tracing::warn!(host = %id, ?health, "host health changed");
        }
        host.health = health;
        self.store.put_typed(&key, &host, Expected::Rev(rev))?;
        Ok(())
    }

    /// Derived usage for one host, from the VM rows.
    pub fn usage(&self, id: &HostId) -> KestrelResult<HostUsage> {
        let mut usage = HostUsage {
            used_vcpus: 0,
            used_memory_mib: 0,
            active_vms: 0,
        };
        for (vm, _) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.status == VmStatus::Terminated || vm.owner_host != Some(*id) {
                continue;
            }
            usage.used_vcpus += vm.vcpus;
            usage.used_memory_mib += vm.memory_mib;
            usage.active_vms += 1;
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PowerState, VmId};
    use tempfile::tempdir;

    fn capacity() -> HostCapacity {
        HostCapacity {
            vcpus: 16,
            memory_mib: 32768,
            disk_bytes: 500 * 1024 * 1024 * 1024,
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<Store>, HostRegistry) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("hosts.redb")).unwrap());
        let registry = HostRegistry::new(store.clone(), Duration::from_secs(30));
        (dir, store, registry)
    }

    fn place_vm(store: &Store, host: HostId, vcpus: u32, memory_mib: u64, status: VmStatus) {
        let vm = VmRecord {
            id: VmId::new(),
            name: format!("vm-{}", vcpus),
            owner_host: Some(host),
            image: "ubuntu-20.04".into(),
            arch: Arch::X86_64,
            vcpus,
            memory_mib,
            root_disk_gb: 10,
            vpc: "v1".into(),
            nics: Vec::new(),
            disks: Vec::new(),
            desired_power: PowerState::On,
            observed_power: PowerState::Off,
            status,
            cloud_init: None,
            floating_ip: None,
            ssh_nat_port: None,
            vnc_port: None,
            serial_socket: None,
            pending_resize: None,
            anti_affinity: None,
            client_token: None,
            generation: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Absent)
            .unwrap();
    }

    #[test]
    fn register_rejects_duplicate_address() {
        let (_dir, _store, registry) = setup();
        registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                capacity(),
                "/var/lib/kestrel".into(),
            )
            .unwrap();
        let err = registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                capacity(),
                "/var/lib/kestrel".into(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn usage_counts_only_non_terminated_vms() {
        let (_dir, store, registry) = setup();
        let host = registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                capacity(),
                "/var/lib/kestrel".into(),
            )
            .unwrap();

        place_vm(&store, host.id, 2, 2048, VmStatus::Running);
        place_vm(&store, host.id, 4, 4096, VmStatus::Stopped);
        place_vm(&store, host.id, 8, 8192, VmStatus::Terminated);

        let usage = registry.usage(&host.id).unwrap();
        assert_eq!(usage.used_vcpus, 6);
        assert_eq!(usage.used_memory_mib, 6144);
        assert_eq!(usage.active_vms, 2);
    }

    #[test]
    fn deregister_refused_while_occupied() {
        let (_dir, store, registry) = setup();
        let host = registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                capacity(),
                "/var/lib/kestrel".into(),
            )
            .unwrap();
        place_vm(&store, host.id, 2, 2048, VmStatus::Running);
        assert_eq!(registry.deregister(&host.id).unwrap_err().code(), "conflict");
    }

    #[test]
    fn heartbeat_marks_ready() {
        let (_dir, _store, registry) = setup();
        let host = registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                capacity(),
                "/var/lib/kestrel".into(),
            )
            .unwrap();
        registry.set_health(&host.id, HostHealth::Down).unwrap();
        registry.heartbeat(&host.id).unwrap();
        assert_eq!(registry.get(&host.id).unwrap().health, HostHealth::Ready);
    }
}
