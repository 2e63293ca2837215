//! Shared control-plane state
//!
//! `ControlPlane` is what API handlers and background tasks hold: the store,
//! the allocators, the host registry, the driver pool, the console hub and
//! the reconciler queue. Handlers stay thin; every operation here follows
//! the same shape: validate, mutate desired state in one store batch,
//! enqueue reconciliation, return the row and its revision.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::Config;
use crate::console::{ConsoleClient, ConsoleHub};
use crate::driver::{DriverPool, VmMetrics, VolumeSpec};
use crate::error::{KestrelError, KestrelResult};
use crate::host_registry::HostRegistry;
use crate::ipam::Ipam;
use crate::migration::{MigrationCoordinator, MigrationRequest};
use crate::paths;
use crate::reconciler::Reconciler;
use crate::store::{keys, BatchOp, Expected, Store};
use crate::types::{
    Arch, CloudInitDoc, Direction, DiskAttachment, DiskRecord, DiskStatus, FirewallRule,
    FloatingIp, FloatingIpStatus, HostId, ImageRecord, IpScope, MigrationRecord, PortRange,
    PowerState, Protocol, ResizeSpec, RuleId, Subnet, SubnetId, VmId, VmRecord, VmStatus, Vpc,
};

/// Hard bounds on the create-VM request.
pub const MAX_VCPUS: u32 = 64;
pub const MAX_MEMORY_MIB: u64 = 256 * 1024;
pub const MIN_MEMORY_MIB: u64 = 512;
pub const MIN_DISK_GB: u64 = 10;

/// Validated create-VM parameters (the API layer decodes the wire shape)
#[derive(Debug, Clone)]
pub struct CreateVm {
    pub name: String,
    pub vpc: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub image_id: String,
    pub arch: Option<Arch>,
    pub cloud_init: Option<CloudInitDoc>,
    pub anti_affinity: Option<String>,
    pub client_token: Option<String>,
}

pub struct ControlPlane {
    pub config: Config,
    pub store: Arc<Store>,
    pub ipam: Arc<Ipam>,
    pub registry: Arc<HostRegistry>,
    pub drivers: Arc<DriverPool>,
    pub reconciler: Arc<Reconciler>,
    pub console: Arc<ConsoleHub>,
    coordinator: Arc<MigrationCoordinator>,
    shutdown: watch::Receiver<bool>,
}

impl ControlPlane {
    pub fn new(config: Config, store: Arc<Store>, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let ipam = Arc::new(Ipam::new(
            store.clone(),
            config.network.public_ip_pool.clone(),
            config.network.release_grace,
        ));
        let registry = Arc::new(HostRegistry::new(
            store.clone(),
            config.hosts.heartbeat_staleness,
        ));
        let drivers = Arc::new(DriverPool::new());
        let reconciler = Reconciler::new(
            store.clone(),
            ipam.clone(),
            registry.clone(),
            drivers.clone(),
            config.reconciler.clone(),
            shutdown.clone(),
        );
        let console = Arc::new(ConsoleHub::new(config.console.clone()));
        let coordinator = Arc::new(MigrationCoordinator::new(store.clone()));
        Arc::new(Self {
            config,
            store,
            ipam,
            registry,
            drivers,
            reconciler,
            console,
            coordinator,
            shutdown,
        })
    }

    /// Start the long-lived background tasks: the reconciler worker loop and
    /// the orphaned-reservation sweeper.
    pub fn spawn_background(self: &Arc<Self>) {
        tokio::spawn(self.reconciler.clone().run());

        let this = self.clone();
        tokio::spawn(async move {
            let mut shutdown = this.shutdown.clone();
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = this.ipam.reap_orphans() {
                            tracing::warn!(error = %e, "ip reaper pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // VPCs and subnets

    pub fn create_vpc(&self, name: &str, cidr: Option<&str>, mtu: u32) -> KestrelResult<(Vpc, u64)> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(KestrelError::validation(
                "name",
                "VPC names are non-empty, alphanumeric plus dashes",
            ));
        }
        let cidr_str = cidr.unwrap_or(&self.config.network.default_vpc_cidr);
        let cidr: ipnet::Ipv4Net = cidr_str
            .parse()
            .map_err(|_| KestrelError::validation("cidr", format!("not a CIDR: {}", cidr_str)))?;
        if cidr.prefix_len() > 29 {
            return Err(KestrelError::validation(
                "cidr",
                "VPC CIDRs need at least a /29 of room",
            ));
        }
        let vpc = Vpc::new(name.to_string(), cidr, mtu);
        let rev = self
            .store
            .put_typed(&keys::vpc(name), &vpc, Expected::Absent)
            .map_err(|e| match e {
                KestrelError::Conflict { .. } => KestrelError::AlreadyExists {
                    resource: format!("vpc {}", name),
                },
                other => other,
            })?;
        tracing::info!(vpc = name, cidr = %vpc.cidr, "created VPC");
        Ok((vpc, rev))
    }

    pub fn list_vpcs(&self) -> KestrelResult<Vec<Vpc>> {
        Ok(self
            .store
            .list_typed::<Vpc>(keys::VPC_PREFIX)?
            .into_iter()
            .map(|(vpc, _)| vpc)
            .collect())
    }

    pub fn get_vpc(&self, name: &str) -> KestrelResult<(Vpc, u64)> {
        self.store
            .get_typed::<Vpc>(&keys::vpc(name))?
            .ok_or_else(|| KestrelError::not_found(format!("vpc {}", name)))
    }

    /// Deleting a VPC requires zero non-terminated VMs and no live
    /// allocations referencing it.
    pub fn delete_vpc(&self, name: &str) -> KestrelResult<u64> {
        let (vpc, rev) = self.get_vpc(name)?;
        for (vm, _) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.vpc == name && !vm.status.is_terminated() {
                return Err(KestrelError::conflict(
                    format!("vpc {}", name),
                    format!("VM {} still references the VPC", vm.name),
                ));
            }
        }
        let scope = IpScope::VpcPrivate(name.to_string());
        for alloc in self.ipam.list(&scope)? {
            if alloc.status != crate::types::AllocationStatus::Released {
                return Err(KestrelError::conflict(
                    format!("vpc {}", name),
                    format!("address {} is still allocated", alloc.address),
                ));
            }
        }
        let mut ops = vec![BatchOp::delete(keys::vpc(name), Expected::Rev(rev))];
        for subnet in &vpc.subnets {
            ops.push(BatchOp::delete(keys::subnet(subnet), Expected::Any));
        }
        for (rule, _) in self
            .store
            .list_typed::<FirewallRule>(&keys::fwrule_vpc_prefix(name))?
        {
            ops.push(BatchOp::delete(
                keys::fwrule(name, &rule.id),
                Expected::Any,
            ));
        }
        let rev = self.store.batch(ops)?;
        tracing::info!(vpc = name, "deleted VPC");
        Ok(rev)
    }

    pub fn add_subnet(&self, vpc_name: &str, name: &str, cidr: &str) -> KestrelResult<(Subnet, u64)> {
        let (mut vpc, rev) = self.get_vpc(vpc_name)?;
        let cidr: ipnet::Ipv4Net = cidr
            .parse()
            .map_err(|_| KestrelError::validation("cidr", format!("not a CIDR: {}", cidr)))?;
        let vpc_net = vpc.cidr;
        if !(vpc_net.contains(&cidr.network()) && vpc_net.contains(&cidr.broadcast())) {
            return Err(KestrelError::validation(
                "cidr",
                format!("subnet {} is not within VPC CIDR {}", cidr, vpc_net),
            ));
        }
        for existing in &vpc.subnets {
            if let Some((subnet, _)) = self.store.get_typed::<Subnet>(&keys::subnet(existing))? {
                if subnet.name == name {
                    return Err(KestrelError::AlreadyExists {
                        resource: format!("subnet {} in vpc {}", name, vpc_name),
                    });
                }
            }
        }
        let subnet = Subnet {
            id: SubnetId::new(),
            name: name.to_string(),
            vpc: vpc_name.to_string(),
            cidr,
            created_at: Utc::now(),
        };
        vpc.subnets.push(subnet.id);
        let rev = self.store.batch(vec![
            BatchOp::put_typed(keys::vpc(vpc_name), &vpc, Expected::Rev(rev))?,
            BatchOp::put_typed(keys::subnet(&subnet.id), &subnet, Expected::Absent)?,
        ])?;
        Ok((subnet, rev))
    }

    /// Refuse removal while any allocation lies within the subnet.
    pub fn remove_subnet(&self, vpc_name: &str, subnet_name: &str) -> KestrelResult<u64> {
        let (mut vpc, rev) = self.get_vpc(vpc_name)?;
        let mut found: Option<(Subnet, u64)> = None;
        for id in &vpc.subnets {
            if let Some((subnet, subnet_rev)) = self.store.get_typed::<Subnet>(&keys::subnet(id))? {
                if subnet.name == subnet_name {
                    found = Some((subnet, subnet_rev));
                    break;
                }
            }
        }
        let (subnet, subnet_rev) = found.ok_or_else(|| {
            KestrelError::not_found(format!("subnet {} in vpc {}", subnet_name, vpc_name))
        })?;

        let scope = IpScope::VpcPrivate(vpc_name.to_string());
        for alloc in self.ipam.list(&scope)? {
            if alloc.status != crate::types::AllocationStatus::Released
                && subnet.cidr.contains(&alloc.address)
            {
                return Err(KestrelError::conflict(
                    format!("subnet {}", subnet_name),
                    format!("address {} is still allocated", alloc.address),
                ));
            }
        }
        vpc.subnets.retain(|id| *id != subnet.id);
        let rev = self.store.batch(vec![
            BatchOp::put_typed(keys::vpc(vpc_name), &vpc, Expected::Rev(rev))?,
            BatchOp::delete(keys::subnet(&subnet.id), Expected::Rev(subnet_rev)),
        ])?;
        Ok(rev)
    }

    pub fn list_subnets(&self, vpc_name: &str) -> KestrelResult<Vec<Subnet>> {
        let (vpc, _) = self.get_vpc(vpc_name)?;
        let mut subnets = Vec::new();
        for id in &vpc.subnets {
            if let Some((subnet, _)) = self.store.get_typed::<Subnet>(&keys::subnet(id))? {
                subnets.push(subnet);
            }
        }
        Ok(subnets)
    }

    // ------------------------------------------------------------------
    // Firewall rules

    #[allow(clippy::too_many_arguments)]
    pub fn add_firewall_rule(
        &self,
        vpc_name: &str,
        direction: Direction,
        protocol: Protocol,
        port_range: Option<PortRange>,
        cidr: &str,
        description: &str,
        priority: u16,
    ) -> KestrelResult<(FirewallRule, u64)> {
        self.get_vpc(vpc_name)?;
        if let Some(range) = &port_range {
            range.validate()?;
        }
        if protocol != Protocol::Icmp && port_range.is_none() {
            return Err(KestrelError::validation(
                "port_range",
                "tcp and udp rules need a port range",
            ));
        }
        let cidr: ipnet::Ipv4Net = cidr
            .parse()
            .map_err(|_| KestrelError::validation("cidr", format!("not a CIDR: {}", cidr)))?;
        let rule = FirewallRule {
            id: RuleId::new(),
            vpc: vpc_name.to_string(),
            direction,
            protocol,
            port_range,
            cidr,
            description: description.to_string(),
            priority,
            created_at: Utc::now(),
        };
        let rev = self.store.put_typed(
            &keys::fwrule(vpc_name, &rule.id),
            &rule,
            Expected::Absent,
        )?;
        self.spawn_vpc_reconcile(vpc_name);
        Ok((rule, rev))
    }

    pub fn list_firewall_rules(&self, vpc_name: &str) -> KestrelResult<Vec<FirewallRule>> {
        self.get_vpc(vpc_name)?;
        Ok(self
            .store
            .list_typed::<FirewallRule>(&keys::fwrule_vpc_prefix(vpc_name))?
            .into_iter()
            .map(|(rule, _)| rule)
            .collect())
    }

    pub fn delete_firewall_rule(&self, vpc_name: &str, rule: &RuleId) -> KestrelResult<u64> {
        let key = keys::fwrule(vpc_name, rule);
        if self.store.get(&key)?.is_none() {
            return Err(KestrelError::not_found(format!("firewall rule {}", rule)));
        }
        let rev = self.store.delete(&key, Expected::Any)?;
        self.spawn_vpc_reconcile(vpc_name);
        Ok(rev)
    }

    fn spawn_vpc_reconcile(&self, vpc_name: &str) {
        let reconciler = self.reconciler.clone();
        let vpc = vpc_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = reconciler.reconcile_vpc(&vpc).await {
                tracing::warn!(vpc = %vpc, error = %e, "vpc firewall reconcile failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // VMs

    pub fn create_vm(&self, request: CreateVm) -> KestrelResult<(VmRecord, u64)> {
        // Idempotence: the same client token returns the same VM with no
        // side effects.
        if let Some(token) = &request.client_token {
            for (vm, rev) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
                if vm.client_token.as_deref() == Some(token.as_str()) {
                    return Ok((vm, rev));
                }
            }
        }

        if request.name.is_empty() {
            return Err(KestrelError::validation("name", "VM name cannot be empty"));
        }
        if request.cpu_cores < 1 || request.cpu_cores > MAX_VCPUS {
            return Err(KestrelError::validation(
                "cpu_cores",
                format!("must be 1..={}", MAX_VCPUS),
            ));
        }
        if request.memory_mb < MIN_MEMORY_MIB
            || request.memory_mb % 512 != 0
            || request.memory_mb > MAX_MEMORY_MIB
        {
            return Err(KestrelError::validation(
                "memory_mb",
                format!(
                    "must be {}..={} in steps of 512",
                    MIN_MEMORY_MIB, MAX_MEMORY_MIB
                ),
            ));
        }
        if request.disk_size_gb < MIN_DISK_GB {
            return Err(KestrelError::validation(
                "disk_size_gb",
                format!("must be at least {}", MIN_DISK_GB),
            ));
        }
        for (vm, _) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.name == request.name && !vm.status.is_terminated() {
                return Err(KestrelError::AlreadyExists {
                    resource: format!("vm {}", request.name),
                });
            }
        }
        self.get_vpc(&request.vpc)?;
        let (image, _) = self
            .store
            .get_typed::<ImageRecord>(&keys::image(&request.image_id))?
            .ok_or_else(|| KestrelError::not_found(format!("image {}", request.image_id)))?;
        let arch = request.arch.unwrap_or(image.arch);
        if arch != image.arch {
            return Err(KestrelError::UnsupportedArch {
                arch: format!("image {} is {}, not {}", image.id, image.arch, arch),
            });
        }

        let now = Utc::now();
        let vm = VmRecord {
            id: VmId::new(),
            name: request.name,
            owner_host: None,
            image: request.image_id,
            arch,
            vcpus: request.cpu_cores,
            memory_mib: request.memory_mb,
            root_disk_gb: request.disk_size_gb,
            vpc: request.vpc,
            nics: Vec::new(),
            disks: Vec::new(),
            desired_power: PowerState::On,
            observed_power: PowerState::Off,
            status: VmStatus::Creating,
            cloud_init: request.cloud_init,
            floating_ip: None,
            ssh_nat_port: None,
            vnc_port: None,
            serial_socket: None,
            pending_resize: None,
            anti_affinity: request.anti_affinity,
            client_token: request.client_token,
            generation: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let rev = self
            .store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Absent)?;
        self.reconciler.enqueue(vm.id);
        tracing::info!(vm = %vm.id, name = %vm.name, "accepted VM create");
        Ok((vm, rev))
    }

    pub fn list_vms(&self) -> KestrelResult<Vec<VmRecord>> {
        Ok(self
            .store
            .list_typed::<VmRecord>(keys::VM_PREFIX)?
            .into_iter()
            .map(|(vm, _)| vm)
            .collect())
    }

    /// Resolve a VM by id or unique name.
    pub fn resolve_vm(&self, selector: &str) -> KestrelResult<(VmRecord, u64)> {
        if let Ok(id) = selector.parse::<VmId>() {
            if let Some(found) = self.store.get_typed::<VmRecord>(&keys::vm(&id))? {
                return Ok(found);
            }
        }
        for (vm, rev) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.name == selector && !vm.status.is_terminated() {
                return Ok((vm, rev));
            }
        }
        Err(KestrelError::not_found(format!("vm {}", selector)))
    }

    /// Shared preamble for explicit VM verbs: generation check and error
    /// reset (an explicit verb is the user's retry).
    fn mutate_vm(
        &self,
        selector: &str,
        expected_generation: Option<u64>,
        mutate: impl FnOnce(&mut VmRecord) -> KestrelResult<()>,
    ) -> KestrelResult<(VmRecord, u64)> {
        let (mut vm, rev) = self.resolve_vm(selector)?;
        if let Some(generation) = expected_generation {
            if generation != vm.generation {
                return Err(KestrelError::conflict(
                    format!("vm {}", vm.id),
                    format!("generation {} expected, row is at {}", generation, vm.generation),
                ));
            }
        }
        if vm.status == VmStatus::Terminated {
            return Err(KestrelError::conflict(
                format!("vm {}", vm.id),
                "VM is terminated",
            ));
        }
        mutate(&mut vm)?;
        let rev = self
            .store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
        self.reconciler.enqueue(vm.id);
        Ok((vm, rev))
    }

    pub fn start_vm(
        &self,
        selector: &str,
        expected_generation: Option<u64>,
    ) -> KestrelResult<(VmRecord, u64)> {
        self.mutate_vm(selector, expected_generation, |vm| {
            vm.desired_power = PowerState::On;
            if vm.status == VmStatus::Error {
                vm.last_error = None;
                vm.transition(VmStatus::Creating);
            }
            Ok(())
        })
    }

    pub fn stop_vm(
        &self,
        selector: &str,
        expected_generation: Option<u64>,
    ) -> KestrelResult<(VmRecord, u64)> {
        self.mutate_vm(selector, expected_generation, |vm| {
            vm.desired_power = PowerState::Off;
            if vm.status == VmStatus::Error {
                vm.last_error = None;
                vm.transition(VmStatus::Stopped);
            }
            Ok(())
        })
    }

    /// Restart cycles through stopped: the power loop stops the domain and
    /// brings it back because desired power stays on.
    pub fn restart_vm(
        &self,
        selector: &str,
        expected_generation: Option<u64>,
    ) -> KestrelResult<(VmRecord, u64)> {
        self.mutate_vm(selector, expected_generation, |vm| {
            vm.desired_power = PowerState::On;
            match vm.status {
                VmStatus::Running => {
                    vm.transition(VmStatus::Stopping);
                    Ok(())
                }
                VmStatus::Stopped | VmStatus::Error => {
                    vm.last_error = None;
                    vm.transition(VmStatus::Stopped);
                    Ok(())
                }
                other => Err(KestrelError::conflict(
                    format!("vm {}", vm.id),
                    format!("cannot restart while {:?}", other),
                )),
            }
        })
    }

    pub fn terminate_vm(
        &self,
        selector: &str,
        expected_generation: Option<u64>,
    ) -> KestrelResult<(VmRecord, u64)> {
        self.mutate_vm(selector, expected_generation, |vm| {
            vm.last_error = None;
            vm.transition(VmStatus::Terminating);
            Ok(())
        })
    }

    pub fn resize_vm(
        &self,
        selector: &str,
        vcpus: u32,
        memory_mib: u64,
        expected_generation: Option<u64>,
    ) -> KestrelResult<(VmRecord, u64)> {
        if vcpus < 1 || vcpus > MAX_VCPUS {
            return Err(KestrelError::validation(
                "cpu_cores",
                format!("must be 1..={}", MAX_VCPUS),
            ));
        }
        if memory_mib < MIN_MEMORY_MIB || memory_mib % 512 != 0 || memory_mib > MAX_MEMORY_MIB {
            return Err(KestrelError::validation(
                "memory_mb",
                "must be a multiple of 512 within bounds",
            ));
        }
        self.mutate_vm(selector, expected_generation, |vm| {
            match vm.status {
                VmStatus::Running | VmStatus::Stopped => {
                    vm.pending_resize = Some(ResizeSpec { vcpus, memory_mib });
                    vm.transition(VmStatus::Resizing);
                    Ok(())
                }
                other => Err(KestrelError::conflict(
                    format!("vm {}", vm.id),
                    format!("cannot resize while {:?}", other),
                )),
            }
        })
    }

    /// Merge the store row with the driver's live view.
    pub async fn vm_status(
        &self,
        selector: &str,
    ) -> KestrelResult<(VmRecord, Option<crate::driver::DomainState>)> {
        let (vm, _) = self.resolve_vm(selector)?;
        let observed = match vm.owner_host {
            Some(host) => match self.drivers.get(&host) {
                Ok(driver) => driver.domain_state(&vm.name).await.ok(),
                Err(_) => None,
            },
            None => None,
        };
        Ok((vm, observed))
    }

    pub async fn vm_metrics(&self, selector: &str) -> KestrelResult<VmMetrics> {
        let (vm, _) = self.resolve_vm(selector)?;
        let host = vm.owner_host.ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM is not placed on any host")
        })?;
        let driver = self.drivers.get(&host)?;
        driver.domain_metrics(&vm.name).await
    }

    // ------------------------------------------------------------------
    // Disks

    pub fn create_disk(&self, name: &str, size_gb: u64) -> KestrelResult<(DiskRecord, u64)> {
        if name.is_empty() {
            return Err(KestrelError::validation("name", "disk name cannot be empty"));
        }
        if size_gb == 0 {
            return Err(KestrelError::validation("size_gb", "size must be positive"));
        }
        let disk = DiskRecord {
            id: crate::types::DiskId::new(),
            name: name.to_string(),
            size_gb,
            backing_path: None,
            host: None,
            status: DiskStatus::Available,
            attachment: None,
            created_at: Utc::now(),
        };
        let rev = self
            .store
            .put_typed(&keys::disk(&disk.id), &disk, Expected::Absent)?;
        Ok((disk, rev))
    }

    pub fn list_disks(&self) -> KestrelResult<Vec<DiskRecord>> {
        Ok(self
            .store
            .list_typed::<DiskRecord>(keys::DISK_PREFIX)?
            .into_iter()
            .map(|(disk, _)| disk)
            .collect())
    }

    pub fn get_disk(&self, id: &crate::types::DiskId) -> KestrelResult<(DiskRecord, u64)> {
        self.store
            .get_typed::<DiskRecord>(&keys::disk(id))?
            .ok_or_else(|| KestrelError::not_found(format!("disk {}", id)))
    }

    pub fn delete_disk(&self, id: &crate::types::DiskId) -> KestrelResult<u64> {
        let (disk, rev) = self.get_disk(id)?;
        if disk.status != DiskStatus::Available {
            return Err(KestrelError::conflict(
                format!("disk {}", id),
                format!("disk is {:?}, not available", disk.status),
            ));
        }
        self.store.delete(&keys::disk(id), Expected::Rev(rev))
    }

    /// Attach a disk to a VM. The volume is created on the VM's host on
    /// first attach; a disk follows its data, so re-attaching on another
    /// host is refused until the volume is migrated off.
    pub async fn attach_disk(
        &self,
        disk_id: &crate::types::DiskId,
        vm_selector: &str,
    ) -> KestrelResult<(DiskRecord, u64)> {
        let (mut disk, disk_rev) = self.get_disk(disk_id)?;
        let (mut vm, vm_rev) = self.resolve_vm(vm_selector)?;
        if disk.status != DiskStatus::Available {
            return Err(KestrelError::conflict(
                format!("disk {}", disk_id),
                format!("disk is {:?}, not available", disk.status),
            ));
        }
        let host_id = vm.owner_host.ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM is not placed yet")
        })?;
        if let Some(disk_host) = disk.host {
            if disk_host != host_id {
                return Err(KestrelError::conflict(
                    format!("disk {}", disk_id),
                    "disk data lives on another host",
                ));
            }
        }
        let host = self.registry.get(&host_id)?;
        let driver = self.drivers.get(&host_id)?;

        let slot = next_disk_slot(&vm);
        let path = paths::volume(&host.vm_root, disk_id);
        if disk.backing_path.is_none() {
            driver
                .create_volume(&VolumeSpec {
                    path: path.clone(),
                    size_gb: disk.size_gb,
                    backing: None,
                })
                .await?;
        }
        driver.attach_volume(&vm.name, &slot, &path).await?;

        disk.status = DiskStatus::InUse;
        disk.attachment = Some((vm.id, slot.clone()));
        disk.host = Some(host_id);
        disk.backing_path = Some(path);
        vm.disks.push(DiskAttachment {
            disk: *disk_id,
            slot,
        });
        vm.generation += 1;
        vm.updated_at = Utc::now();
        let rev = self.store.batch(vec![
            BatchOp::put_typed(keys::disk(disk_id), &disk, Expected::Rev(disk_rev))?,
            BatchOp::put_typed(keys::vm(&vm.id), &vm, Expected::Rev(vm_rev))?,
        ])?;
        Ok((disk, rev))
    }

    pub async fn detach_disk(
        &self,
        disk_id: &crate::types::DiskId,
        vm_selector: &str,
    ) -> KestrelResult<(DiskRecord, u64)> {
        let (mut disk, disk_rev) = self.get_disk(disk_id)?;
        let (mut vm, vm_rev) = self.resolve_vm(vm_selector)?;
        let Some((attached_vm, slot)) = disk.attachment.clone() else {
            return Err(KestrelError::conflict(
                format!("disk {}", disk_id),
                "disk is not attached",
            ));
        };
        if attached_vm != vm.id {
            return Err(KestrelError::conflict(
                format!("disk {}", disk_id),
                "disk is attached to a different VM",
            ));
        }
        if let Some(host_id) = vm.owner_host {
            let driver = self.drivers.get(&host_id)?;
            driver.detach_volume(&vm.name, &slot).await?;
        }

        disk.status = DiskStatus::Available;
        disk.attachment = None;
        vm.disks.retain(|attachment| attachment.disk != *disk_id);
        vm.generation += 1;
        vm.updated_at = Utc::now();
        let rev = self.store.batch(vec![
            BatchOp::put_typed(keys::disk(disk_id), &disk, Expected::Rev(disk_rev))?,
            BatchOp::put_typed(keys::vm(&vm.id), &vm, Expected::Rev(vm_rev))?,
        ])?;
        Ok((disk, rev))
    }

    /// Disk resize requires the disk to be unattached, or its VM stopped.
    pub async fn resize_disk(
        &self,
        disk_id: &crate::types::DiskId,
        new_size_gb: u64,
    ) -> KestrelResult<(DiskRecord, u64)> {
        let (mut disk, disk_rev) = self.get_disk(disk_id)?;
        if new_size_gb <= disk.size_gb {
            return Err(KestrelError::validation(
                "size_gb",
                "disks only grow; shrink is not supported",
            ));
        }
        if let Some((vm_id, _)) = disk.attachment {
            let (vm, _) = self
                .store
                .get_typed::<VmRecord>(&keys::vm(&vm_id))?
                .ok_or_else(|| KestrelError::not_found(format!("vm {}", vm_id)))?;
            if vm.status != VmStatus::Stopped {
                return Err(KestrelError::conflict(
                    format!("disk {}", disk_id),
                    "attached disk can only be resized while its VM is stopped",
                ));
            }
        }
        if let (Some(path), Some(host)) = (&disk.backing_path, disk.host) {
            let driver = self.drivers.get(&host)?;
            driver.resize_volume(path, new_size_gb).await?;
        }
        disk.size_gb = new_size_gb;
        let rev = self
            .store
            .put_typed(&keys::disk(disk_id), &disk, Expected::Rev(disk_rev))?;
        Ok((disk, rev))
    }

    // ------------------------------------------------------------------
    // Floating IPs

    pub fn add_floating_ip(&self, address: Ipv4Addr) -> KestrelResult<(FloatingIp, u64)> {
        self.ipam.add_public(address)?;
        let fip = FloatingIp {
            address,
            status: FloatingIpStatus::Available,
            bound_vm: None,
            last_rebind: None,
            created_at: Utc::now(),
        };
        let rev = self
            .store
            .put_typed(&keys::fip(&address), &fip, Expected::Any)?;
        Ok((fip, rev))
    }

    pub fn list_floating_ips(&self) -> KestrelResult<Vec<FloatingIp>> {
        Ok(self
            .store
            .list_typed::<FloatingIp>(keys::FIP_PREFIX)?
            .into_iter()
            .map(|(fip, _)| fip)
            .collect())
    }

    pub fn remove_floating_ip(&self, address: Ipv4Addr) -> KestrelResult<u64> {
        let (fip, rev) = self
            .store
            .get_typed::<FloatingIp>(&keys::fip(&address))?
            .ok_or_else(|| KestrelError::not_found(format!("floating ip {}", address)))?;
        if fip.status == FloatingIpStatus::Bound {
            return Err(KestrelError::conflict(
                format!("floating ip {}", address),
                "address is bound to a VM",
            ));
        }
        self.ipam.remove_public(address)?;
        self.store.delete(&keys::fip(&address), Expected::Rev(rev))
    }

    /// Bind a floating IP (a specific one, or the next free) to a VM and
    /// install the DNAT rule on its host.
    pub async fn attach_ip(
        &self,
        vm_selector: &str,
        address: Option<Ipv4Addr>,
    ) -> KestrelResult<(FloatingIp, u64)> {
        let (mut vm, vm_rev) = self.resolve_vm(vm_selector)?;
        if vm.floating_ip.is_some() {
            return Err(KestrelError::conflict(
                format!("vm {}", vm.id),
                "VM already has a floating IP",
            ));
        }
        let nic = vm.nics.first().cloned().ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM has no NIC yet")
        })?;

        let (address, alloc_op) =
            self.ipam
                .allocate_bound(&IpScope::PublicPool, vm.id, address)?;
        let (mut fip, fip_rev) = self
            .store
            .get_typed::<FloatingIp>(&keys::fip(&address))?
            .ok_or_else(|| KestrelError::not_found(format!("floating ip {}", address)))?;
        if fip.status == FloatingIpStatus::Bound {
            return Err(KestrelError::conflict(
                format!("floating ip {}", address),
                "never two bindings at once",
            ));
        }

        if let Some(host) = vm.owner_host {
            let driver = self.drivers.get(&host)?;
            driver.map_floating_ip(address, nic.private_ip).await?;
        }

        fip.status = FloatingIpStatus::Bound;
        fip.bound_vm = Some(vm.id);
        fip.last_rebind = Some(Utc::now());
        vm.floating_ip = Some(address);
        vm.generation += 1;
        vm.updated_at = Utc::now();
        let rev = self.store.batch(vec![
            alloc_op,
            BatchOp::put_typed(keys::fip(&address), &fip, Expected::Rev(fip_rev))?,
            BatchOp::put_typed(keys::vm(&vm.id), &vm, Expected::Rev(vm_rev))?,
        ])?;
        Ok((fip, rev))
    }

    pub async fn detach_ip(
        &self,
        vm_selector: &str,
        address: Ipv4Addr,
    ) -> KestrelResult<(FloatingIp, u64)> {
        let (mut vm, vm_rev) = self.resolve_vm(vm_selector)?;
        if vm.floating_ip != Some(address) {
            return Err(KestrelError::conflict(
                format!("vm {}", vm.id),
                format!("floating ip {} is not attached to this VM", address),
            ));
        }
        let (mut fip, fip_rev) = self
            .store
            .get_typed::<FloatingIp>(&keys::fip(&address))?
            .ok_or_else(|| KestrelError::not_found(format!("floating ip {}", address)))?;

        if let (Some(host), Some(nic)) = (vm.owner_host, vm.nics.first()) {
            let driver = self.drivers.get(&host)?;
            driver.unmap_floating_ip(address, nic.private_ip).await?;
        }

        fip.status = FloatingIpStatus::Available;
        fip.bound_vm = None;
        vm.floating_ip = None;
        vm.generation += 1;
        vm.updated_at = Utc::now();
        let release_op = self
            .ipam
            .release_op(&IpScope::PublicPool, address, Some(vm.id))?;
        let mut ops = vec![
            BatchOp::put_typed(keys::fip(&address), &fip, Expected::Rev(fip_rev))?,
            BatchOp::put_typed(keys::vm(&vm.id), &vm, Expected::Rev(vm_rev))?,
        ];
        if let Some(op) = release_op {
            ops.push(op);
        }
        let rev = self.store.batch(ops)?;
        Ok((fip, rev))
    }

    // ------------------------------------------------------------------
    // Images

    pub fn list_images(&self) -> KestrelResult<Vec<ImageRecord>> {
        Ok(self
            .store
            .list_typed::<ImageRecord>(keys::IMAGE_PREFIX)?
            .into_iter()
            .map(|(image, _)| image)
            .collect())
    }

    pub fn register_image(&self, image: ImageRecord) -> KestrelResult<u64> {
        self.store
            .put_typed(&keys::image(&image.id), &image, Expected::Any)
    }

    // ------------------------------------------------------------------
    // Migrations

    /// Kick off a live migration in the background. The coordinator
    /// persists every phase; callers follow `/migrations/{vm}/status`.
    pub fn start_migration(
        &self,
        vm_selector: &str,
        destination: HostId,
        bandwidth_limit: Option<u64>,
        max_downtime_ms: Option<u64>,
        compressed: bool,
        shared_storage: bool,
    ) -> KestrelResult<VmId> {
        let (vm, _) = self.resolve_vm(vm_selector)?;
        let source_host = vm.owner_host.ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM is not placed on any host")
        })?;
        let source = self.drivers.get(&source_host)?;
        let dest = self.drivers.get(&destination)?;
        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let request = MigrationRequest {
            destination,
            bandwidth_limit,
            max_downtime_ms,
            compressed,
            shared_storage,
        };
        let vm_id = vm.id;
        tokio::spawn(async move {
            if let Err(e) = coordinator.run(vm_id, request, source, dest, shutdown).await {
                tracing::warn!(vm = %vm_id, error = %e, "migration failed");
            }
        });
        Ok(vm_id)
    }

    pub fn migration_status(&self, vm_selector: &str) -> KestrelResult<(MigrationRecord, u64)> {
        let (vm, _) = self.resolve_vm(vm_selector)?;
        self.store
            .get_typed::<MigrationRecord>(&keys::migration(&vm.id))?
            .ok_or_else(|| KestrelError::not_found(format!("migration for vm {}", vm.id)))
    }

    pub fn list_migrations(&self) -> KestrelResult<Vec<MigrationRecord>> {
        Ok(self
            .store
            .list_typed::<MigrationRecord>(keys::MIGRATION_PREFIX)?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    /// Ask the source hypervisor to abort; the coordinator observes the
    /// cancelled job and runs its abort path.
    pub async fn cancel_migration(&self, vm_selector: &str) -> KestrelResult<()> {
        let (vm, _) = self.resolve_vm(vm_selector)?;
        let (record, _) = self.migration_status(vm_selector)?;
        if matches!(
            record.phase,
            crate::types::MigrationPhase::Finalize | crate::types::MigrationPhase::Aborted
        ) {
            return Err(KestrelError::conflict(
                format!("vm {}", vm.id),
                "migration already finished",
            ));
        }
        let driver = self.drivers.get(&record.source)?;
        driver.cancel_migration(&vm.name).await
    }

    // ------------------------------------------------------------------
    // Console

    pub async fn console_attach(&self, vm_selector: &str) -> KestrelResult<ConsoleClient> {
        let (vm, _) = self.resolve_vm(vm_selector)?;
        let host = vm.owner_host.ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM is not placed on any host")
        })?;
        let socket = vm.serial_socket.clone().ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM has no serial console yet")
        })?;
        let driver = self.drivers.get(&host)?;
        self.console.attach(vm.id, &driver, &socket).await
    }

    // ------------------------------------------------------------------
    // Health

    pub fn health(&self) -> serde_json::Value {
        let store_ok = self.store.current_rev().is_ok();
        let host_count = self.registry.list().map(|h| h.len()).unwrap_or(0);
        serde_json::json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "components": {
                "store": if store_ok { "ok" } else { "unavailable" },
                "drivers": { "hosts": host_count },
                "scheduler": "ok",
            }
        })
    }
}

/// Next free guest device slot: vdb, vdc, ... (vda is the root disk).
fn next_disk_slot(vm: &VmRecord) -> String {
    let used: Vec<&str> = vm.disks.iter().map(|a| a.slot.as_str()).collect();
    for letter in b'b'..=b'z' {
        let slot = format!("vd{}", letter as char);
        if !used.contains(&slot.as_str()) {
            return slot;
        }
    }
    // 25 data disks per VM is beyond what virtio-blk setups carry.
    "vdz".to_string()
}
