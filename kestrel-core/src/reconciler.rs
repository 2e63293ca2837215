//! The reconciler: drives observed state toward desired state
//!
//! One logical task per VM. Each pass takes a stable snapshot of the VM row,
//! plans the ordered driver verbs for its current transition, and executes
//! them with bounded retries and exponential backoff. A terminal driver
//! error parks the VM in `error` with the failing step recorded, after a
//! compensating rollback limited to the resources created in the current
//! transition: a failed `start` never undefines the domain it follows.
//!
//! Tasks for distinct VMs run concurrently; tasks for the same VM are
//! serialized through a per-id lock map. Driver traffic per host is bounded
//! by a semaphore to match libvirt's tolerance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

use crate::config::ReconcilerConfig;
use crate::driver::{
    CloudInitSpec, DomainSpec, DomainState, DriverPool, HostDriver, NetworkSpec, NicSpec,
    VolumeSpec,
};
use crate::error::{KestrelError, KestrelResult};
use crate::firewall;
use crate::host_registry::HostRegistry;
use crate::ipam::Ipam;
use crate::paths;
use crate::store::{keys, BatchOp, Expected, Store};
use crate::types::{
    CloudInitDoc, DiskRecord, DiskStatus, FirewallRule, FloatingIp, FloatingIpStatus, HostId,
    HostRecord, IpScope, NicRecord, PowerState, VmId, VmRecord, VmStatus, Vpc,
};

/// SSH NAT ports are drawn from this per-host range.
const SSH_NAT_RANGE: std::ops::Range<u16> = 22200..23000;
/// VNC displays start here.
const VNC_BASE: u16 = 5900;
/// Upper bound on state-machine rounds per reconcile pass.
const MAX_ROUNDS: usize = 12;

/// Deterministic, locally-administered MAC derived from the VM id.
pub fn deterministic_mac(vm: &VmId) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in vm.to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        (hash >> 24) & 0xff,
        (hash >> 16) & 0xff,
        (hash >> 8) & 0xff,
        hash & 0xff
    )
}

/// What a failed create transition must undo, in reverse order.
enum Rollback {
    DeleteVolume(String),
    UndefineDomain(String),
    UnmapNat(u16, std::net::Ipv4Addr),
    ReleaseIp(IpScope, std::net::Ipv4Addr),
}

pub struct Reconciler {
    store: Arc<Store>,
    ipam: Arc<Ipam>,
    registry: Arc<HostRegistry>,
    drivers: Arc<DriverPool>,
    config: ReconcilerConfig,
    vm_locks: DashMap<VmId, Arc<Mutex<()>>>,
    host_semaphores: DashMap<HostId, Arc<Semaphore>>,
    queue_tx: mpsc::Sender<VmId>,
    queue_rx: Mutex<Option<mpsc::Receiver<VmId>>>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        ipam: Arc<Ipam>,
        registry: Arc<HostRegistry>,
        drivers: Arc<DriverPool>,
        config: ReconcilerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(1024);
        Arc::new(Self {
            store,
            ipam,
            registry,
            drivers,
            config,
            vm_locks: DashMap::new(),
            host_semaphores: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown,
        })
    }

    /// Enqueue a reconciliation token for a VM. Cheap and non-blocking;
    /// duplicate tokens collapse into one pass because passes re-read state.
    pub fn enqueue(&self, vm: VmId) {
        if let Err(e) = self.queue_tx.try_send(vm) {
            tracing::warn!(vm = %vm, error = %e, "reconcile queue full, dropping token");
        }
    }

    /// Worker loop: drains the queue, one bounded task per VM.
    pub async fn run(self: Arc<Self>) {
        let mut rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::error!("reconciler run() called twice");
                return;
            }
        };
        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                maybe_vm = rx.recv() => {
                    let Some(vm) = maybe_vm else { break };
                    let permit = match workers.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.reconcile_vm(vm).await {
                            tracing::warn!(vm = %vm, error = %e, "reconcile pass failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// One reconcile pass for a VM: loop the state machine until the row is
    /// stable, an error parks it, or the round budget runs out.
    pub async fn reconcile_vm(&self, vm_id: VmId) -> KestrelResult<()> {
        let lock = self
            .vm_locks
            .entry(vm_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let pass = self.reconcile_locked(vm_id);
        match tokio::time::timeout(self.config.transition_timeout, pass).await {
            Ok(result) => result,
            Err(_) => {
                let err = KestrelError::DriverTimeout {
                    verb: "transition".into(),
                    duration: self.config.transition_timeout,
                };
                self.park_in_error(&vm_id, "transition", &err)?;
                Err(err)
            }
        }
    }

    async fn reconcile_locked(&self, vm_id: VmId) -> KestrelResult<()> {
        for _ in 0..MAX_ROUNDS {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let Some((vm, rev)) = self.store.get_typed::<VmRecord>(&keys::vm(&vm_id))? else {
                return Ok(());
            };

            let step_result = match vm.status {
                VmStatus::Creating => self.do_create(vm, rev).await,
                VmStatus::Stopped => {
                    if vm.pending_resize.is_some() {
                        self.set_status(&vm_id, rev, VmStatus::Resizing).map(|_| true)
                    } else if vm.desired_power == PowerState::On {
                        self.set_status(&vm_id, rev, VmStatus::Starting).map(|_| true)
                    } else {
                        Ok(false)
                    }
                }
                VmStatus::Starting => self.do_start(vm, rev).await,
                VmStatus::Running => self.do_observe_running(vm, rev).await,
                VmStatus::Stopping => self.do_stop(vm, rev).await,
                VmStatus::Resizing => self.do_resize(vm, rev).await,
                VmStatus::Terminating => self.do_terminate(vm, rev).await.map(|_| false),
                // Migrations are owned by the coordinator; errors wait for
                // an explicit user retry; terminated rows are inert.
                VmStatus::Migrating | VmStatus::Error | VmStatus::Terminated => Ok(false),
            };

            match step_result {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                // CAS races with API writes re-read on the next round.
                Err(KestrelError::Conflict { .. }) => continue,
                Err(err) => {
                    self.park_in_error(&vm_id, error_step(&err), &err)?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Creating: place, allocate network identity, prepare artifacts on the
    /// host, define the domain. Ends in `stopped` (the power loop takes it
    /// from there).
    async fn do_create(&self, mut vm: VmRecord, mut rev: u64) -> KestrelResult<bool> {
        // Placement first; nothing host-side can happen without it.
        if vm.owner_host.is_none() {
            let hosts = self.registry.list()?;
            let placements: Vec<VmRecord> = self
                .store
                .list_typed::<VmRecord>(keys::VM_PREFIX)?
                .into_iter()
                .map(|(record, _)| record)
                .collect();
            let image = self.load_image(&vm.image)?;
            let host =
                crate::scheduler::schedule(&(&vm).into(), &hosts, &placements, &image)?;
            vm.owner_host = Some(host);
            rev = self
                .store
                .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
            tracing::info!(vm = %vm.id, host = %host, "scheduled VM");
        }
        let host_id = vm.owner_host.ok_or_else(|| {
            KestrelError::internal(format!("vm {} lost its placement mid-create", vm.id))
        })?;
        let host = self.registry.get(&host_id)?;
        let driver = self.drivers.get(&host.id)?;
        let (vpc, _) = self
            .store
            .get_typed::<Vpc>(&keys::vpc(&vm.vpc))?
            .ok_or_else(|| KestrelError::not_found(format!("vpc {}", vm.vpc)))?;

        // Network identity rides in one batch with the row update, so a
        // crash can never leave the address half-allocated.
        let mut created_ip = None;
        if vm.nics.is_empty() {
            let scope = IpScope::VpcPrivate(vpc.name.clone());
            let (address, reserve_op) = self.ipam.reserve(&scope, Some(vm.id), None)?;
            vm.nics.push(NicRecord {
                mac: deterministic_mac(&vm.id),
                private_ip: address,
                subnet: vpc.subnets.first().copied(),
                bridge: vpc.chain.clone(),
            });
            vm.ssh_nat_port = Some(self.pick_ssh_port(&host.id, &vm.id)?);
            vm.vnc_port = Some(self.pick_vnc_port(&host.id, &vm.id)?);
            vm.serial_socket = Some(paths::serial_socket(&host.vm_root, &vm.id));
            rev = self.store.batch(vec![
                BatchOp::put_typed(keys::vm(&vm.id), &vm, Expected::Rev(rev))?,
                reserve_op,
            ])?;
            created_ip = Some((scope, address));
        } else if let Some(nic) = vm.nics.first() {
            // Retry after a rolled-back create: the persisted NIC must be
            // backed by a live reservation again before the domain is
            // rebuilt, or the bind below would hit the released row.
            let scope = IpScope::VpcPrivate(vpc.name.clone());
            self.ipam.reacquire(&scope, nic.private_ip, vm.id)?;
            created_ip = Some((scope, nic.private_ip));
        }

        let mut rollback: Vec<Rollback> = Vec::new();
        if let Some((scope, address)) = &created_ip {
            rollback.push(Rollback::ReleaseIp(scope.clone(), *address));
        }
        let outcome = self
            .create_on_host(&vm, &host, &vpc, &driver, &mut rollback)
            .await;
        match outcome {
            Ok(()) => {
                // Bind the address now that the NIC exists on a real domain.
                let nic_ip = vm.nics.first().map(|nic| nic.private_ip).ok_or_else(|| {
                    KestrelError::internal(format!("vm {} has no NIC after create", vm.id))
                })?;
                let scope = IpScope::VpcPrivate(vpc.name.clone());
                self.ipam.bind(&scope, nic_ip, vm.id)?;
                vm.observed_power = PowerState::Off;
                vm.last_error = None;
                vm.transition(VmStatus::Stopped);
                self.store
                    .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
                tracing::info!(vm = %vm.id, host = %host.id, ip = %nic_ip, "VM created");
                Ok(true)
            }
            Err(err) => {
                self.run_rollback(&driver, rollback).await;
                Err(err)
            }
        }
    }

    async fn create_on_host(
        &self,
        vm: &VmRecord,
        host: &HostRecord,
        vpc: &Vpc,
        driver: &Arc<dyn HostDriver>,
        rollback: &mut Vec<Rollback>,
    ) -> KestrelResult<()> {
        let image = self.load_image(&vm.image)?;
        let image_path = paths::image(&host.vm_root, &image.id);
        {
            let driver = driver.clone();
            let path = image_path.clone();
            let sha = image.sha256.clone();
            self.retry(&host.id, "ensure_image", move || {
                let driver = driver.clone();
                let path = path.clone();
                let sha = sha.clone();
                async move { driver.ensure_image(&path, &sha).await }
            })
            .await?;
        }

        {
            let spec = NetworkSpec {
                bridge: vpc.chain.clone(),
                gateway_cidr: format!("{}/{}", vpc.gateway, vpc.cidr.prefix_len()),
                mtu: vpc.mtu,
            };
            let driver = driver.clone();
            self.retry(&host.id, "define_network", move || {
                let driver = driver.clone();
                let spec = spec.clone();
                async move { driver.define_network(&spec).await }
            })
            .await?;
        }

        let root_disk = paths::root_disk(&host.vm_root, &vm.id);
        {
            let spec = VolumeSpec {
                path: root_disk.clone(),
                size_gb: vm.root_disk_gb,
                backing: Some(image_path),
            };
            let driver = driver.clone();
            self.retry(&host.id, "create_volume", move || {
                let driver = driver.clone();
                let spec = spec.clone();
                async move { driver.create_volume(&spec).await }
            })
            .await?;
            rollback.push(Rollback::DeleteVolume(root_disk.clone()));
        }

        let iso_path = paths::cidata_iso(&host.vm_root, &vm.id);
        {
            let nic = vm.nics.first();
            let spec = CloudInitSpec {
                instance_id: vm.id.to_string(),
                hostname: vm
                    .cloud_init
                    .as_ref()
                    .and_then(|doc| doc.hostname.clone())
                    .unwrap_or_else(|| vm.name.clone()),
                doc: vm.cloud_init.clone().unwrap_or_else(CloudInitDoc::default),
                ip: nic.map(|n| n.private_ip),
                gateway: Some(vpc.gateway),
                prefix_len: Some(vpc.cidr.prefix_len()),
                iso_path: iso_path.clone(),
            };
            let driver = driver.clone();
            self.retry(&host.id, "create_cloud_init", move || {
                let driver = driver.clone();
                let spec = spec.clone();
                async move { driver.create_cloud_init(&spec).await }
            })
            .await?;
            rollback.push(Rollback::DeleteVolume(iso_path.clone()));
        }

        {
            let spec = DomainSpec {
                vm: vm.id,
                name: vm.name.clone(),
                arch: vm.arch,
                vcpus: vm.vcpus,
                memory_mib: vm.memory_mib,
                root_disk,
                extra_disks: Vec::new(),
                cidata_iso: Some(iso_path),
                nic: vm.nics.first().map(|nic| NicSpec {
                    bridge: nic.bridge.clone(),
                    mac: nic.mac.clone(),
                    ip: nic.private_ip,
                }),
                serial_socket: vm
                    .serial_socket
                    .clone()
                    .unwrap_or_else(|| paths::serial_socket(&host.vm_root, &vm.id)),
                vnc_port: vm.vnc_port.unwrap_or(VNC_BASE),
            };
            let driver = driver.clone();
            self.retry(&host.id, "define_domain", move || {
                let driver = driver.clone();
                let spec = spec.clone();
                async move { driver.define_domain(&spec).await }
            })
            .await?;
            rollback.push(Rollback::UndefineDomain(vm.name.clone()));
        }

        if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
            let ip = nic.private_ip;
            let driver = driver.clone();
            self.retry(&host.id, "map_ssh_nat", move || {
                let driver = driver.clone();
                async move { driver.map_ssh_nat(port, ip).await }
            })
            .await?;
            rollback.push(Rollback::UnmapNat(port, ip));
        }

        // The VPC's firewall chains apply to every VM NIC on this host.
        self.push_firewall(&host.id, vpc, driver).await?;
        Ok(())
    }

    async fn do_start(&self, mut vm: VmRecord, rev: u64) -> KestrelResult<bool> {
        let (host, driver) = self.host_and_driver(&vm)?;
        {
            let name = vm.name.clone();
            let driver = driver.clone();
            self.retry(&host.id, "start_domain", move || {
                let driver = driver.clone();
                let name = name.clone();
                async move { driver.start_domain(&name).await }
            })
            .await?;
        }
        let state = self.query_state(&host.id, &driver, &vm.name).await?;
        if state != DomainState::Running {
            return Err(KestrelError::driver_terminal(
                "start_domain",
                format!("domain {} reported {:?} after start", vm.name, state),
            ));
        }
        vm.observed_power = PowerState::On;
        vm.last_error = None;
        vm.transition(VmStatus::Running);
        self.store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
        Ok(true)
    }

    async fn do_stop(&self, mut vm: VmRecord, rev: u64) -> KestrelResult<bool> {
        let (host, driver) = self.host_and_driver(&vm)?;
        {
            let name = vm.name.clone();
            let driver = driver.clone();
            self.retry(&host.id, "stop_domain", move || {
                let driver = driver.clone();
                let name = name.clone();
                async move { driver.stop_domain(&name, false).await }
            })
            .await?;
        }
        vm.observed_power = PowerState::Off;
        vm.transition(VmStatus::Stopped);
        self.store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
        Ok(true)
    }

    /// Refresh observed state for a running VM; repair drift.
    async fn do_observe_running(&self, mut vm: VmRecord, rev: u64) -> KestrelResult<bool> {
        if vm.desired_power == PowerState::Off {
            self.set_status(&vm.id, rev, VmStatus::Stopping)?;
            return Ok(true);
        }
        let (host, driver) = self.host_and_driver(&vm)?;
        let state = self.query_state(&host.id, &driver, &vm.name).await?;
        match state {
            DomainState::Running => Ok(false),
            DomainState::Shutoff | DomainState::Crashed => {
                tracing::warn!(vm = %vm.id, ?state, "running VM drifted, restarting");
                vm.observed_power = PowerState::Off;
                vm.transition(VmStatus::Starting);
                self.store
                    .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
                Ok(true)
            }
            DomainState::Paused => Ok(false),
            DomainState::Absent => Err(KestrelError::driver_terminal(
                "domain_state",
                format!("domain {} vanished from its host", vm.name),
            )),
        }
    }

    /// Offline resize: stop if needed, edit the definition, restart if
    /// desired.
    async fn do_resize(&self, mut vm: VmRecord, rev: u64) -> KestrelResult<bool> {
        let Some(resize) = vm.pending_resize else {
            // Nothing pending; drop back to the power loop.
            self.set_status(&vm.id, rev, VmStatus::Stopped)?;
            return Ok(true);
        };
        let (host, driver) = self.host_and_driver(&vm)?;

        let state = self.query_state(&host.id, &driver, &vm.name).await?;
        if state == DomainState::Running {
            let name = vm.name.clone();
            let driver = driver.clone();
            self.retry(&host.id, "stop_domain", move || {
                let driver = driver.clone();
                let name = name.clone();
                async move { driver.stop_domain(&name, false).await }
            })
            .await?;
        }

        {
            let name = vm.name.clone();
            let driver = driver.clone();
            self.retry(&host.id, "resize_cpu_mem", move || {
                let driver = driver.clone();
                let name = name.clone();
                async move { driver.resize_cpu_mem(&name, resize.vcpus, resize.memory_mib).await }
            })
            .await?;
        }

        vm.vcpus = resize.vcpus;
        vm.memory_mib = resize.memory_mib;
        vm.pending_resize = None;
        vm.observed_power = PowerState::Off;
        vm.transition(VmStatus::Stopped);
        self.store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
        tracing::info!(vm = %vm.id, vcpus = resize.vcpus, memory_mib = resize.memory_mib, "resized VM");
        Ok(true)
    }

    /// Terminate: stop, detach disks, undefine, release addresses, delete
    /// host artifacts. Destruction is best effort; what cannot be proven
    /// gone is logged and left to the sweeper.
    async fn do_terminate(&self, mut vm: VmRecord, rev: u64) -> KestrelResult<()> {
        if let Ok((host, driver)) = self.host_and_driver(&vm) {
            let best_effort = |what: &str, result: KestrelResult<()>| {
                if let Err(e) = result {
                    tracing::warn!(vm = %vm.id, step = what, error = %e, "cleanup step failed, continuing");
                }
            };

            best_effort(
                "stop_domain",
                driver.stop_domain(&vm.name, true).await,
            );
            for attachment in &vm.disks {
                best_effort(
                    "detach_volume",
                    driver.detach_volume(&vm.name, &attachment.slot).await,
                );
            }
            best_effort("undefine_domain", driver.undefine_domain(&vm.name).await);
            if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
                best_effort(
                    "unmap_ssh_nat",
                    driver.unmap_ssh_nat(port, nic.private_ip).await,
                );
            }
            if let (Some(public), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
                best_effort(
                    "unmap_floating_ip",
                    driver.unmap_floating_ip(public, nic.private_ip).await,
                );
            }
            best_effort(
                "delete_cidata",
                driver
                    .delete_volume(&paths::cidata_iso(&host.vm_root, &vm.id))
                    .await,
            );
            best_effort(
                "delete_root_disk",
                driver
                    .delete_volume(&paths::root_disk(&host.vm_root, &vm.id))
                    .await,
            );
        }

        // Detached disks survive the VM and become attachable again.
        for attachment in &vm.disks {
            let key = keys::disk(&attachment.disk);
            if let Some((mut disk, disk_rev)) = self.store.get_typed::<DiskRecord>(&key)? {
                disk.attachment = None;
                disk.status = DiskStatus::Available;
                self.store.put_typed(&key, &disk, Expected::Rev(disk_rev))?;
            }
        }

        // Release addresses; the grace period keeps them out of circulation.
        let scope = IpScope::VpcPrivate(vm.vpc.clone());
        for nic in &vm.nics {
            self.ipam.release(&scope, nic.private_ip, Some(vm.id))?;
        }
        if let Some(public) = vm.floating_ip {
            self.ipam
                .release(&IpScope::PublicPool, public, Some(vm.id))?;
            let key = keys::fip(&public);
            if let Some((mut fip, fip_rev)) = self.store.get_typed::<FloatingIp>(&key)? {
                fip.status = FloatingIpStatus::Available;
                fip.bound_vm = None;
                self.store.put_typed(&key, &fip, Expected::Rev(fip_rev))?;
            }
        }

        vm.disks.clear();
        vm.observed_power = PowerState::Off;
        vm.transition(VmStatus::Terminated);
        self.store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Rev(rev))?;
        tracing::info!(vm = %vm.id, "VM terminated");
        Ok(())
    }

    /// Compile and push the VPC's firewall chains to one host.
    async fn push_firewall(
        &self,
        host: &HostId,
        vpc: &Vpc,
        driver: &Arc<dyn HostDriver>,
    ) -> KestrelResult<()> {
        let rules: Vec<FirewallRule> = self
            .store
            .list_typed::<FirewallRule>(&keys::fwrule_vpc_prefix(&vpc.name))?
            .into_iter()
            .map(|(rule, _)| rule)
            .collect();
        let compiled = firewall::compile(vpc, &rules);
        let driver = driver.clone();
        self.retry(host, "apply_iptables", move || {
            let driver = driver.clone();
            let chain = compiled.chain.clone();
            let script = compiled.script.clone();
            async move { driver.apply_iptables(&chain, &script).await }
        })
        .await
    }

    /// Re-push firewall chains for a VPC to every host carrying one of its
    /// VMs. Called when rules change.
    pub async fn reconcile_vpc(&self, vpc_name: &str) -> KestrelResult<()> {
        let (vpc, _) = self
            .store
            .get_typed::<Vpc>(&keys::vpc(vpc_name))?
            .ok_or_else(|| KestrelError::not_found(format!("vpc {}", vpc_name)))?;
        let mut hosts: Vec<HostId> = Vec::new();
        for (vm, _) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.vpc == vpc_name && !vm.status.is_terminated() {
                if let Some(host) = vm.owner_host {
                    if !hosts.contains(&host) {
                        hosts.push(host);
                    }
                }
            }
        }
        for host in hosts {
            let driver = self.drivers.get(&host)?;
            self.push_firewall(&host, &vpc, &driver).await?;
        }
        Ok(())
    }

    fn host_and_driver(&self, vm: &VmRecord) -> KestrelResult<(HostRecord, Arc<dyn HostDriver>)> {
        let host_id = vm.owner_host.ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm.id), "VM has no owner host")
        })?;
        let host = self.registry.get(&host_id)?;
        let driver = self.drivers.get(&host_id)?;
        Ok((host, driver))
    }

    fn load_image(&self, id: &str) -> KestrelResult<crate::types::ImageRecord> {
        self.store
            .get_typed::<crate::types::ImageRecord>(&keys::image(id))?
            .map(|(image, _)| image)
            .ok_or_else(|| KestrelError::not_found(format!("image {}", id)))
    }

    fn set_status(&self, vm_id: &VmId, rev: u64, status: VmStatus) -> KestrelResult<u64> {
        let (mut vm, _) = self
            .store
            .get_typed::<VmRecord>(&keys::vm(vm_id))?
            .ok_or_else(|| KestrelError::not_found(format!("vm {}", vm_id)))?;
        vm.transition(status);
        self.store
            .put_typed(&keys::vm(vm_id), &vm, Expected::Rev(rev))
    }

    fn park_in_error(&self, vm_id: &VmId, step: &str, err: &KestrelError) -> KestrelResult<()> {
        let key = keys::vm(vm_id);
        if let Some((mut vm, rev)) = self.store.get_typed::<VmRecord>(&key)? {
            vm.record_error(step, err);
            self.store.put_typed(&key, &vm, Expected::Rev(rev))?;
        }
        Ok(())
    }

    async fn run_rollback(&self, driver: &Arc<dyn HostDriver>, rollback: Vec<Rollback>) {
        for action in rollback.into_iter().rev() {
            let result = match &action {
                Rollback::DeleteVolume(path) => driver.delete_volume(path).await,
                Rollback::UndefineDomain(name) => driver.undefine_domain(name).await,
                Rollback::UnmapNat(port, ip) => driver.unmap_ssh_nat(*port, *ip).await,
                Rollback::ReleaseIp(scope, address) => {
                    self.ipam.release(scope, *address, None)
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "rollback step failed");
            }
        }
    }

    fn pick_ssh_port(&self, host: &HostId, vm: &VmId) -> KestrelResult<u16> {
        let used = self.ports_in_use(host, |vm| vm.ssh_nat_port)?;
        // Deterministic preference derived from the id keeps retries stable.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in vm.to_string().as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let span = (SSH_NAT_RANGE.end - SSH_NAT_RANGE.start) as u32;
        let preferred = SSH_NAT_RANGE.start + (hash % span) as u16;
        if !used.contains(&preferred) {
            return Ok(preferred);
        }
        SSH_NAT_RANGE
            .clone()
            .find(|p| !used.contains(p))
            .ok_or_else(|| KestrelError::Exhausted {
                resource: format!("ssh nat ports on host {}", host),
            })
    }

    fn pick_vnc_port(&self, host: &HostId, _vm: &VmId) -> KestrelResult<u16> {
        let used = self.ports_in_use(host, |vm| vm.vnc_port)?;
        (VNC_BASE + 1..VNC_BASE + 200)
            .find(|p| !used.contains(p))
            .ok_or_else(|| KestrelError::Exhausted {
                resource: format!("vnc ports on host {}", host),
            })
    }

    fn ports_in_use(
        &self,
        host: &HostId,
        extract: impl Fn(&VmRecord) -> Option<u16>,
    ) -> KestrelResult<Vec<u16>> {
        Ok(self
            .store
            .list_typed::<VmRecord>(keys::VM_PREFIX)?
            .into_iter()
            .filter(|(vm, _)| vm.owner_host == Some(*host) && !vm.status.is_terminated())
            .filter_map(|(vm, _)| extract(&vm))
            .collect())
    }

    fn host_semaphore(&self, host: &HostId) -> Arc<Semaphore> {
        self.host_semaphores
            .entry(*host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.host_verb_concurrency.max(1))))
            .clone()
    }

    async fn query_state(
        &self,
        host: &HostId,
        driver: &Arc<dyn HostDriver>,
        name: &str,
    ) -> KestrelResult<DomainState> {
        let driver = driver.clone();
        let name = name.to_string();
        self.retry(host, "domain_state", move || {
            let driver = driver.clone();
            let name = name.clone();
            async move { driver.domain_state(&name).await }
        })
        .await
    }

    /// Execute a driver verb with the per-host semaphore, a per-verb
    /// timeout, and bounded exponential backoff on retryable failures.
    async fn retry<T, F, Fut>(&self, host: &HostId, verb: &str, mut op: F) -> KestrelResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KestrelResult<T>>,
    {
        let semaphore = self.host_semaphore(host);
        let mut attempt: u32 = 0;
        loop {
            let permit = semaphore
                .acquire()
                .await
                .map_err(|_| KestrelError::internal("host semaphore closed"))?;
            let outcome = tokio::time::timeout(self.config.verb_timeout, op()).await;
            drop(permit);

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => KestrelError::DriverTimeout {
                    verb: verb.to_string(),
                    duration: self.config.verb_timeout,
                },
            };
            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }
            let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
            attempt += 1;
            tracing::warn!(
                host = %host,
                verb,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "driver verb failed, backing off"
            );
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Err(KestrelError::conflict(
                            format!("host {}", host),
                            "shutdown during retry backoff",
                        ));
                    }
                }
            }
        }
    }
}

/// Exponential backoff with jitter: base * 2^attempt, capped, plus up to
/// 25% random spread so retries from many tasks do not align.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter)
}

fn error_step(err: &KestrelError) -> &str {
    match err {
        KestrelError::DriverTerminal { verb, .. } => verb,
        KestrelError::DriverTimeout { verb, .. } => verb,
        _ => "reconcile",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::types::{
        AllocationStatus, Arch, DiskAttachment, HostCapacity, ImageRecord, IpAllocation,
        ResizeSpec,
    };
    use chrono::Utc;
    use ipnet::Ipv4Net;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        reconciler: Arc<Reconciler>,
        driver: Arc<MockDriver>,
        host: HostRecord,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn test_config() -> ReconcilerConfig {
        ReconcilerConfig {
            workers: 2,
            host_verb_concurrency: 4,
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            verb_timeout: Duration::from_secs(5),
            transition_timeout: Duration::from_secs(60),
        }
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("rec.redb")).unwrap());

        let vpc = Vpc::new("v1".into(), "10.0.0.0/24".parse::<Ipv4Net>().unwrap(), 1500);
        store
            .put_typed(&keys::vpc("v1"), &vpc, Expected::Absent)
            .unwrap();

        let registry = Arc::new(HostRegistry::new(store.clone(), Duration::from_secs(30)));
        let host = registry
            .register(
                "198.51.100.1".into(),
                Arch::X86_64,
                "root".into(),
                None,
                HostCapacity {
                    vcpus: 16,
                    memory_mib: 32768,
                    disk_bytes: 1 << 40,
                },
                "/var/lib/kestrel".into(),
            )
            .unwrap();

        let image = ImageRecord {
            id: "ubuntu-20.04".into(),
            name: "Ubuntu 20.04 LTS".into(),
            arch: Arch::X86_64,
            sha256: "0".repeat(64),
            hosts: Vec::new(),
        };
        store
            .put_typed(&keys::image("ubuntu-20.04"), &image, Expected::Absent)
            .unwrap();

        let driver = Arc::new(MockDriver::new(Arch::X86_64));
        driver.seed_image(&paths::image(&host.vm_root, "ubuntu-20.04"));
        let drivers = Arc::new(DriverPool::new());
        drivers.insert(host.id, driver.clone());

        let ipam = Arc::new(Ipam::new(store.clone(), Vec::new(), Duration::from_secs(300)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Reconciler::new(
            store.clone(),
            ipam,
            registry,
            drivers,
            test_config(),
            shutdown_rx,
        );
        Fixture {
            _dir: dir,
            store,
            reconciler,
            driver,
            host,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn seed_vm(fixture: &Fixture, name: &str, desired: PowerState) -> VmId {
        let vm = VmRecord {
            id: VmId::new(),
            name: name.to_string(),
            owner_host: None,
            image: "ubuntu-20.04".into(),
            arch: Arch::X86_64,
            vcpus: 1,
            memory_mib: 1024,
            root_disk_gb: 10,
            vpc: "v1".into(),
            nics: Vec::new(),
            disks: Vec::new(),
            desired_power: desired,
            observed_power: PowerState::Off,
            status: VmStatus::Creating,
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
        fixture
            .store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Absent)
            .unwrap();
        vm.id
    }

    fn load_vm(fixture: &Fixture, id: &VmId) -> VmRecord {
        fixture
            .store
            .get_typed::<VmRecord>(&keys::vm(id))
            .unwrap()
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn create_to_running_end_to_end() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.observed_power, PowerState::On);
        assert_eq!(vm.owner_host, Some(fixture.host.id));
        assert_eq!(
            vm.nics[0].private_ip,
            "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap()
        );
        assert!(vm.ssh_nat_port.is_some());
        assert!(vm.serial_socket.is_some());

        assert_eq!(
            fixture.driver.domain_state_sync("web-1"),
            DomainState::Running
        );
        assert!(fixture
            .driver
            .volume_exists(&paths::root_disk(&fixture.host.vm_root, &vm_id)));

        // Image check precedes domain definition; the firewall chains went
        // out with the first VM.
        let ops = fixture.driver.operations();
        let first_image = ops.iter().position(|o| o == "ensure_image").unwrap();
        let first_define = ops.iter().position(|o| o == "define_domain").unwrap();
        assert!(first_image < first_define);
        assert!(ops.iter().any(|o| o == "apply_iptables"));

        // The allocation is bound, not merely reserved.
        let (alloc, _) = fixture
            .store
            .get_typed::<IpAllocation>(&keys::alloc(
                &IpScope::VpcPrivate("v1".into()),
                &vm.nics[0].private_ip,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.status, AllocationStatus::Bound);
        assert_eq!(alloc.owner, Some(vm_id));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_once_converged() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        let defines_before = fixture
            .driver
            .operations()
            .iter()
            .filter(|o| *o == "define_domain")
            .count();
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        let defines_after = fixture
            .driver
            .operations()
            .iter()
            .filter(|o| *o == "define_domain")
            .count();
        assert_eq!(defines_before, defines_after);

        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fixture = fixture();
        fixture.driver.fail_transient("create_volume", 2);
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        assert_eq!(load_vm(&fixture, &vm_id).status, VmStatus::Running);
    }

    #[tokio::test]
    async fn terminal_create_failure_rolls_back_and_parks() {
        let fixture = fixture();
        fixture.driver.fail_terminal("define_domain");
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);

        let err = fixture.reconciler.reconcile_vm(vm_id).await.unwrap_err();
        assert_eq!(err.code(), "driver_terminal");

        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Error);
        let last = vm.last_error.unwrap();
        assert_eq!(last.code, "driver_terminal");
        assert_eq!(last.step, "define_domain");

        // Root disk created before the failure was cleaned up; the address
        // reservation was released.
        assert!(!fixture
            .driver
            .volume_exists(&paths::root_disk(&fixture.host.vm_root, &vm_id)));
        let (alloc, _) = fixture
            .store
            .get_typed::<IpAllocation>(&keys::alloc(
                &IpScope::VpcPrivate("v1".into()),
                &"10.0.0.2".parse().unwrap(),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.status, AllocationStatus::Released);
    }

    #[tokio::test]
    async fn explicit_retry_after_terminal_failure_reaches_running() {
        let fixture = fixture();
        fixture.driver.fail_terminal("define_domain");
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);

        // First pass parks the VM and rolls the reservation back; the NIC
        // stays on the row.
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap_err();
        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Error);
        let address = vm.nics[0].private_ip;
        let (alloc, _) = fixture
            .store
            .get_typed::<IpAllocation>(&keys::alloc(
                &IpScope::VpcPrivate("v1".into()),
                &address,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.status, AllocationStatus::Released);

        // The user retries via the start endpoint, which resets the error
        // and re-plans.
        fixture.driver.clear_failures();
        let key = keys::vm(&vm_id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.last_error = None;
        vm.transition(VmStatus::Creating);
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Running);
        // The persisted NIC kept its address, and the allocation is live
        // again.
        assert_eq!(vm.nics[0].private_ip, address);
        let (alloc, _) = fixture
            .store
            .get_typed::<IpAllocation>(&keys::alloc(
                &IpScope::VpcPrivate("v1".into()),
                &address,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.status, AllocationStatus::Bound);
        assert_eq!(alloc.owner, Some(vm_id));
    }

    #[tokio::test]
    async fn failed_start_does_not_undefine_the_domain() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::Off);
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        assert_eq!(load_vm(&fixture, &vm_id).status, VmStatus::Stopped);

        // Now ask for power-on but make start fail terminally.
        fixture.driver.fail_terminal("start_domain");
        let key = keys::vm(&vm_id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.desired_power = PowerState::On;
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        let err = fixture.reconciler.reconcile_vm(vm_id).await.unwrap_err();
        assert_eq!(err.code(), "driver_terminal");
        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Error);
        // The domain survives the failed power transition.
        assert_eq!(
            fixture.driver.domain_state_sync("web-1"),
            DomainState::Shutoff
        );
    }

    #[tokio::test]
    async fn stop_flow_reaches_stopped() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        let key = keys::vm(&vm_id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.desired_power = PowerState::Off;
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Stopped);
        assert_eq!(vm.observed_power, PowerState::Off);
        assert_eq!(
            fixture.driver.domain_state_sync("web-1"),
            DomainState::Shutoff
        );
    }

    #[tokio::test]
    async fn resize_applies_offline_and_restarts() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        let key = keys::vm(&vm_id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.pending_resize = Some(ResizeSpec {
            vcpus: 4,
            memory_mib: 4096,
        });
        vm.transition(VmStatus::Resizing);
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();
        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.vcpus, 4);
        assert_eq!(vm.memory_mib, 4096);
        assert!(vm.pending_resize.is_none());
        // Desired power is still on, so the machine came back up.
        assert_eq!(vm.status, VmStatus::Running);
        assert!(fixture
            .driver
            .operations()
            .iter()
            .any(|o| o == "resize_cpu_mem"));
    }

    #[tokio::test]
    async fn terminate_releases_everything_but_keeps_data_disks() {
        let fixture = fixture();
        let vm_id = seed_vm(&fixture, "web-1", PowerState::On);
        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        // Attach a data disk by hand.
        let disk = DiskRecord {
            id: crate::types::DiskId::new(),
            name: "data".into(),
            size_gb: 5,
            backing_path: Some(paths::volume(&fixture.host.vm_root, &crate::types::DiskId::new())),
            host: Some(fixture.host.id),
            status: DiskStatus::InUse,
            attachment: Some((vm_id, "vdb".into())),
            created_at: Utc::now(),
        };
        fixture
            .store
            .put_typed(&keys::disk(&disk.id), &disk, Expected::Absent)
            .unwrap();
        let key = keys::vm(&vm_id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.disks.push(DiskAttachment {
            disk: disk.id,
            slot: "vdb".into(),
        });
        let private_ip = vm.nics[0].private_ip;
        vm.transition(VmStatus::Terminating);
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        fixture.reconciler.reconcile_vm(vm_id).await.unwrap();

        let vm = load_vm(&fixture, &vm_id);
        assert_eq!(vm.status, VmStatus::Terminated);
        assert!(vm.disks.is_empty());
        assert_eq!(
            fixture.driver.domain_state_sync("web-1"),
            DomainState::Absent
        );
        // Root disk gone, data disk row back to available.
        assert!(!fixture
            .driver
            .volume_exists(&paths::root_disk(&fixture.host.vm_root, &vm_id)));
        let (disk, _) = fixture
            .store
            .get_typed::<DiskRecord>(&keys::disk(&disk.id))
            .unwrap()
            .unwrap();
        assert_eq!(disk.status, DiskStatus::Available);
        assert!(disk.attachment.is_none());
        // Address released (grace period applies before reuse).
        let (alloc, _) = fixture
            .store
            .get_typed::<IpAllocation>(&keys::alloc(
                &IpScope::VpcPrivate("v1".into()),
                &private_ip,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(alloc.status, AllocationStatus::Released);
        // NAT rule removed.
        assert!(fixture.driver.nat_rules().is_empty());
    }

    #[tokio::test]
    async fn second_vm_gets_next_address() {
        let fixture = fixture();
        let first = seed_vm(&fixture, "a", PowerState::On);
        let second = seed_vm(&fixture, "b", PowerState::On);
        fixture.reconciler.reconcile_vm(first).await.unwrap();
        fixture.reconciler.reconcile_vm(second).await.unwrap();

        assert_eq!(
            load_vm(&fixture, &first).nics[0].private_ip,
            "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap()
        );
        assert_eq!(
            load_vm(&fixture, &second).nics[0].private_ip,
            "10.0.0.3".parse::<std::net::Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn deterministic_mac_is_stable_and_local() {
        let vm = VmId::new();
        let a = deterministic_mac(&vm);
        let b = deterministic_mac(&vm);
        assert_eq!(a, b);
        assert!(a.starts_with("02:00:"));
        assert_ne!(deterministic_mac(&VmId::new()), a);
    }
}
