//! Live migration coordinator
//!
//! Drives the `prepare -> precopy -> switchover -> finalize` state machine
//! between a source and a destination driver. Every phase change and
//! progress sample is written to the store, so the machine survives a
//! control-plane restart: re-running the coordinator against a persisted
//! record is safe because all driver verbs are idempotent.
//!
//! The owner-host flip happens exactly once, in a single store batch that
//! also clears the `migrating` status. On abort the VM stays on the source
//! unmodified and the destination artifacts created during prepare are torn
//! down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::driver::{
    DomainState, HostDriver, MigrationJobState, MigrationParams, NetworkSpec, VolumeSpec,
};
use crate::error::{KestrelError, KestrelResult};
use crate::paths;
use crate::store::{keys, BatchOp, Expected, Store};
use crate::types::{
    DiskRecord, HostId, HostRecord, MigrationId, MigrationPhase, MigrationRecord, VmId, VmRecord,
    VmStatus, Vpc,
};

/// Parameters of a migration request as accepted by the API
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub destination: HostId,
    pub bandwidth_limit: Option<u64>,
    pub max_downtime_ms: Option<u64>,
    pub compressed: bool,
    /// Disks live on shared storage; skip pre-creating them on the
    /// destination.
    pub shared_storage: bool,
}

pub struct MigrationCoordinator {
    store: Arc<Store>,
    poll_interval: Duration,
}

impl MigrationCoordinator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(store: Arc<Store>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Run one migration to completion or abort. Returns the final record.
    pub async fn run(
        &self,
        vm_id: VmId,
        request: MigrationRequest,
        source: Arc<dyn HostDriver>,
        destination: Arc<dyn HostDriver>,
        mut shutdown: watch::Receiver<bool>,
    ) -> KestrelResult<MigrationRecord> {
        let (vm, _) = self.load_vm(&vm_id)?;
        let source_host = self.load_host(vm.owner_host.as_ref().ok_or_else(|| {
            KestrelError::conflict(format!("vm {}", vm_id), "VM is not placed on any host")
        })?)?;
        let dest_host = self.load_host(&request.destination)?;

        if vm.status != VmStatus::Running {
            return Err(KestrelError::conflict(
                format!("vm {}", vm_id),
                format!("VM must be running to migrate, is {:?}", vm.status),
            ));
        }
        if source_host.id == dest_host.id {
            return Err(KestrelError::validation(
                "destination",
                "source and destination host are the same",
            ));
        }
        if let Some((existing, _)) = self
            .store
            .get_typed::<MigrationRecord>(&keys::migration(&vm_id))?
        {
            if !matches!(
                existing.phase,
                MigrationPhase::Finalize | MigrationPhase::Aborted
            ) {
                return Err(KestrelError::conflict(
                    format!("vm {}", vm_id),
                    "a migration is already in progress",
                ));
            }
        }

        let mut record = MigrationRecord {
            id: MigrationId::new(),
            vm: vm_id,
            source: source_host.id,
            destination: dest_host.id,
            phase: MigrationPhase::Prepare,
            bandwidth_limit: request.bandwidth_limit,
            max_downtime_ms: request.max_downtime_ms,
            compressed: request.compressed,
            progress_percent: 0.0,
            reason: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.save(&record)?;
        self.update_vm(&vm_id, |vm| vm.transition(VmStatus::Migrating))?;

        let outcome = self
            .drive(
                &mut record,
                &vm,
                &dest_host,
                &request,
                &source,
                &destination,
                &mut shutdown,
            )
            .await;

        match outcome {
            Ok(()) => {
                record.phase = MigrationPhase::Finalize;
                record.progress_percent = 100.0;
                record.finished_at = Some(Utc::now());
                self.finalize(&record, &vm, &dest_host)?;
                // Best-effort source cleanup; the domain already stopped
                // when the job completed.
                if let Err(e) = source.undefine_domain(&vm.name).await {
                    tracing::warn!(vm = %vm_id, error = %e, "failed to undefine stale source domain");
                }
                if let Some(nic) = vm.nics.first() {
                    if let Some(port) = vm.ssh_nat_port {
                        let _ = source.unmap_ssh_nat(port, nic.private_ip).await;
                    }
                    if let Some(public) = vm.floating_ip {
                        let _ = source.unmap_floating_ip(public, nic.private_ip).await;
                    }
                }
                tracing::info!(vm = %vm_id, destination = %dest_host.id, "migration finalized");
                Ok(record)
            }
            Err(err) => {
                tracing::warn!(vm = %vm_id, error = %err, "migration aborted");
                let _ = source.cancel_migration(&vm.name).await;
                self.teardown_destination(&vm, &dest_host, &request, &destination)
                    .await;
                record.phase = MigrationPhase::Aborted;
                record.reason = Some(err.to_string());
                record.finished_at = Some(Utc::now());
                self.save(&record)?;
                // The VM never left the source.
                self.update_vm(&vm_id, |vm| vm.transition(VmStatus::Running))?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        record: &mut MigrationRecord,
        vm: &VmRecord,
        dest_host: &HostRecord,
        request: &MigrationRequest,
        source: &Arc<dyn HostDriver>,
        destination: &Arc<dyn HostDriver>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> KestrelResult<()> {
        // Phase 1: prepare the destination. Image, network and NAT must be
        // in place before the hypervisor starts streaming memory.
        self.prepare_destination(vm, dest_host, request, destination)
            .await?;

        // Phase 2: precopy. Kick off the job on the source and poll until
        // the hypervisor reports completion.
        record.phase = MigrationPhase::Precopy;
        self.save(record)?;

        let params = MigrationParams {
            destination_uri: format!(
                "qemu+ssh://{}@{}/system",
                dest_host.ssh_user, dest_host.address
            ),
            bandwidth_limit: request.bandwidth_limit,
            max_downtime_ms: request.max_downtime_ms,
            compressed: request.compressed,
            copy_storage: !request.shared_storage,
        };
        source.begin_migration(&vm.name, &params).await?;

        loop {
            if *shutdown.borrow() {
                return Err(KestrelError::conflict(
                    format!("vm {}", vm.id),
                    "migration cancelled by shutdown",
                ));
            }
            let progress = source.query_migration(&vm.name).await?;
            record.progress_percent = progress.percent();
            self.save(record)?;
            match progress.state {
                MigrationJobState::Active => {}
                MigrationJobState::Completed | MigrationJobState::None => break,
                MigrationJobState::Failed => {
                    return Err(KestrelError::driver_terminal(
                        "begin_migration",
                        "hypervisor reported migration failure",
                    ));
                }
                MigrationJobState::Cancelled => {
                    return Err(KestrelError::conflict(
                        format!("vm {}", vm.id),
                        "migration cancelled on source",
                    ));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Phase 3: switchover. Source and destination drivers are causally
        // ordered through this task; the domain must now be live on the
        // destination.
        record.phase = MigrationPhase::Switchover;
        self.save(record)?;
        match destination.domain_state(&vm.name).await? {
            DomainState::Running => Ok(()),
            other => Err(KestrelError::driver_terminal(
                "query_migration",
                format!("domain not running on destination after switchover: {:?}", other),
            )),
        }
    }

    async fn prepare_destination(
        &self,
        vm: &VmRecord,
        dest_host: &HostRecord,
        request: &MigrationRequest,
        destination: &Arc<dyn HostDriver>,
    ) -> KestrelResult<()> {
        let (vpc, _) = self
            .store
            .get_typed::<Vpc>(&keys::vpc(&vm.vpc))?
            .ok_or_else(|| KestrelError::not_found(format!("vpc {}", vm.vpc)))?;

        let image_path = paths::image(&dest_host.vm_root, &vm.image);
        destination.ensure_image(&image_path, "").await?;

        destination
            .define_network(&NetworkSpec {
                bridge: vpc.chain.clone(),
                gateway_cidr: format!("{}/{}", vpc.gateway, vpc.cidr.prefix_len()),
                mtu: vpc.mtu,
            })
            .await?;

        if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
            destination.map_ssh_nat(port, nic.private_ip).await?;
        }
        if let (Some(public), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
            destination.map_floating_ip(public, nic.private_ip).await?;
        }

        if !request.shared_storage {
            destination
                .create_volume(&VolumeSpec {
                    path: paths::root_disk(&dest_host.vm_root, &vm.id),
                    size_gb: vm.root_disk_gb,
                    backing: Some(image_path),
                })
                .await?;
            for attachment in &vm.disks {
                let (disk, _) = self
                    .store
                    .get_typed::<DiskRecord>(&keys::disk(&attachment.disk))?
                    .ok_or_else(|| {
                        KestrelError::not_found(format!("disk {}", attachment.disk))
                    })?;
                destination
                    .create_volume(&VolumeSpec {
                        path: paths::volume(&dest_host.vm_root, &disk.id),
                        size_gb: disk.size_gb,
                        backing: None,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove everything prepare created on the destination. Best effort;
    /// leftovers are tagged for the orphan sweeper by the reconciler.
    async fn teardown_destination(
        &self,
        vm: &VmRecord,
        dest_host: &HostRecord,
        request: &MigrationRequest,
        destination: &Arc<dyn HostDriver>,
    ) {
        if !request.shared_storage {
            let _ = destination
                .delete_volume(&paths::root_disk(&dest_host.vm_root, &vm.id))
                .await;
            for attachment in &vm.disks {
                let _ = destination
                    .delete_volume(&paths::volume(&dest_host.vm_root, &attachment.disk))
                    .await;
            }
        }
        if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
            let _ = destination.unmap_ssh_nat(port, nic.private_ip).await;
        }
        if let (Some(public), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
            let _ = destination.unmap_floating_ip(public, nic.private_ip).await;
        }
        // The bridge may carry other VMs of the same VPC; it is left in
        // place.
    }

    /// The owner-host flip: one batch updates the VM row (owner, status,
    /// generation) and the migration record together.
    fn finalize(
        &self,
        record: &MigrationRecord,
        vm_before: &VmRecord,
        dest_host: &HostRecord,
    ) -> KestrelResult<()> {
        let key = keys::vm(&vm_before.id);
        let (mut vm, rev) = self
            .store
            .get_typed::<VmRecord>(&key)?
            .ok_or_else(|| KestrelError::not_found(format!("vm {}", vm_before.id)))?;
        vm.owner_host = Some(dest_host.id);
        vm.serial_socket = Some(paths::serial_socket(&dest_host.vm_root, &vm.id));
        vm.transition(VmStatus::Running);
        self.store.batch(vec![
            BatchOp::put_typed(key, &vm, Expected::Rev(rev))?,
            BatchOp::put_typed(keys::migration(&vm.id), record, Expected::Any)?,
        ])?;
        Ok(())
    }

    fn save(&self, record: &MigrationRecord) -> KestrelResult<()> {
        self.store
            .put_typed(&keys::migration(&record.vm), record, Expected::Any)?;
        Ok(())
    }

    fn load_vm(&self, id: &VmId) -> KestrelResult<(VmRecord, u64)> {
        self.store
            .get_typed::<VmRecord>(&keys::vm(id))?
            .ok_or_else(|| KestrelError::not_found(format!("vm {}", id)))
    }

    fn load_host(&self, id: &HostId) -> KestrelResult<HostRecord> {
        self.store
            .get_typed::<HostRecord>(&keys::host(id))?
            .map(|(host, _)| host)
            .ok_or_else(|| KestrelError::not_found(format!("host {}", id)))
    }

    fn update_vm(
        &self,
        id: &VmId,
        mutate: impl FnOnce(&mut VmRecord),
    ) -> KestrelResult<()> {
        let key = keys::vm(id);
        let (mut vm, rev) = self.load_vm(id)?;
        mutate(&mut vm);
        self.store.put_typed(&key, &vm, Expected::Rev(rev))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::types::{Arch, HostCapacity, HostHealth, NicRecord, PowerState};
    use ipnet::Ipv4Net;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        vm: VmRecord,
        source_host: HostRecord,
        dest_host: HostRecord,
        source: Arc<MockDriver>,
        dest: Arc<MockDriver>,
    }

    fn host(address: &str) -> HostRecord {
        HostRecord {
            id: HostId::new(),
            address: address.to_string(),
            arch: Arch::X86_64,
            ssh_user: "root".into(),
            ssh_identity: None,
            capacity: HostCapacity {
                vcpus: 16,
                memory_mib: 32768,
                disk_bytes: 1 << 40,
            },
            health: HostHealth::Ready,
            last_heartbeat: Some(Utc::now()),
            vm_root: "/var/lib/kestrel".into(),
            registered_at: Utc::now(),
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("mig.redb")).unwrap());

        let vpc = Vpc::new("v1".into(), "10.0.0.0/24".parse::<Ipv4Net>().unwrap(), 1500);
        store
            .put_typed(&keys::vpc("v1"), &vpc, Expected::Absent)
            .unwrap();

        let source_host = host("198.51.100.1");
        let dest_host = host("198.51.100.2");
        store
            .put_typed(&keys::host(&source_host.id), &source_host, Expected::Absent)
            .unwrap();
        store
            .put_typed(&keys::host(&dest_host.id), &dest_host, Expected::Absent)
            .unwrap();

        let vm = VmRecord {
            id: VmId::new(),
            name: "web-1".into(),
            owner_host: Some(source_host.id),
            image: "ubuntu-20.04".into(),
            arch: Arch::X86_64,
            vcpus: 2,
            memory_mib: 2048,
            root_disk_gb: 10,
            vpc: "v1".into(),
            nics: vec![NicRecord {
                mac: "02:00:00:aa:bb:cc".into(),
                private_ip: "10.0.0.2".parse().unwrap(),
                subnet: None,
                bridge: vpc.chain.clone(),
            }],
            disks: Vec::new(),
            desired_power: PowerState::On,
            observed_power: PowerState::On,
            status: VmStatus::Running,
            cloud_init: None,
            floating_ip: None,
            ssh_nat_port: Some(22201),
            vnc_port: Some(5901),
            serial_socket: Some(paths::serial_socket(&source_host.vm_root, &VmId::new())),
            pending_resize: None,
            anti_affinity: None,
            client_token: None,
            generation: 3,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .put_typed(&keys::vm(&vm.id), &vm, Expected::Absent)
            .unwrap();

        let source = Arc::new(MockDriver::new(Arch::X86_64));
        let dest = Arc::new(MockDriver::new(Arch::X86_64));
        dest.seed_image(&paths::image(&dest_host.vm_root, "ubuntu-20.04"));

        // Domain live on the source.
        let spec = crate::driver::DomainSpec {
            vm: vm.id,
            name: vm.name.clone(),
            arch: Arch::X86_64,
            vcpus: vm.vcpus,
            memory_mib: vm.memory_mib,
            root_disk: paths::root_disk(&source_host.vm_root, &vm.id),
            extra_disks: Vec::new(),
            cidata_iso: None,
            nic: None,
            serial_socket: paths::serial_socket(&source_host.vm_root, &vm.id),
            vnc_port: 5901,
        };
        source.define_domain(&spec).await.unwrap();
        source.start_domain(&vm.name).await.unwrap();
        // After the hypervisor job completes, the domain is live on the
        // destination.
        dest.define_domain(&spec).await.unwrap();
        dest.start_domain(&vm.name).await.unwrap();

        Fixture {
            _dir: dir,
            store,
            vm,
            source_host,
            dest_host,
            source,
            dest,
        }
    }

    fn request(fixture: &Fixture) -> MigrationRequest {
        MigrationRequest {
            destination: fixture.dest_host.id,
            bandwidth_limit: Some(100 << 20),
            max_downtime_ms: Some(300),
            compressed: true,
            shared_storage: false,
        }
    }

    #[tokio::test]
    async fn successful_migration_flips_owner_exactly_once() {
        let fixture = fixture().await;
        let coordinator = MigrationCoordinator::with_poll_interval(
            fixture.store.clone(),
            Duration::from_millis(1),
        );
        let (_tx, shutdown) = watch::channel(false);

        // Track phases and owner flips as they land in the store.
        let mut watch_stream = fixture.store.watch(keys::MIGRATION_PREFIX, 0).unwrap();

        let record = coordinator
            .run(
                fixture.vm.id,
                request(&fixture),
                fixture.source.clone(),
                fixture.dest.clone(),
                shutdown,
            )
            .await
            .unwrap();

        assert_eq!(record.phase, MigrationPhase::Finalize);
        assert_eq!(record.progress_percent, 100.0);
        assert!(record.finished_at.is_some());

        let (vm, _) = fixture
            .store
            .get_typed::<VmRecord>(&keys::vm(&fixture.vm.id))
            .unwrap()
            .unwrap();
        assert_eq!(vm.owner_host, Some(fixture.dest_host.id));
        assert_eq!(vm.status, VmStatus::Running);

        // Phase sequence as persisted: prepare, precopy (n samples),
        // switchover, finalize — strictly in order, owner flipping once.
        let mut phases = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), watch_stream.recv()).await
        {
            if let Some(value) = event.value {
                let r: MigrationRecord = bincode::deserialize(&value).unwrap();
                if phases.last() != Some(&r.phase) {
                    phases.push(r.phase);
                }
            }
        }
        assert_eq!(
            phases,
            vec![
                MigrationPhase::Prepare,
                MigrationPhase::Precopy,
                MigrationPhase::Switchover,
                MigrationPhase::Finalize,
            ]
        );

        // Stale source domain removed.
        assert_eq!(
            fixture.source.domain_state_sync(&fixture.vm.name),
            DomainState::Absent
        );
        // Destination was prepared: image check, network, NAT, volume.
        let ops = fixture.dest.operations();
        assert!(ops.iter().any(|o| o == "ensure_image"));
        assert!(ops.iter().any(|o| o == "define_network"));
        assert!(ops.iter().any(|o| o == "map_ssh_nat"));
        assert!(ops.iter().any(|o| o == "create_volume"));
    }

    #[tokio::test]
    async fn abort_leaves_vm_on_source_and_tears_down_destination() {
        let fixture = fixture().await;
        let coordinator = MigrationCoordinator::with_poll_interval(
            fixture.store.clone(),
            Duration::from_millis(1),
        );
        let (_tx, shutdown) = watch::channel(false);

        fixture.source.fail_terminal("begin_migration");

        let err = coordinator
            .run(
                fixture.vm.id,
                request(&fixture),
                fixture.source.clone(),
                fixture.dest.clone(),
                shutdown,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "driver_terminal");

        let (vm, _) = fixture
            .store
            .get_typed::<VmRecord>(&keys::vm(&fixture.vm.id))
            .unwrap()
            .unwrap();
        assert_eq!(vm.owner_host, Some(fixture.source_host.id));
        assert_eq!(vm.status, VmStatus::Running);

        let (record, _) = fixture
            .store
            .get_typed::<MigrationRecord>(&keys::migration(&fixture.vm.id))
            .unwrap()
            .unwrap();
        assert_eq!(record.phase, MigrationPhase::Aborted);
        assert!(record.reason.is_some());

        // Pre-created destination volume cleaned up.
        assert!(!fixture
            .dest
            .volume_exists(&paths::root_disk(&fixture.dest_host.vm_root, &fixture.vm.id)));
    }

    #[tokio::test]
    async fn second_migration_while_active_conflicts() {
        let fixture = fixture().await;
        let coordinator = MigrationCoordinator::with_poll_interval(
            fixture.store.clone(),
            Duration::from_millis(1),
        );

        // Simulate an in-flight record.
        let active = MigrationRecord {
            id: MigrationId::new(),
            vm: fixture.vm.id,
            source: fixture.source_host.id,
            destination: fixture.dest_host.id,
            phase: MigrationPhase::Precopy,
            bandwidth_limit: None,
            max_downtime_ms: None,
            compressed: false,
            progress_percent: 30.0,
            reason: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        fixture
            .store
            .put_typed(&keys::migration(&fixture.vm.id), &active, Expected::Any)
            .unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let err = coordinator
            .run(
                fixture.vm.id,
                request(&fixture),
                fixture.source.clone(),
                fixture.dest.clone(),
                shutdown,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn migration_of_stopped_vm_is_refused() {
        let fixture = fixture().await;
        let key = keys::vm(&fixture.vm.id);
        let (mut vm, rev) = fixture
            .store
            .get_typed::<VmRecord>(&key)
            .unwrap()
            .unwrap();
        vm.transition(VmStatus::Stopped);
        fixture
            .store
            .put_typed(&key, &vm, Expected::Rev(rev))
            .unwrap();

        let coordinator = MigrationCoordinator::new(fixture.store.clone());
        let (_tx, shutdown) = watch::channel(false);
        let err = coordinator
            .run(
                fixture.vm.id,
                request(&fixture),
                fixture.source.clone(),
                fixture.dest.clone(),
                shutdown,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }
}
