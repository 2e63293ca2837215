//! VM placement
//!
//! Pure decision logic over a snapshot of hosts and current placements.
//! Filters: host health, architecture, image availability, and remaining
//! capacity after a reserved headroom. Ranking: mean of free vCPU and free
//! memory ratios, descending; ties broken by fewest active VMs, then host id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{KestrelError, KestrelResult};
use crate::types::{Arch, HostHealth, HostId, HostRecord, ImageRecord, VmRecord, VmStatus};

/// Fraction of host capacity kept free for spikes and host processes.
const RESERVED_HEADROOM: f64 = 0.10;

/// What the scheduler needs to know about the VM being placed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub arch: Arch,
    pub image: String,
    pub anti_affinity: Option<String>,
}

impl From<&VmRecord> for ScheduleRequest {
    fn from(vm: &VmRecord) -> Self {
        Self {
            vcpus: vm.vcpus,
            memory_mib: vm.memory_mib,
            arch: vm.arch,
            image: vm.image.clone(),
            anti_affinity: vm.anti_affinity.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HostLoad {
    used_vcpus: u32,
    used_memory_mib: u64,
    active_vms: u32,
}

/// Pick a host for the request, or fail with `exhausted`.
///
/// `placements` must contain every non-terminated VM row; the image record
/// is the one resolved for `request.image`. An image with no recorded hosts
/// is treated as fetch-on-demand and does not restrict placement.
pub fn schedule(
    request: &ScheduleRequest,
    hosts: &[HostRecord],
    placements: &[VmRecord],
    image: &ImageRecord,
) -> KestrelResult<HostId> {
    let mut loads: HashMap<HostId, HostLoad> = HashMap::new();
    for vm in placements {
        if vm.status == VmStatus::Terminated {
            continue;
        }
        let Some(host) = vm.owner_host else { continue };
        let load = loads.entry(host).or_insert(HostLoad {
            used_vcpus: 0,
            used_memory_mib: 0,
            active_vms: 0,
        });
        load.used_vcpus += vm.vcpus;
        load.used_memory_mib += vm.memory_mib;
        load.active_vms += 1;
    }

    let empty = HostLoad {
        used_vcpus: 0,
        used_memory_mib: 0,
        active_vms: 0,
    };
    let eligible: Vec<&HostRecord> = hosts
        .iter()
        .filter(|host| host.health == HostHealth::Ready)
        .filter(|host| host.arch == request.arch)
        .filter(|host| image.hosts.is_empty() || image.present_on(&host.id))
        .filter(|host| {
            let load = loads.get(&host.id).unwrap_or(&empty);
            fits(request, host, load)
        })
        .collect();

    if eligible.is_empty() {
        return Err(KestrelError::Exhausted {
            resource: format!(
                "no schedulable host for arch {} with {} vcpus / {} MiB",
                request.arch, request.vcpus, request.memory_mib
            ),
        });
    }

    // Anti-affinity: VMs sharing a tag must not co-locate. When every
    // otherwise-eligible host already carries the tag, the request fails
    // rather than doubling up.
    let candidates: Vec<&HostRecord> = match &request.anti_affinity {
        None => eligible,
        Some(tag) => {
            let tagged_hosts: Vec<HostId> = placements
                .iter()
                .filter(|vm| !vm.status.is_terminated())
                .filter(|vm| vm.anti_affinity.as_deref() == Some(tag.as_str()))
                .filter_map(|vm| vm.owner_host)
                .collect();
            let remaining: Vec<&HostRecord> = eligible
                .iter()
                .copied()
                .filter(|host| !tagged_hosts.contains(&host.id))
                .collect();
            if remaining.is_empty() {
                return Err(KestrelError::InsufficientCapacity {
                    message: format!(
                        "anti-affinity group '{}' already present on every eligible host",
                        tag
                    ),
                });
            }
            remaining
        }
    };

    let mut ranked: Vec<(&HostRecord, f64, u32)> = candidates
        .into_iter()
        .map(|host| {
            let load = loads.get(&host.id).unwrap_or(&empty);
            (host, availability_score(host, load), load.active_vms)
        })
        .collect();
    ranked.sort_by(|(host_a, score_a, vms_a), (host_b, score_b, vms_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(vms_a.cmp(vms_b))
            .then(host_a.id.to_string().cmp(&host_b.id.to_string()))
    });

    Ok(ranked[0].0.id)
}

fn fits(request: &ScheduleRequest, host: &HostRecord, load: &HostLoad) -> bool {
    let usable_vcpus = (host.capacity.vcpus as f64 * (1.0 - RESERVED_HEADROOM)).floor() as u32;
    let usable_memory = (host.capacity.memory_mib as f64 * (1.0 - RESERVED_HEADROOM)).floor() as u64;
    load.used_vcpus + request.vcpus <= usable_vcpus
        && load.used_memory_mib + request.memory_mib <= usable_memory
}

fn availability_score(host: &HostRecord, load: &HostLoad) -> f64 {
    let free_vcpu = 1.0 - load.used_vcpus as f64 / host.capacity.vcpus.max(1) as f64;
    let free_mem = 1.0 - load.used_memory_mib as f64 / host.capacity.memory_mib.max(1) as f64;
    (free_vcpu + free_mem) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HostCapacity, PowerState, VmId};
    use chrono::Utc;

    fn host(vcpus: u32, memory_mib: u64, arch: Arch) -> HostRecord {
        HostRecord {
            id: HostId::new(),
            address: format!("198.51.100.{}", vcpus),
            arch,
            ssh_user: "root".into(),
            ssh_identity: None,
            capacity: HostCapacity {
                vcpus,
                memory_mib,
                disk_bytes: 1 << 40,
            },
            health: HostHealth::Ready,
            last_heartbeat: Some(Utc::now()),
            vm_root: "/var/lib/kestrel".into(),
            registered_at: Utc::now(),
        }
    }

    fn placed_vm(host: HostId, vcpus: u32, memory_mib: u64, tag: Option<&str>) -> VmRecord {
        VmRecord {
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
            observed_power: PowerState::On,
            status: VmStatus::Running,
            cloud_init: None,
            floating_ip: None,
            ssh_nat_port: None,
            vnc_port: None,
            serial_socket: None,
            pending_resize: None,
            anti_affinity: tag.map(String::from),
            client_token: None,
            generation: 1,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn image_everywhere() -> ImageRecord {
        ImageRecord {
            id: "ubuntu-20.04".into(),
            name: "Ubuntu 20.04 LTS".into(),
            arch: Arch::X86_64,
            sha256: "0".repeat(64),
            hosts: Vec::new(),
        }
    }

    fn request(vcpus: u32, memory_mib: u64) -> ScheduleRequest {
        ScheduleRequest {
            vcpus,
            memory_mib,
            arch: Arch::X86_64,
            image: "ubuntu-20.04".into(),
            anti_affinity: None,
        }
    }

    #[test]
    fn picks_the_emptiest_host() {
        let busy = host(16, 32768, Arch::X86_64);
        let idle = host(16, 32768, Arch::X86_64);
        let placements = vec![placed_vm(busy.id, 8, 16384, None)];

        let picked = schedule(
            &request(2, 2048),
            &[busy.clone(), idle.clone()],
            &placements,
            &image_everywhere(),
        )
        .unwrap();
        assert_eq!(picked, idle.id);
    }

    #[test]
    fn unschedulable_when_nothing_fits() {
        let small = host(2, 2048, Arch::X86_64);
        let err = schedule(&request(4, 8192), &[small], &[], &image_everywhere()).unwrap_err();
        assert_eq!(err.code(), "exhausted");
    }

    #[test]
    fn arch_mismatch_is_unschedulable() {
        let arm = host(16, 32768, Arch::Aarch64);
        let err = schedule(&request(1, 1024), &[arm], &[], &image_everywhere()).unwrap_err();
        assert_eq!(err.code(), "exhausted");
    }

    #[test]
    fn image_presence_filters_hosts() {
        let with_image = host(16, 32768, Arch::X86_64);
        let without = host(32, 65536, Arch::X86_64);
        let mut image = image_everywhere();
        image.hosts = vec![with_image.id];

        // `without` ranks higher on capacity but lacks the image.
        let picked = schedule(
            &request(1, 1024),
            &[with_image.clone(), without],
            &[],
            &image,
        )
        .unwrap();
        assert_eq!(picked, with_image.id);
    }

    #[test]
    fn headroom_is_reserved() {
        let h = host(10, 10240, Arch::X86_64);
        // 10% headroom leaves 9 usable vcpus.
        assert!(schedule(&request(9, 1024), &[h.clone()], &[], &image_everywhere()).is_ok());
        let err = schedule(&request(10, 1024), &[h], &[], &image_everywhere()).unwrap_err();
        assert_eq!(err.code(), "exhausted");
    }

    #[test]
    fn down_hosts_are_skipped() {
        let mut down = host(16, 32768, Arch::X86_64);
        down.health = HostHealth::Down;
        let err = schedule(&request(1, 1024), &[down], &[], &image_everywhere()).unwrap_err();
        assert_eq!(err.code(), "exhausted");
    }

    #[test]
    fn anti_affinity_spreads_and_then_fails() {
        let h1 = host(16, 32768, Arch::X86_64);
        let h2 = host(16, 32768, Arch::X86_64);
        let placements = vec![placed_vm(h1.id, 1, 1024, Some("web"))];

        let mut req = request(1, 1024);
        req.anti_affinity = Some("web".into());

        let picked = schedule(&req, &[h1.clone(), h2.clone()], &placements, &image_everywhere())
            .unwrap();
        assert_eq!(picked, h2.id);

        // Both hosts now carry the tag: placement must fail rather than
        // co-locate.
        let placements = vec![
            placed_vm(h1.id, 1, 1024, Some("web")),
            placed_vm(h2.id, 1, 1024, Some("web")),
        ];
        let err = schedule(&req, &[h1, h2], &placements, &image_everywhere()).unwrap_err();
        assert_eq!(err.code(), "exhausted");
        assert!(err.to_string().contains("anti-affinity"));
    }

    #[test]
    fn ties_break_by_vm_count_then_id() {
        let h1 = host(16, 32768, Arch::X86_64);
        let h2 = host(16, 32768, Arch::X86_64);
        // Equal scores, h1 has one stopped-but-placed VM with zero footprint
        // counted; give it a tiny VM so counts differ while scores stay close.
        let placements = vec![placed_vm(h1.id, 0, 0, None)];
        let picked = schedule(
            &request(1, 1024),
            &[h1.clone(), h2.clone()],
            &placements,
            &image_everywhere(),
        )
        .unwrap();
        assert_eq!(picked, h2.id);

        // No placements at all: lexicographically smaller id wins.
        let picked = schedule(&request(1, 1024), &[h1.clone(), h2.clone()], &[], &image_everywhere())
            .unwrap();
        let expected = if h1.id.to_string() < h2.id.to_string() {
            h1.id
        } else {
            h2.id
        };
        assert_eq!(picked, expected);
    }
}
