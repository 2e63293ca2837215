//! Per-host workspace layout
//!
//! Every host keeps its VM artifacts under one root:
//! `<vm_root>/{images,disks,volumes,consoles}`. Root disks are named by VM
//! id, volumes by disk id, so paths are derivable from the store rows alone
//! and identical on every host — which is what lets migration pre-create
//! matching artifacts on the destination.

use crate::types::{DiskId, VmId};

pub fn image(vm_root: &str, image_id: &str) -> String {
    format!("{}/images/{}.qcow2", vm_root, image_id)
}

pub fn root_disk(vm_root: &str, vm: &VmId) -> String {
    format!("{}/disks/{}.qcow2", vm_root, vm)
}

pub fn volume(vm_root: &str, disk: &DiskId) -> String {
    format!("{}/volumes/{}.qcow2", vm_root, disk)
}

pub fn cidata_iso(vm_root: &str, vm: &VmId) -> String {
    format!("{}/disks/{}-cidata.iso", vm_root, vm)
}

pub fn serial_socket(vm_root: &str, vm: &VmId) -> String {
    format!("{}/consoles/{}.sock", vm_root, vm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_derivable_from_ids() {
        let vm = VmId::new();
        let disk = DiskId::new();
        assert_eq!(
            root_disk("/var/lib/kestrel", &vm),
            format!("/var/lib/kestrel/disks/{}.qcow2", vm)
        );
        assert_eq!(
            volume("/var/lib/kestrel", &disk),
            format!("/var/lib/kestrel/volumes/{}.qcow2", disk)
        );
        assert!(cidata_iso("/r", &vm).ends_with("-cidata.iso"));
    }
}
