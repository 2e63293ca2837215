//! libvirt domain XML rendering
//!
//! One function, two firmware profiles: x86_64 boots SeaBIOS on the q35
//! machine type, aarch64 boots UEFI (AAVMF) on the virt machine type with
//! GICv3. The NIC hangs off the VPC bridge with its deterministic MAC, the
//! serial console is a UNIX socket at a known path, and the cloud-init seed
//! rides along as a read-only cdrom.

use kestrel_core::driver::DomainSpec;
use kestrel_core::types::Arch;

const AAVMF_CODE: &str = "/usr/share/AAVMF/AAVMF_CODE.fd";

pub fn render(spec: &DomainSpec) -> String {
    let mut xml = String::with_capacity(4096);
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", escape(&spec.name)));
    xml.push_str(&format!("  <title>VM {}</title>\n", escape(&spec.name)));
    xml.push_str(&format!(
        "  <metadata>\n    <kestrel:vm xmlns:kestrel='https://kestrel.dev/xmlns/vm'>{}</kestrel:vm>\n  </metadata>\n",
        spec.vm
    ));
    xml.push_str(&format!(
        "  <memory unit='MiB'>{}</memory>\n  <currentMemory unit='MiB'>{}</currentMemory>\n",
        spec.memory_mib, spec.memory_mib
    ));
    xml.push_str(&format!(
        "  <vcpu placement='static'>{}</vcpu>\n",
        spec.vcpus
    ));

    match spec.arch {
        Arch::X86_64 => {
            xml.push_str("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
            xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
            xml.push_str("  <cpu mode='host-passthrough'/>\n");
        }
        Arch::Aarch64 => {
            xml.push_str("  <os>\n    <type arch='aarch64' machine='virt'>hvm</type>\n");
            xml.push_str(&format!(
                "    <loader readonly='yes' type='pflash'>{}</loader>\n",
                AAVMF_CODE
            ));
            xml.push_str("    <boot dev='hd'/>\n  </os>\n");
            xml.push_str("  <features>\n    <acpi/>\n    <gic version='3'/>\n  </features>\n");
            xml.push_str("  <cpu mode='host-passthrough'/>\n");
        }
    }

    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");
    xml.push_str("  <devices>\n");

    // Root disk, then any data volumes, then the cloud-init seed.
    xml.push_str(&disk_xml(&spec.root_disk, "vda"));
    for (slot, path) in &spec.extra_disks {
        xml.push_str(&disk_xml(path, slot));
    }
    if let Some(iso) = &spec.cidata_iso {
        xml.push_str(&format!(
            "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='sda' bus='sata'/>\n      <readonly/>\n    </disk>\n",
            escape(iso)
        ));
    }

    if let Some(nic) = &spec.nic {
        xml.push_str(&format!(
            "    <interface type='bridge'>\n      <source bridge='{}'/>\n      <mac address='{}'/>\n      <model type='virtio'/>\n    </interface>\n",
            escape(&nic.bridge),
            escape(&nic.mac)
        ));
    }

    xml.push_str(&format!(
        "    <serial type='unix'>\n      <source mode='bind' path='{}'/>\n      <target port='0'/>\n    </serial>\n",
        escape(&spec.serial_socket)
    ));
    xml.push_str(&format!(
        "    <console type='unix'>\n      <source mode='bind' path='{}'/>\n      <target type='serial' port='0'/>\n    </console>\n",
        escape(&spec.serial_socket)
    ));
    xml.push_str(&format!(
        "    <graphics type='vnc' port='{}' listen='0.0.0.0'/>\n",
        spec.vnc_port
    ));
    xml.push_str("    <video>\n      <model type='virtio' heads='1'/>\n    </video>\n");
    xml.push_str("    <memballoon model='virtio'/>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

fn disk_xml(path: &str, slot: &str) -> String {
    format!(
        "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='{}' bus='virtio'/>\n    </disk>\n",
        escape(path),
        slot
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::driver::NicSpec;
    use kestrel_core::types::VmId;

    fn spec(arch: Arch) -> DomainSpec {
        DomainSpec {
            vm: VmId::new(),
            name: "web-1".into(),
            arch,
            vcpus: 2,
            memory_mib: 2048,
            root_disk: "/var/lib/kestrel/disks/a.qcow2".into(),
            extra_disks: vec![("vdb".into(), "/var/lib/kestrel/volumes/d.qcow2".into())],
            cidata_iso: Some("/var/lib/kestrel/disks/a-cidata.iso".into()),
            nic: Some(NicSpec {
                bridge: "kbr-1a2b3c4d".into(),
                mac: "02:00:aa:bb:cc:dd".into(),
                ip: "10.0.0.2".parse().unwrap(),
            }),
            serial_socket: "/var/lib/kestrel/consoles/a.sock".into(),
            vnc_port: 5901,
        }
    }

    #[test]
    fn x86_64_uses_q35_without_pflash() {
        let xml = render(&spec(Arch::X86_64));
        assert!(xml.contains("arch='x86_64' machine='q35'"));
        assert!(!xml.contains("pflash"));
        assert!(xml.contains("<apic/>"));
    }

    #[test]
    fn aarch64_uses_uefi_and_gicv3() {
        let xml = render(&spec(Arch::Aarch64));
        assert!(xml.contains("arch='aarch64' machine='virt'"));
        assert!(xml.contains(AAVMF_CODE));
        assert!(xml.contains("<gic version='3'/>"));
    }

    #[test]
    fn devices_are_wired_to_the_spec() {
        let s = spec(Arch::X86_64);
        let xml = render(&s);
        assert!(xml.contains("source bridge='kbr-1a2b3c4d'"));
        assert!(xml.contains("mac address='02:00:aa:bb:cc:dd'"));
        assert!(xml.contains("path='/var/lib/kestrel/consoles/a.sock'"));
        assert!(xml.contains("graphics type='vnc' port='5901'"));
        assert!(xml.contains("target dev='vda'"));
        assert!(xml.contains("target dev='vdb'"));
        assert!(xml.contains("device='cdrom'"));
    }

    #[test]
    fn names_are_xml_escaped() {
        let mut s = spec(Arch::X86_64);
        s.name = "a<b&c".into();
        let xml = render(&s);
        assert!(xml.contains("<name>a&lt;b&amp;c</name>"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let s = spec(Arch::X86_64);
        assert_eq!(render(&s), render(&s));
    }
}
