//! Cloud-init seed rendering
//!
//! Renders `user-data` and `meta-data` from the recognized option set. The
//! option set is closed: the API boundary rejects unknown keys, so this
//! module only ever sees the fields below. Static network configuration for
//! the NIC is appended so guests come up on their allocated address without
//! DHCP on the VPC bridge.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use kestrel_core::driver::CloudInitSpec;
use kestrel_core::types::CloudInitDoc;

pub fn render_meta_data(spec: &CloudInitSpec) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        spec.instance_id, spec.hostname
    )
}

pub fn render_user_data(spec: &CloudInitSpec) -> String {
    let doc: &CloudInitDoc = &spec.doc;
    let mut out = String::from("#cloud-config\n");
    let _ = writeln!(out, "hostname: {}", spec.hostname);

    if !doc.users.is_empty() {
        out.push_str("users:\n");
        for user in &doc.users {
            let _ = writeln!(out, "  - name: {}", user.name);
            if let Some(sudo) = &user.sudo {
                let _ = writeln!(out, "    sudo: {}", yaml_quote(sudo));
            }
            if let Some(shell) = &user.shell {
                let _ = writeln!(out, "    shell: {}", shell);
            }
            if !user.ssh_authorized_keys.is_empty() {
                out.push_str("    ssh_authorized_keys:\n");
                for key in &user.ssh_authorized_keys {
                    let _ = writeln!(out, "      - {}", key);
                }
            }
        }
    }

    if !doc.packages.is_empty() {
        out.push_str("packages:\n");
        for package in &doc.packages {
            let _ = writeln!(out, "  - {}", package);
        }
    }

    if !doc.write_files.is_empty() {
        out.push_str("write_files:\n");
        for file in &doc.write_files {
            let _ = writeln!(out, "  - path: {}", file.path);
            out.push_str("    content: |\n");
            for line in file.content.lines() {
                let _ = writeln!(out, "      {}", line);
            }
            if let Some(permissions) = &file.permissions {
                let _ = writeln!(out, "    permissions: {}", yaml_quote(permissions));
            }
            if let Some(owner) = &file.owner {
                let _ = writeln!(out, "    owner: {}", owner);
            }
        }
    }

    if let Some(timezone) = &doc.timezone {
        let _ = writeln!(out, "timezone: {}", timezone);
    }

    if !doc.apt_sources.is_empty() {
        out.push_str("apt:\n  sources:\n");
        for (name, source) in &doc.apt_sources {
            let _ = writeln!(out, "    {}:", name);
            let _ = writeln!(out, "      source: {}", yaml_quote(&source.source));
            if let Some(keyid) = &source.keyid {
                let _ = writeln!(out, "      keyid: {}", keyid);
            }
        }
    }

    if !doc.runcmd.is_empty() {
        out.push_str("runcmd:\n");
        for command in &doc.runcmd {
            let _ = writeln!(out, "  - {}", yaml_quote(command));
        }
    }

    out
}

/// Static guest network config for the allocated address.
pub fn render_network_config(ip: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr) -> String {
    let mut out = String::from("version: 2\nethernets:\n  enp1s0:\n");
    let _ = writeln!(out, "    addresses: [{}/{}]", ip, prefix_len);
    let _ = writeln!(out, "    gateway4: {}", gateway);
    out.push_str("    nameservers:\n      addresses: [8.8.8.8, 8.8.4.4]\n");
    out
}

fn yaml_quote(raw: &str) -> String {
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./ ".contains(c))
    {
        raw.to_string()
    } else {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::types::{AptSource, CloudInitUser, WriteFile};
    use std::collections::BTreeMap;

    fn spec(doc: CloudInitDoc) -> CloudInitSpec {
        CloudInitSpec {
            instance_id: "01J0000000000000000000TEST".into(),
            hostname: "web-1".into(),
            doc,
            ip: Some("10.0.0.2".parse().unwrap()),
            gateway: Some("10.0.0.1".parse().unwrap()),
            prefix_len: Some(24),
            iso_path: "/var/lib/kestrel/disks/x-cidata.iso".into(),
        }
    }

    #[test]
    fn meta_data_carries_instance_identity() {
        let rendered = render_meta_data(&spec(CloudInitDoc::default()));
        assert!(rendered.contains("instance-id: 01J0000000000000000000TEST"));
        assert!(rendered.contains("local-hostname: web-1"));
    }

    #[test]
    fn user_data_renders_the_full_option_set() {
        let mut apt = BTreeMap::new();
        apt.insert(
            "docker".to_string(),
            AptSource {
                source: "deb https://download.docker.com/linux/ubuntu focal stable".into(),
                keyid: Some("9DC858229FC7DD38854AE2D88D81803C0EBFCD88".into()),
            },
        );
        let doc = CloudInitDoc {
            hostname: Some("web-1".into()),
            users: vec![CloudInitUser {
                name: "ubuntu".into(),
                sudo: Some("ALL=(ALL) NOPASSWD:ALL".into()),
                shell: Some("/bin/bash".into()),
                ssh_authorized_keys: vec!["ssh-ed25519 AAAA test".into()],
            }],
            packages: vec!["nginx".into(), "qemu-guest-agent".into()],
            runcmd: vec!["systemctl enable nginx".into(), "systemctl start nginx".into()],
            write_files: vec![WriteFile {
                path: "/etc/motd".into(),
                content: "hello\nworld".into(),
                permissions: Some("0644".into()),
                owner: Some("root:root".into()),
            }],
            timezone: Some("UTC".into()),
            apt_sources: apt,
        };
        let rendered = render_user_data(&spec(doc));

        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("- name: ubuntu"));
        assert!(rendered.contains("sudo: \"ALL=(ALL) NOPASSWD:ALL\""));
        assert!(rendered.contains("- ssh-ed25519 AAAA test"));
        assert!(rendered.contains("- nginx"));
        assert!(rendered.contains("path: /etc/motd"));
        assert!(rendered.contains("      hello\n      world"));
        assert!(rendered.contains("timezone: UTC"));
        assert!(rendered.contains("keyid: 9DC858229FC7DD38854AE2D88D81803C0EBFCD88"));
        // runcmd order is preserved.
        let enable = rendered.find("systemctl enable nginx").unwrap();
        let start = rendered.find("systemctl start nginx").unwrap();
        assert!(enable < start);
    }

    #[test]
    fn network_config_pins_the_allocated_address() {
        let rendered =
            render_network_config("10.0.0.2".parse().unwrap(), 24, "10.0.0.1".parse().unwrap());
        assert!(rendered.contains("addresses: [10.0.0.2/24]"));
        assert!(rendered.contains("gateway4: 10.0.0.1"));
    }

    #[test]
    fn empty_doc_renders_minimal_config() {
        let rendered = render_user_data(&spec(CloudInitDoc::default()));
        assert_eq!(rendered, "#cloud-config\nhostname: web-1\n");
    }
}
