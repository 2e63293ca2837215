//! libvirt host driver
//!
//! Implements the control plane's `HostDriver` verb set by shelling out to
//! `virsh`, `qemu-img`, `ip` and `iptables` through a `CommandExecutor`.
//! With a `LocalExecutor` the driver manages the hypervisor it runs on; with
//! an `SshExecutor` it manages a remote host — every verb is identical
//! either way.
//!
//! Verbs are idempotent by probing before acting: a start of a running
//! domain, a stop of a stopped one, or an undefine of an absent one are
//! no-ops. Errors that come back from the tooling are classified into
//! retry-safe (`driver_unavailable`) and terminal (`driver_terminal`).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::Child;
use tokio::sync::Mutex;

use kestrel_core::driver::{
    CloudInitSpec, ConsoleStream, DomainSpec, DomainState, HostDriver, HostFacts,
    MigrationJobState, MigrationParams, MigrationProgress, NetworkSpec, VmMetrics, VolumeSpec,
};
use kestrel_core::error::{KestrelError, KestrelResult};
use kestrel_core::types::Arch;

use crate::cloud_init;
use crate::domain_xml;
use crate::exec::{CommandExecutor, CommandOutput};

/// Seconds to wait for a graceful shutdown before destroying the domain.
const SHUTDOWN_WAIT_SECS: u32 = 30;

pub struct LibvirtDriver {
    executor: Arc<dyn CommandExecutor>,
    /// Whether the driver runs on the host itself (console sockets are
    /// reachable directly) or over SSH (console tunnels through socat).
    local: bool,
    facts: Mutex<Option<HostFacts>>,
    /// Last pushed script per chain; byte-identical pushes are skipped.
    applied_chains: Mutex<HashMap<String, String>>,
    /// In-flight `virsh migrate` children, by domain name.
    migrations: Mutex<HashMap<String, Child>>,
}

impl LibvirtDriver {
    pub fn local() -> Self {
        Self::new(Arc::new(crate::exec::LocalExecutor), true)
    }

    pub fn ssh(user: &str, host: &str, identity: Option<String>) -> Self {
        Self::new(
            Arc::new(crate::exec::SshExecutor::new(user, host, identity)),
            false,
        )
    }

    pub fn new(executor: Arc<dyn CommandExecutor>, local: bool) -> Self {
        Self {
            executor,
            local,
            facts: Mutex::new(None),
            applied_chains: Mutex::new(HashMap::new()),
            migrations: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, verb: &str, program: &str, args: &[&str]) -> KestrelResult<String> {
        let output = self
            .executor
            .execute(program, args)
            .await
            .map_err(|e| unavailable(verb, &e.to_string()))?;
        if output.success() {
            Ok(output.stdout_str())
        } else {
            Err(classify(verb, &output))
        }
    }

    async fn run_with_stdin(
        &self,
        verb: &str,
        program: &str,
        args: &[&str],
        stdin: &[u8],
    ) -> KestrelResult<String> {
        let output = self
            .executor
            .execute_with_stdin(program, args, stdin)
            .await
            .map_err(|e| unavailable(verb, &e.to_string()))?;
        if output.success() {
            Ok(output.stdout_str())
        } else {
            Err(classify(verb, &output))
        }
    }

    /// Exit-code-only probe; failures are part of normal control flow.
    async fn probe(&self, program: &str, args: &[&str]) -> KestrelResult<bool> {
        let output = self
            .executor
            .execute(program, args)
            .await
            .map_err(|e| unavailable("probe", &e.to_string()))?;
        Ok(output.success())
    }

    async fn state_of(&self, name: &str) -> KestrelResult<DomainState> {
        let output = self
            .executor
            .execute("virsh", &["domstate", name])
            .await
            .map_err(|e| unavailable("domain_state", &e.to_string()))?;
        if !output.success() {
            let stderr = output.stderr_str().to_lowercase();
            if stderr.contains("failed to get domain") || stderr.contains("domain not found") {
                return Ok(DomainState::Absent);
            }
            return Err(classify("domain_state", &output));
        }
        Ok(parse_domstate(&output.stdout_str()))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> KestrelResult<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            self.run("write_file", "mkdir", &["-p", &parent.to_string_lossy()])
                .await?;
        }
        self.run_with_stdin("write_file", "tee", &[path], content)
            .await?;
        Ok(())
    }
}

fn unavailable(verb: &str, message: &str) -> KestrelError {
    KestrelError::DriverUnavailable {
        host: "driver".into(),
        message: format!("{}: {}", verb, message),
    }
}

/// Classify a failed command: connection-ish failures are retryable, the
/// rest is terminal.
fn classify(verb: &str, output: &CommandOutput) -> KestrelError {
    let stderr = output.stderr_str();
    let lowered = stderr.to_lowercase();
    let transient = [
        "failed to connect",
        "connection refused",
        "connection reset",
        "cannot connect",
        "resource temporarily unavailable",
        "timed out",
        "device or resource busy",
    ];
    if transient.iter().any(|needle| lowered.contains(needle)) {
        KestrelError::DriverUnavailable {
            host: "driver".into(),
            message: format!("{}: {}", verb, stderr.trim()),
        }
    } else {
        KestrelError::driver_terminal(verb, stderr.trim().to_string())
    }
}

fn parse_domstate(raw: &str) -> DomainState {
    match raw.trim() {
        "running" => DomainState::Running,
        "paused" => DomainState::Paused,
        "crashed" => DomainState::Crashed,
        "shut off" | "shutdown" => DomainState::Shutoff,
        _ => DomainState::Shutoff,
    }
}

/// Parse a `virsh domjobinfo` size like "120.000 MiB" into bytes.
fn parse_bytes(raw: &str) -> u64 {
    let mut parts = raw.trim().split_whitespace();
    let value: f64 = match parts.next().and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => return 0,
    };
    let multiplier = match parts.next() {
        Some("KiB") => 1024.0,
        Some("MiB") => 1024.0 * 1024.0,
        Some("GiB") => 1024.0 * 1024.0 * 1024.0,
        Some("TiB") => 1024.0f64.powi(4),
        _ => 1.0,
    };
    (value * multiplier) as u64
}

fn domjobinfo_field<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with(field))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim())
}

/// A spawned child's stdio as a duplex console stream (the SSH socat
/// tunnel).
struct ChildStream {
    child: Child,
    stdout: tokio::process::ChildStdout,
    stdin: tokio::process::ChildStdin,
}

impl ChildStream {
    fn new(mut child: Child) -> KestrelResult<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            KestrelError::internal("console child has no stdout pipe")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            KestrelError::internal("console child has no stdin pipe")
        })?;
        Ok(Self {
            child,
            stdout,
            stdin,
        })
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[async_trait]
impl HostDriver for LibvirtDriver {
    async fn host_facts(&self) -> KestrelResult<HostFacts> {
        let mut cached = self.facts.lock().await;
        if let Some(facts) = cached.as_ref() {
            return Ok(facts.clone());
        }
        let arch_raw = self.run("host_facts", "uname", &["-m"]).await?;
        let arch: Arch = arch_raw.trim().parse()?;
        let version = self
            .run("host_facts", "virsh", &["--version"])
            .await?
            .trim()
            .to_string();
        let route = self
            .run("host_facts", "ip", &["route", "show", "default"])
            .await?;
        let uplink = route
            .split_whitespace()
            .skip_while(|word| *word != "dev")
            .nth(1)
            .unwrap_or("eth0")
            .to_string();
        let facts = HostFacts {
            arch,
            libvirt_version: version,
            uplink,
        };
        *cached = Some(facts.clone());
        Ok(facts)
    }

    async fn ensure_image(&self, path: &str, _sha256: &str) -> KestrelResult<()> {
        if self.probe("test", &["-f", path]).await? {
            Ok(())
        } else {
            Err(KestrelError::driver_terminal(
                "ensure_image",
                format!("image not present: {}", path),
            ))
        }
    }

    async fn define_domain(&self, spec: &DomainSpec) -> KestrelResult<()> {
        // Make sure the console socket directory exists before libvirt
        // tries to bind into it.
        if let Some(parent) = std::path::Path::new(&spec.serial_socket).parent() {
            self.run("define_domain", "mkdir", &["-p", &parent.to_string_lossy()])
                .await?;
        }
        let xml = domain_xml::render(spec);
        self.run_with_stdin("define_domain", "virsh", &["define", "/dev/stdin"], xml.as_bytes())
            .await?;
        tracing::info!(domain = %spec.name, "defined domain");
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> KestrelResult<()> {
        if self.state_of(name).await? == DomainState::Absent {
            return Ok(());
        }
        self.run("undefine_domain", "virsh", &["undefine", name, "--nvram"])
            .await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> KestrelResult<()> {
        match self.state_of(name).await? {
            DomainState::Running => Ok(()),
            DomainState::Absent => Err(KestrelError::driver_terminal(
                "start_domain",
                format!("domain {} is not defined", name),
            )),
            _ => {
                self.run("start_domain", "virsh", &["start", name]).await?;
                Ok(())
            }
        }
    }

    async fn stop_domain(&self, name: &str, force: bool) -> KestrelResult<()> {
        match self.state_of(name).await? {
            DomainState::Absent | DomainState::Shutoff => return Ok(()),
            _ => {}
        }
        if force {
            self.run("stop_domain", "virsh", &["destroy", name]).await?;
            return Ok(());
        }
        self.run("stop_domain", "virsh", &["shutdown", name]).await?;
        for _ in 0..SHUTDOWN_WAIT_SECS {
            if self.state_of(name).await? == DomainState::Shutoff {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // The guest ignored ACPI; pull the plug.
        tracing::warn!(domain = name, "graceful shutdown timed out, destroying");
        self.run("stop_domain", "virsh", &["destroy", name]).await?;
        Ok(())
    }

    async fn reboot_domain(&self, name: &str) -> KestrelResult<()> {
        self.run("reboot_domain", "virsh", &["reboot", name]).await?;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> KestrelResult<DomainState> {
        self.state_of(name).await
    }

    async fn domain_metrics(&self, name: &str) -> KestrelResult<VmMetrics> {
        let output = self
            .run(
                "domain_metrics",
                "virsh",
                &["domstats", name, "--cpu-total", "--balloon"],
            )
            .await?;
        let field = |key: &str| -> u64 {
            output
                .lines()
                .find_map(|line| {
                    let trimmed = line.trim();
                    trimmed
                        .strip_prefix(key)
                        .and_then(|rest| rest.strip_prefix('='))
                        .and_then(|value| value.trim().parse::<u64>().ok())
                })
                .unwrap_or(0)
        };
        Ok(VmMetrics {
            cpu_time_ns: field("cpu.time"),
            memory_actual_mib: field("balloon.current") / 1024,
            memory_available_mib: field("balloon.unused") / 1024,
            sampled_at: chrono::Utc::now(),
        })
    }

    async fn attach_volume(&self, name: &str, slot: &str, path: &str) -> KestrelResult<()> {
        let running = self.state_of(name).await? == DomainState::Running;
        let mut args = vec![
            "attach-disk",
            name,
            path,
            slot,
            "--subdriver",
            "qcow2",
            "--persistent",
        ];
        if running {
            args.push("--live");
        }
        match self.run("attach_volume", "virsh", &args).await {
            Ok(_) => Ok(()),
            // Re-attaching the same target is the idempotent no-op case.
            Err(KestrelError::DriverTerminal { message, .. })
                if message.contains("already in use")
                    || message.contains("already exists") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn detach_volume(&self, name: &str, slot: &str) -> KestrelResult<()> {
        match self
            .run(
                "detach_volume",
                "virsh",
                &["detach-disk", name, slot, "--persistent"],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(KestrelError::DriverTerminal { message, .. })
                if message.contains("no disk found")
                    || message.contains("not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn resize_cpu_mem(&self, name: &str, vcpus: u32, memory_mib: u64) -> KestrelResult<()> {
        match self.state_of(name).await? {
            DomainState::Shutoff => {}
            DomainState::Absent => {
                return Err(KestrelError::driver_terminal(
                    "resize_cpu_mem",
                    format!("domain {} is not defined", name),
                ));
            }
            other => {
                return Err(KestrelError::driver_terminal(
                    "resize_cpu_mem",
                    format!("domain {} must be shut off to resize, is {:?}", name, other),
                ));
            }
        }
        let vcpus_str = vcpus.to_string();
        let mem_kib = (memory_mib * 1024).to_string();
        self.run(
            "resize_cpu_mem",
            "virsh",
            &["setvcpus", name, &vcpus_str, "--maximum", "--config"],
        )
        .await?;
        self.run(
            "resize_cpu_mem",
            "virsh",
            &["setvcpus", name, &vcpus_str, "--config"],
        )
        .await?;
        self.run(
            "resize_cpu_mem",
            "virsh",
            &["setmaxmem", name, &mem_kib, "--config"],
        )
        .await?;
        self.run(
            "resize_cpu_mem",
            "virsh",
            &["setmem", name, &mem_kib, "--config"],
        )
        .await?;
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> KestrelResult<()> {
        if self.probe("test", &["-f", &spec.path]).await? {
            return Ok(());
        }
        if let Some(parent) = std::path::Path::new(&spec.path).parent() {
            self.run("create_volume", "mkdir", &["-p", &parent.to_string_lossy()])
                .await?;
        }
        let size = format!("{}G", spec.size_gb);
        match &spec.backing {
            Some(backing) => {
                self.run(
                    "create_volume",
                    "qemu-img",
                    &[
                        "create", "-f", "qcow2", "-F", "qcow2", "-b", backing, &spec.path, &size,
                    ],
                )
                .await?;
            }
            None => {
                self.run(
                    "create_volume",
                    "qemu-img",
                    &["create", "-f", "qcow2", &spec.path, &size],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn resize_volume(&self, path: &str, new_size_gb: u64) -> KestrelResult<()> {
        if !self.probe("test", &["-f", path]).await? {
            return Err(KestrelError::driver_terminal(
                "resize_volume",
                format!("volume missing: {}", path),
            ));
        }
        let size = format!("{}G", new_size_gb);
        self.run("resize_volume", "qemu-img", &["resize", path, &size])
            .await?;
        Ok(())
    }

    async fn delete_volume(&self, path: &str) -> KestrelResult<()> {
        self.run("delete_volume", "rm", &["-f", path]).await?;
        Ok(())
    }

    async fn create_cloud_init(&self, spec: &CloudInitSpec) -> KestrelResult<()> {
        let seed_dir = format!("{}.seed", spec.iso_path.trim_end_matches(".iso"));
        let user_data = cloud_init::render_user_data(spec);
        let meta_data = cloud_init::render_meta_data(spec);
        self.write_file(&format!("{}/user-data", seed_dir), user_data.as_bytes())
            .await?;
        self.write_file(&format!("{}/meta-data", seed_dir), meta_data.as_bytes())
            .await?;

        let mut seed_files = vec![
            format!("{}/user-data", seed_dir),
            format!("{}/meta-data", seed_dir),
        ];
        if let (Some(ip), Some(gateway)) = (spec.ip, spec.gateway) {
            let network =
                cloud_init::render_network_config(ip, spec.prefix_len.unwrap_or(24), gateway);
            let path = format!("{}/network-config", seed_dir);
            self.write_file(&path, network.as_bytes()).await?;
            seed_files.push(path);
        }

        let mut args: Vec<&str> = vec![
            "-output",
            spec.iso_path.as_str(),
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
        ];
        for file in &seed_files {
            args.push(file.as_str());
        }
        self.run("create_cloud_init", "genisoimage", &args).await?;
        Ok(())
    }

    async fn define_network(&self, spec: &NetworkSpec) -> KestrelResult<()> {
        if !self.probe("ip", &["link", "show", &spec.bridge]).await? {
            self.run(
                "define_network",
                "ip",
                &["link", "add", "name", &spec.bridge, "type", "bridge"],
            )
            .await?;
            self.run(
                "define_network",
                "ip",
                &["addr", "add", &spec.gateway_cidr, "dev", &spec.bridge],
            )
            .await?;
            let mtu = spec.mtu.to_string();
            self.run(
                "define_network",
                "ip",
                &["link", "set", &spec.bridge, "mtu", &mtu, "up"],
            )
            .await?;
            tracing::info!(bridge = %spec.bridge, "created VPC bridge");
        }
        self.run(
            "define_network",
            "sysctl",
            &["-w", "net.ipv4.ip_forward=1"],
        )
        .await?;

        // NAT masquerade for the VPC subnet out the uplink.
        let facts = self.host_facts().await?;
        let subnet = gateway_cidr_to_subnet(&spec.gateway_cidr);
        let check = [
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            &subnet,
            "-o",
            &facts.uplink,
            "-j",
            "MASQUERADE",
        ];
        if !self.probe("iptables", &check).await? {
            let add = [
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                &subnet,
                "-o",
                &facts.uplink,
                "-j",
                "MASQUERADE",
            ];
            self.run("define_network", "iptables", &add).await?;
        }
        Ok(())
    }

    async fn destroy_network(&self, bridge: &str) -> KestrelResult<()> {
        if self.probe("ip", &["link", "show", bridge]).await? {
            self.run("destroy_network", "ip", &["link", "del", bridge])
                .await?;
        }
        Ok(())
    }

    async fn apply_iptables(&self, chain: &str, script: &str) -> KestrelResult<()> {
        {
            let applied = self.applied_chains.lock().await;
            if applied.get(chain).map(String::as_str) == Some(script) {
                return Ok(());
            }
        }
        let table = format!("*filter\n{}COMMIT\n", script);
        self.run_with_stdin(
            "apply_iptables",
            "iptables-restore",
            &["--noflush"],
            table.as_bytes(),
        )
        .await?;
        // Hook the chains into FORWARD once.
        for suffix in ["-in", "-out"] {
            let full = format!("{}{}", chain, suffix);
            if !self
                .probe("iptables", &["-C", "FORWARD", "-j", &full])
                .await?
            {
                self.run("apply_iptables", "iptables", &["-A", "FORWARD", "-j", &full])
                    .await?;
            }
        }
        self.applied_chains
            .lock()
            .await
            .insert(chain.to_string(), script.to_string());
        tracing::info!(chain, "pushed firewall chains");
        Ok(())
    }

    async fn map_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()> {
        let port = host_port.to_string();
        let dest = format!("{}:22", vm_ip);
        let rule = [
            "-t",
            "nat",
            "PREROUTING",
            "-p",
            "tcp",
            "--dport",
            &port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ];
        nat_rule(self, &rule, true).await
    }

    async fn unmap_ssh_nat(&self, host_port: u16, vm_ip: Ipv4Addr) -> KestrelResult<()> {
        let port = host_port.to_string();
        let dest = format!("{}:22", vm_ip);
        let rule = [
            "-t",
            "nat",
            "PREROUTING",
            "-p",
            "tcp",
            "--dport",
            &port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ];
        nat_rule(self, &rule, false).await
    }

    async fn map_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()> {
        let public_str = public.to_string();
        let private_str = private.to_string();
        let rule = [
            "-t",
            "nat",
            "PREROUTING",
            "-d",
            &public_str,
            "-j",
            "DNAT",
            "--to-destination",
            &private_str,
        ];
        nat_rule(self, &rule, true).await
    }

    async fn unmap_floating_ip(&self, public: Ipv4Addr, private: Ipv4Addr) -> KestrelResult<()> {
        let public_str = public.to_string();
        let private_str = private.to_string();
        let rule = [
            "-t",
            "nat",
            "PREROUTING",
            "-d",
            &public_str,
            "-j",
            "DNAT",
            "--to-destination",
            &private_str,
        ];
        nat_rule(self, &rule, false).await
    }

    async fn open_serial_console(
        &self,
        socket_path: &str,
    ) -> KestrelResult<Box<dyn ConsoleStream>> {
        if self.local {
            let stream = tokio::net::UnixStream::connect(socket_path)
                .await
                .map_err(|e| unavailable("open_serial_console", &e.to_string()))?;
            Ok(Box::new(stream))
        } else {
            let target = format!("UNIX-CONNECT:{}", socket_path);
            let child = self
                .executor
                .spawn("socat", &["-", &target])
                .await
                .map_err(|e| unavailable("open_serial_console", &e.to_string()))?;
            Ok(Box::new(ChildStream::new(child)?))
        }
    }

    async fn begin_migration(&self, name: &str, params: &MigrationParams) -> KestrelResult<()> {
        if self.migrations.lock().await.contains_key(name) {
            return Ok(());
        }
        if let Some(limit) = params.bandwidth_limit {
            let mib_s = (limit / (1024 * 1024)).max(1).to_string();
            self.run(
                "begin_migration",
                "virsh",
                &["migrate-setspeed", name, "--bandwidth", &mib_s],
            )
            .await
            .ok();
        }
        if let Some(downtime) = params.max_downtime_ms {
            let ms = downtime.to_string();
            self.run(
                "begin_migration",
                "virsh",
                &["migrate-setmaxdowntime", name, "--downtime", &ms],
            )
            .await
            .ok();
        }

        let mut args: Vec<String> = vec![
            "migrate".into(),
            "--live".into(),
            "--persistent".into(),
            "--undefinesource".into(),
        ];
        if params.compressed {
            args.push("--compressed".into());
        }
        if params.copy_storage {
            args.push("--copy-storage-all".into());
        }
        args.push(name.to_string());
        args.push(params.destination_uri.clone());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let child = self
            .executor
            .spawn("virsh", &refs)
            .await
            .map_err(|e| unavailable("begin_migration", &e.to_string()))?;
        self.migrations.lock().await.insert(name.to_string(), child);
        tracing::info!(domain = name, destination = %params.destination_uri, "migration started");
        Ok(())
    }

    async fn query_migration(&self, name: &str) -> KestrelResult<MigrationProgress> {
        let output = self
            .run("query_migration", "virsh", &["domjobinfo", name])
            .await?;
        let job_type = domjobinfo_field(&output, "Job type").unwrap_or("None");

        if job_type.contains("Unbounded") || job_type.contains("Bounded") {
            let processed = parse_bytes(domjobinfo_field(&output, "Data processed").unwrap_or("0"));
            let remaining = parse_bytes(domjobinfo_field(&output, "Data remaining").unwrap_or("0"));
            let total = parse_bytes(domjobinfo_field(&output, "Data total").unwrap_or("0"));
            return Ok(MigrationProgress {
                state: MigrationJobState::Active,
                processed_bytes: processed,
                remaining_bytes: remaining,
                total_bytes: total,
            });
        }

        // No active job: consult the migrate child for the verdict.
        let mut migrations = self.migrations.lock().await;
        let state = match migrations.get_mut(name) {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    migrations.remove(name);
                    if status.success() {
                        MigrationJobState::Completed
                    } else {
                        MigrationJobState::Failed
                    }
                }
                Ok(None) => MigrationJobState::Active,
                Err(_) => MigrationJobState::Failed,
            },
            None => {
                if job_type.contains("Cancelled") {
                    MigrationJobState::Cancelled
                } else {
                    MigrationJobState::Completed
                }
            }
        };
        Ok(MigrationProgress {
            state,
            processed_bytes: 0,
            remaining_bytes: 0,
            total_bytes: 0,
        })
    }

    async fn cancel_migration(&self, name: &str) -> KestrelResult<()> {
        self.run("cancel_migration", "virsh", &["domjobabort", name])
            .await
            .ok();
        if let Some(mut child) = self.migrations.lock().await.remove(name) {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

async fn nat_rule(driver: &LibvirtDriver, rule: &[&str], add: bool) -> KestrelResult<()> {
    // rule = ["-t", "nat", "<CHAIN>", ...matcher]; splice in -C/-A/-D.
    let mut check: Vec<&str> = rule.to_vec();
    check.insert(2, "-C");
    let exists = driver.probe("iptables", &check).await?;
    match (add, exists) {
        (true, true) | (false, false) => Ok(()),
        (true, false) => {
            let mut insert: Vec<&str> = rule.to_vec();
            insert.insert(2, "-A");
            driver.run("nat_rule", "iptables", &insert).await?;
            Ok(())
        }
        (false, true) => {
            let mut remove: Vec<&str> = rule.to_vec();
            remove.insert(2, "-D");
            driver.run("nat_rule", "iptables", &remove).await?;
            Ok(())
        }
    }
}

/// "10.0.0.1/24" -> "10.0.0.0/24"
fn gateway_cidr_to_subnet(gateway_cidr: &str) -> String {
    match gateway_cidr.parse::<ipnet::Ipv4Net>() {
        Ok(net) => ipnet::Ipv4Net::new(net.network(), net.prefix_len())
            .map(|n| n.to_string())
            .unwrap_or_else(|_| gateway_cidr.to_string()),
        Err(_) => gateway_cidr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::MockExecutor;
    use kestrel_core::types::VmId;

    fn driver_with(executor: Arc<MockExecutor>) -> LibvirtDriver {
        LibvirtDriver::new(executor, true)
    }

    #[tokio::test]
    async fn domstate_parses_the_libvirt_vocabulary() {
        assert_eq!(parse_domstate("running\n"), DomainState::Running);
        assert_eq!(parse_domstate("shut off\n"), DomainState::Shutoff);
        assert_eq!(parse_domstate("paused\n"), DomainState::Paused);
        assert_eq!(parse_domstate("crashed\n"), DomainState::Crashed);
    }

    #[tokio::test]
    async fn absent_domain_is_reported_not_errored() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(1, "", "error: failed to get domain 'ghost'");
        let driver = driver_with(executor);
        assert_eq!(driver.domain_state("ghost").await.unwrap(), DomainState::Absent);
    }

    #[tokio::test]
    async fn start_is_a_noop_when_already_running() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(0, "running\n", "");
        let driver = driver_with(executor.clone());
        driver.start_domain("web-1").await.unwrap();
        // Only the state probe ran; no `virsh start`.
        let commands = executor.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("domstate"));
    }

    #[tokio::test]
    async fn stop_waits_for_graceful_shutdown() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(0, "running\n", ""); // initial probe
        executor.push_response(0, "", ""); // virsh shutdown
        executor.push_response(0, "shut off\n", ""); // first poll
        let driver = driver_with(executor.clone());
        driver.stop_domain("web-1", false).await.unwrap();
        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.contains("virsh shutdown web-1")));
        assert!(!commands.iter().any(|c| c.contains("virsh destroy")));
    }

    #[tokio::test]
    async fn define_renders_xml_through_stdin() {
        let executor = Arc::new(MockExecutor::new());
        let driver = driver_with(executor.clone());
        let spec = DomainSpec {
            vm: VmId::new(),
            name: "web-1".into(),
            arch: Arch::X86_64,
            vcpus: 1,
            memory_mib: 1024,
            root_disk: "/var/lib/kestrel/disks/a.qcow2".into(),
            extra_disks: Vec::new(),
            cidata_iso: None,
            nic: None,
            serial_socket: "/var/lib/kestrel/consoles/a.sock".into(),
            vnc_port: 5901,
        };
        driver.define_domain(&spec).await.unwrap();
        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.contains("virsh define /dev/stdin")));
    }

    #[tokio::test]
    async fn create_volume_skips_existing_files() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(0, "", ""); // test -f succeeds: file exists
        let driver = driver_with(executor.clone());
        driver
            .create_volume(&VolumeSpec {
                path: "/v/a.qcow2".into(),
                size_gb: 10,
                backing: None,
            })
            .await
            .unwrap();
        assert_eq!(executor.commands().len(), 1);
    }

    #[tokio::test]
    async fn create_volume_uses_backing_files() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(1, "", ""); // test -f: missing
        let driver = driver_with(executor.clone());
        driver
            .create_volume(&VolumeSpec {
                path: "/v/a.qcow2".into(),
                size_gb: 10,
                backing: Some("/v/images/base.qcow2".into()),
            })
            .await
            .unwrap();
        let commands = executor.commands();
        let create = commands
            .iter()
            .find(|c| c.contains("qemu-img create"))
            .unwrap();
        assert!(create.contains("-b /v/images/base.qcow2"));
        assert!(create.contains("10G"));
    }

    #[tokio::test]
    async fn apply_iptables_skips_byte_identical_pushes() {
        let executor = Arc::new(MockExecutor::new());
        let driver = driver_with(executor.clone());
        let script = ":kbr-x-in - [0:0]\n-A kbr-x-in -j DROP\n";

        // First push: restore + two hook probes already present.
        executor.push_response(0, "", ""); // iptables-restore
        executor.push_response(0, "", ""); // -C FORWARD -j kbr-x-in
        executor.push_response(0, "", ""); // -C FORWARD -j kbr-x-out
        driver.apply_iptables("kbr-x", script).await.unwrap();
        let first = executor.commands().len();

        driver.apply_iptables("kbr-x", script).await.unwrap();
        assert_eq!(executor.commands().len(), first, "unchanged script re-pushed");
    }

    #[tokio::test]
    async fn connection_failures_classify_as_retryable() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(1, "", "error: failed to connect to the hypervisor");
        let driver = driver_with(executor);
        let err = driver.reboot_domain("web-1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn domjobinfo_sizes_parse() {
        assert_eq!(parse_bytes("120.000 MiB"), 125_829_120);
        assert_eq!(parse_bytes("1.000 GiB"), 1_073_741_824);
        assert_eq!(parse_bytes("512"), 512);
        assert_eq!(parse_bytes("garbage"), 0);
    }

    #[test]
    fn domjobinfo_fields_extract() {
        let output = "Job type:         Unbounded\nData processed:   120.000 MiB\nData remaining:   1.000 GiB\nData total:       2.000 GiB\n";
        assert_eq!(domjobinfo_field(output, "Job type"), Some("Unbounded"));
        assert_eq!(
            domjobinfo_field(output, "Data processed"),
            Some("120.000 MiB")
        );
    }

    #[test]
    fn subnet_derivation_from_gateway() {
        assert_eq!(gateway_cidr_to_subnet("10.0.0.1/24"), "10.0.0.0/24");
        assert_eq!(gateway_cidr_to_subnet("192.168.8.1/22"), "192.168.8.0/22");
    }
}
