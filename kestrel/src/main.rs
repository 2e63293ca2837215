//! Kestrel control-plane CLI
//!
//! `kestrel serve` runs the API, the reconciler and the background sweepers
//! against the configured store and host inventory. `kestrel check-host`
//! probes a hypervisor over SSH without starting anything.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use kestrel_core::driver::HostDriver;
use kestrel_core::types::{Arch, FloatingIp, FloatingIpStatus, HostCapacity, ImageRecord};
use kestrel_core::{Config, ControlPlane, KestrelError, Store};
use kestrel_host::LibvirtDriver;

// Exit codes: 0 ok, 2 usage (clap), 3 config, 4 store unavailable,
// 5 driver unreachable, 64 internal.
const EXIT_CONFIG: u8 = 3;
const EXIT_STORE: u8 = 4;
const EXIT_DRIVER: u8 = 5;
const EXIT_INTERNAL: u8 = 64;

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Multi-tenant VM control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: API, reconciler, sweepers
    Serve,
    /// Probe a hypervisor host over SSH and print its facts
    CheckHost {
        /// Host address
        address: String,
        /// SSH user
        #[arg(long, default_value = "root")]
        user: String,
        /// SSH identity file
        #[arg(long)]
        identity: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    match cli.command {
        Commands::Serve => runtime.block_on(serve()),
        Commands::CheckHost {
            address,
            user,
            identity,
        } => runtime.block_on(check_host(address, user, identity)),
    }
}

async fn serve() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match Store::open(&config.store.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("cannot open store at {}: {}", config.store.path, e);
            return ExitCode::from(EXIT_STORE);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let control = ControlPlane::new(config.clone(), store, shutdown_rx.clone());

    if let Err(e) = load_inventory(&control).await {
        eprintln!("host inventory error: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }
    seed_public_pool(&control);
    control.spawn_background();

    let api = {
        let control = control.clone();
        let listen = config.api.listen.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { kestrel_core::api::serve(control, &listen, shutdown).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
        result = api => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("api server failed: {}", e);
                    return ExitCode::from(EXIT_INTERNAL);
                }
                Err(e) => {
                    eprintln!("api task panicked: {}", e);
                    return ExitCode::from(EXIT_INTERNAL);
                }
            }
        }
    }
    ExitCode::SUCCESS
}

/// Load the host inventory file (`HOSTS_CONFIG`) and connect a driver per
/// host. Hosts already registered (matched by address) just get their
/// driver refreshed.
async fn load_inventory(control: &Arc<ControlPlane>) -> Result<(), KestrelError> {
    let Some(path) = control.config.hosts.hosts_config.clone() else {
        tracing::warn!("HOSTS_CONFIG not set; no hosts will be driven");
        return Ok(());
    };
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| KestrelError::validation("HOSTS_CONFIG", format!("{}: {}", path, e)))?;
    let doc: Value = serde_json::from_str(&raw)
        .map_err(|e| KestrelError::validation("HOSTS_CONFIG", format!("invalid JSON: {}", e)))?;

    for image in doc["images"].as_array().unwrap_or(&Vec::new()) {
        let record = ImageRecord {
            id: image["id"].as_str().unwrap_or_default().to_string(),
            name: image["name"].as_str().unwrap_or_default().to_string(),
            arch: image["arch"]
                .as_str()
                .unwrap_or("x86_64")
                .parse()
                .unwrap_or(Arch::X86_64),
            sha256: image["sha256"].as_str().unwrap_or_default().to_string(),
            hosts: Vec::new(),
        };
        if record.id.is_empty() {
            continue;
        }
        control.register_image(record)?;
    }

    for host in doc["hosts"].as_array().unwrap_or(&Vec::new()) {
        let address = host["address"].as_str().unwrap_or_default().to_string();
        if address.is_empty() {
            continue;
        }
        let arch: Arch = host["arch"].as_str().unwrap_or("x86_64").parse()?;
        let user = host["ssh_user"].as_str().unwrap_or("root").to_string();
        let identity = host["ssh_identity"]
            .as_str()
            .map(String::from)
            .or_else(|| control.config.hosts.ssh_identity.clone());
        let local = host["local"].as_bool().unwrap_or(false);
        let capacity = HostCapacity {
            vcpus: host["vcpus"].as_u64().unwrap_or(4) as u32,
            memory_mib: host["memory_mib"].as_u64().unwrap_or(8192),
            disk_bytes: host["disk_bytes"].as_u64().unwrap_or(100 << 30),
        };
        let vm_root = host["vm_root"]
            .as_str()
            .unwrap_or("/var/lib/kestrel")
            .to_string();

        let record = match control.registry.register(
            address.clone(),
            arch,
            user.clone(),
            identity.clone(),
            capacity,
            vm_root,
        ) {
            Ok(record) => record,
            Err(KestrelError::AlreadyExists { .. }) => {
                match control
                    .registry
                    .list()?
                    .into_iter()
                    .find(|h| h.address == address)
                {
                    Some(record) => record,
                    None => continue,
                }
            }
            Err(e) => return Err(e),
        };
        let driver: Arc<dyn HostDriver> = if local {
            Arc::new(LibvirtDriver::local())
        } else {
            Arc::new(LibvirtDriver::ssh(&user, &address, identity))
        };
        control.drivers.insert(record.id, driver);
        tracing::info!(host = %record.id, address = %address, local, "connected host driver");
    }
    Ok(())
}

/// Make sure every configured public address has a floating-IP row.
fn seed_public_pool(control: &Arc<ControlPlane>) {
    let existing: Vec<std::net::Ipv4Addr> = control
        .list_floating_ips()
        .map(|ips| ips.iter().map(|fip| fip.address).collect())
        .unwrap_or_default();
    for addr in &control.config.network.public_ip_pool {
        if existing.contains(addr) {
            continue;
        }
        let row = FloatingIp {
            address: *addr,
            status: FloatingIpStatus::Available,
            bound_vm: None,
            last_rebind: None,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = control.store.put_typed(
            &kestrel_core::store::keys::fip(addr),
            &row,
            kestrel_core::store::Expected::Any,
        ) {
            tracing::warn!(address = %addr, error = %e, "failed to seed floating ip");
        }
    }
}

async fn check_host(address: String, user: String, identity: Option<String>) -> ExitCode {
    let driver = LibvirtDriver::ssh(&user, &address, identity);
    match driver.host_facts().await {
        Ok(facts) => {
            println!(
                "{}: arch={} libvirt={} uplink={}",
                address, facts.arch, facts.libvirt_version, facts.uplink
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("host {} unreachable: {}", address, e);
            ExitCode::from(EXIT_DRIVER)
        }
    }
}
