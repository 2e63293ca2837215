//! Kestrel control-plane core
//!
//! The authoritative inventory (VPCs, subnets, VMs, disks, floating IPs,
//! firewall rules, hosts), the allocators and scheduler over it, and the
//! reconciliation machinery that drives hypervisor hosts toward the declared
//! state through the `HostDriver` capability interface. Host-side driver
//! implementations live in `kestrel-host`; the CLI binary in `kestrel`.

pub mod api;
pub mod config;
pub mod console;
pub mod control;
pub mod driver;
pub mod error;
pub mod firewall;
pub mod host_registry;
pub mod ipam;
pub mod migration;
pub mod paths;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::Config;
pub use control::ControlPlane;
pub use error::{KestrelError, KestrelResult};
pub use store::Store;
