//! Host-side driver for the Kestrel control plane
//!
//! Implements `kestrel_core::driver::HostDriver` against the
//! libvirt/QEMU/iptables stack by shelling out through a `CommandExecutor`,
//! which comes in a local and an SSH variant. The control plane holds one
//! driver per registered host.

pub mod cloud_init;
pub mod domain_xml;
pub mod exec;
pub mod libvirt;

pub use exec::{CommandExecutor, LocalExecutor, SshExecutor};
pub use libvirt::LibvirtDriver;
