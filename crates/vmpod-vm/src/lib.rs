//! # vmpod-vm
//!
//! VM backend for vmpod pod sandboxes.
//!
//! The lifecycle layer only talks to the [`VmBackend`] / [`VmHandle`] traits.
//! [`FirecrackerBackend`] implements them on Firecracker microVMs via
//! firepilot, with each guest on a TAP device bridged to a host bridge and a
//! static address from the guest subnet.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vmpod_vm::{
//!     AddressPool, BridgedNic, FirecrackerBackend, FirecrackerSettings, ProvisionSpec, VmBackend,
//!     VmHandle,
//! };
//!
//! # async fn example() -> vmpod_vm::Result<()> {
//! let backend = FirecrackerBackend::new(
//!     FirecrackerSettings {
//!         kernel_path: "/var/lib/vmpod/vmlinux".into(),
//!         firecracker_path: "/usr/local/bin/firecracker".into(),
//!         chroot_path: "/var/lib/vmpod/run".into(),
//!         vcpu_count: 2,
//!         memory_mib: 512,
//!     },
//!     AddressPool::parse("172.16.0.0/24")?,
//! );
//!
//! let vm = backend
//!     .provision(ProvisionSpec {
//!         name: uuid::Uuid::new_v4().to_string(),
//!         image_source: "/var/lib/vmpod/rootfs.ext4".into(),
//!         nic: BridgedNic { device: "br0".into() },
//!     })
//!     .await?;
//!
//! println!("{} is {} at {:?}", vm.name(), vm.state().await?, vm.ips().await?);
//! vm.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod backend;
mod builder;
mod config;
mod error;
mod machine;
mod network;

pub use api::InstanceInfo;
pub use backend::{
    BridgedNic, FirecrackerBackend, FirecrackerSettings, ProvisionSpec, VmBackend, VmHandle,
};
pub use builder::VmBuilder;
pub use config::{DriveConfig, GuestAddress, MachineConfig, NetworkConfig};
pub use error::{Result, VmError};
pub use machine::{VirtualMachine, VmState};
pub use network::{AddressLease, AddressPool, TapDevice};
