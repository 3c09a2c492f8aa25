//! # virtbox-vm
//!
//! libvirt driver for virtbox sandboxes.
//! Turns a resource configuration into a libvirt domain, drives the domain
//! through its lifecycle, and resizes vCPUs on a running guest.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use virtbox_vm::{Device, LibvirtSandbox, ResourceConfig, SharedFs, StorePaths, VirshControlPlane};
//!
//! # async fn example() -> virtbox_vm::Result<()> {
//! let config = ResourceConfig::builder()
//!     .vcpus(2)
//!     .max_vcpus(4)
//!     .memory_mib(2048)
//!     .kernel("/path/to/vmlinux")
//!     .shared_fs(SharedFs::VirtioFs)
//!     .build()?;
//!
//! let mut sandbox = LibvirtSandbox::create(
//!     "sbx1",
//!     config,
//!     StorePaths::from_env(),
//!     Arc::new(VirshControlPlane::default()),
//! )
//! .await?;
//!
//! // Devices are registered before start
//! let agent = sandbox.generate_socket(false)?;
//! sandbox.add_device(agent.into());
//! sandbox.add_device(Device::NetworkInterface {
//!     tap_name: "tap0_kata".into(),
//!     mac_address: "52:54:00:12:34:56".into(),
//! });
//!
//! sandbox.start().await?;
//!
//! // Fire-and-forget: the guest onlines the vCPUs on its own time
//! let adjustment = sandbox.resize_vcpus(4).await?;
//! assert_eq!(adjustment.applied(), 4);
//!
//! sandbox.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Stable Identity**: Domain UUID and libvirt root recovered from disk across restarts
//! - **Descriptor Building**: Boot, CPU, memory and device XML from a flat config
//! - **virtio-fs**: Shared memory backing and NUMA cell kept consistent with vCPU/memory
//! - **Lifecycle Management**: Define, start, destroy and undefine against libvirt
//! - **vCPU Resize**: Clamped, idempotent live vCPU changes

mod builder;
mod config;
mod control;
mod devices;
pub mod domain;
mod error;
pub mod identity;
mod lifecycle;
mod machine;
mod scaler;
mod virsh;

#[cfg(test)]
mod testing;

pub use builder::{console_path, kernel_cmdline, DescriptorBuilder, CONSOLE_SOCKET};
pub use config::{
    Capabilities, Param, ResourceConfig, ResourceConfigBuilder, SharedFs, StorePaths, MAX_VCPUS,
    RUN_STORAGE_ENV, VM_STORAGE_ENV,
};
pub use control::{Connection, ControlPlane, Domain};
pub use devices::{attach, AgentSocket, Device, AGENT_SOCKET};
pub use domain::{DomainDescriptor, DOMAIN_NAME};
pub use error::{Result, VmError};
pub use identity::SandboxIdentity;
pub use lifecycle::{LifecycleController, LifecycleState};
pub use machine::LibvirtSandbox;
pub use scaler::VcpuAdjustment;
pub use virsh::VirshControlPlane;
