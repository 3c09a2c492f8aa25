//! Configuration types for libvirt-backed sandboxes.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Upper bound on vCPUs a q35 guest can be defined with.
pub const MAX_VCPUS: u32 = 240;

/// Environment variable overriding the per-sandbox runtime storage root.
pub const RUN_STORAGE_ENV: &str = "VIRTBOX_RUN_STORAGE_PATH";

/// Environment variable overriding the per-sandbox VM storage root.
pub const VM_STORAGE_ENV: &str = "VIRTBOX_VM_STORAGE_PATH";

const DEFAULT_RUN_STORAGE: &str = "/run/vc/sbs";
const DEFAULT_VM_STORAGE: &str = "/run/vc/vm";

/// How host directories are shared with the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SharedFs {
    /// No shared filesystem device.
    #[default]
    #[serde(rename = "none")]
    None,
    /// virtio-fs; requires guest memory backed by shared host memory.
    #[serde(rename = "virtio-fs")]
    VirtioFs,
    /// 9p over virtio.
    #[serde(rename = "virtio-9p")]
    Virtio9p,
}

impl SharedFs {
    /// Whether this mode needs shared memory backing and a NUMA cell.
    pub fn requires_shared_memory(&self) -> bool {
        matches!(self, Self::VirtioFs)
    }
}

impl fmt::Display for SharedFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedFs::None => write!(f, "none"),
            SharedFs::VirtioFs => write!(f, "virtio-fs"),
            SharedFs::Virtio9p => write!(f, "virtio-9p"),
        }
    }
}

/// A single kernel command line parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// Hardware and boot configuration for a sandbox VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// vCPUs online at boot
    pub num_vcpus: u32,
    /// vCPUs the domain is defined with; the ceiling for live resize
    pub default_max_vcpus: u32,
    /// Guest memory in MiB
    pub memory_mib: u64,
    /// Path to the guest kernel image
    pub kernel_path: PathBuf,
    /// Path to the initrd image (optional)
    pub initrd_path: Option<PathBuf>,
    /// Path to the emulator binary
    pub hypervisor_path: PathBuf,
    /// Machine type, e.g. `q35`
    pub machine_type: String,
    /// Extra kernel parameters appended after the driver's own
    pub kernel_params: Vec<Param>,
    /// Shared filesystem mode
    pub shared_fs: SharedFs,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            num_vcpus: 1,
            default_max_vcpus: 1,
            memory_mib: 2048,
            kernel_path: PathBuf::from("/usr/share/virtbox/vmlinux.container"),
            initrd_path: None,
            hypervisor_path: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            machine_type: "q35".into(),
            kernel_params: Vec::new(),
            shared_fs: SharedFs::VirtioFs,
        }
    }
}

impl ResourceConfig {
    /// Create a new config builder.
    pub fn builder() -> ResourceConfigBuilder {
        ResourceConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(VmError::Config("kernel_path is required".into()));
        }
        if self.hypervisor_path.as_os_str().is_empty() {
            return Err(VmError::Config("hypervisor_path is required".into()));
        }
        if self.num_vcpus == 0 {
            return Err(VmError::Config("num_vcpus must be > 0".into()));
        }
        if self.default_max_vcpus < self.num_vcpus || self.default_max_vcpus > MAX_VCPUS {
            return Err(VmError::Config(format!(
                "default_max_vcpus must be {}-{}, got {}",
                self.num_vcpus, MAX_VCPUS, self.default_max_vcpus
            )));
        }
        if self.memory_mib == 0 {
            return Err(VmError::Config("memory_mib must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`ResourceConfig`].
#[derive(Debug, Default)]
pub struct ResourceConfigBuilder {
    config: ResourceConfig,
}

impl ResourceConfigBuilder {
    /// Set boot vCPUs.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.config.num_vcpus = count;
        self
    }

    /// Set the vCPU ceiling.
    pub fn max_vcpus(mut self, count: u32) -> Self {
        self.config.default_max_vcpus = count;
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Set the kernel path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the initrd path.
    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.initrd_path = Some(path.into());
        self
    }

    /// Set the emulator path.
    pub fn hypervisor(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.hypervisor_path = path.into();
        self
    }

    /// Set the machine type.
    pub fn machine_type(mut self, machine: impl Into<String>) -> Self {
        self.config.machine_type = machine.into();
        self
    }

    /// Append a kernel parameter.
    pub fn kernel_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kernel_params.push(Param::new(key, value));
        self
    }

    /// Set the shared filesystem mode.
    pub fn shared_fs(mut self, mode: SharedFs) -> Self {
        self.config.shared_fs = mode;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ResourceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-sandbox storage roots supplied by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Root of per-sandbox runtime state
    pub run_storage: PathBuf,
    /// Root of per-sandbox VM runtime state
    pub vm_storage: PathBuf,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_STORAGE, DEFAULT_VM_STORAGE)
    }
}

impl StorePaths {
    pub fn new(run_storage: impl Into<PathBuf>, vm_storage: impl Into<PathBuf>) -> Self {
        Self {
            run_storage: run_storage.into(),
            vm_storage: vm_storage.into(),
        }
    }

    /// Load storage roots from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let run_storage = std::env::var(RUN_STORAGE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RUN_STORAGE));
        let vm_storage = std::env::var(VM_STORAGE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_VM_STORAGE));
        Self {
            run_storage,
            vm_storage,
        }
    }

    /// Runtime directory for one sandbox.
    pub fn run_path(&self, sandbox_id: &str) -> PathBuf {
        self.run_storage.join(sandbox_id)
    }

    /// VM runtime directory for one sandbox.
    pub fn vm_path(&self, sandbox_id: &str) -> PathBuf {
        self.vm_storage.join(sandbox_id)
    }

    /// Directory that holds every domain root, a sibling of the VM storage root.
    pub fn domain_roots(&self) -> Result<PathBuf> {
        self.vm_storage
            .parent()
            .map(|parent| parent.join("libvirt"))
            .ok_or_else(|| {
                VmError::Config(format!(
                    "vm storage path {} has no parent directory",
                    self.vm_storage.display()
                ))
            })
    }
}

/// Feature set advertised to the sandbox orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    fs_sharing: bool,
}

impl Capabilities {
    pub fn set_fs_sharing_support(&mut self) {
        self.fs_sharing = true;
    }

    pub fn is_fs_sharing_supported(&self) -> bool {
        self.fs_sharing
    }
}

/// Longest path accepted for a UNIX socket (`sun_path` minus the terminator).
pub(crate) const SOCKET_PATH_MAX: usize = 107;

/// Join `parts` onto `base`, rejecting results too long to bind as a socket.
pub(crate) fn socket_path(base: &Path, parts: &[&str]) -> Result<PathBuf> {
    let path = parts.iter().fold(base.to_path_buf(), |acc, p| acc.join(p));
    let len = path.as_os_str().len();
    if len > SOCKET_PATH_MAX {
        return Err(VmError::Config(format!(
            "socket path {} is {} bytes, limit is {}",
            path.display(),
            len,
            SOCKET_PATH_MAX
        )));
    }
    Ok(path)
}
