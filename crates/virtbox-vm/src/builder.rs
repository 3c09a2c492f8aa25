//! Maps a [`ResourceConfig`] onto a libvirt [`DomainDescriptor`].

use crate::config::{socket_path, Param, ResourceConfig, StorePaths};
use crate::domain::*;
use crate::error::Result;
use crate::identity::SandboxIdentity;
use std::path::{Path, PathBuf};

/// File name of the serial console socket.
pub const CONSOLE_SOCKET: &str = "console.sock";

/// Kernel parameters every sandbox guest boots with.
const DEFAULT_KERNEL_PARAMS: &[(&str, &str)] = &[
    ("quiet", ""),
    ("tsc", "reliable"),
    ("no_timer_check", ""),
    ("rcupdate.rcu_expedited", "1"),
    ("i8042.direct", "1"),
    ("i8042.dumbkbd", "1"),
    ("i8042.nopnp", "1"),
    ("i8042.noaux", "1"),
    ("noreplace-smp", ""),
    ("reboot", "k"),
    ("console", "hvc0"),
    ("console", "hvc1"),
    ("iommu", "off"),
    ("cryptomgr.notests", ""),
    ("net.ifnames", "0"),
    ("pci", "lastbus=0"),
    ("panic", "1"),
];

/// Path of the console socket for `sandbox_id`.
pub fn console_path(paths: &StorePaths, sandbox_id: &str) -> Result<PathBuf> {
    socket_path(&paths.vm_storage, &[sandbox_id, CONSOLE_SOCKET])
}

/// Assemble the guest kernel command line.
///
/// Order matters: driver defaults, then derived parameters, then the caller's
/// own. Duplicate keys are passed through so the kernel's last-wins parsing
/// lets callers override defaults.
pub fn kernel_cmdline(config: &ResourceConfig) -> String {
    DEFAULT_KERNEL_PARAMS
        .iter()
        .map(|(k, v)| Param::new(*k, *v))
        .chain([
            Param::new("nr_cpus", config.default_max_vcpus.to_string()),
            Param::new("agent.use_vsock", "false"),
        ])
        .chain(config.kernel_params.iter().cloned())
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the domain descriptor for one sandbox.
///
/// # Example
///
/// ```no_run
/// use virtbox_vm::{identity, DescriptorBuilder, ResourceConfig, StorePaths};
///
/// # async fn example() -> virtbox_vm::Result<()> {
/// let paths = StorePaths::from_env();
/// let config = ResourceConfig::builder().vcpus(2).max_vcpus(4).build()?;
/// let identity = identity::resolve("sbx1", &paths).await?;
/// let descriptor = DescriptorBuilder::new(&identity, &config, &paths)?.build();
/// assert_eq!(descriptor.vcpu.max, 4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DescriptorBuilder<'a> {
    identity: &'a SandboxIdentity,
    config: &'a ResourceConfig,
    console_path: PathBuf,
}

impl<'a> DescriptorBuilder<'a> {
    /// Prepare a builder, deriving the console socket path.
    ///
    /// # Errors
    /// Returns an error if the console socket path is too long.
    pub fn new(
        identity: &'a SandboxIdentity,
        config: &'a ResourceConfig,
        paths: &StorePaths,
    ) -> Result<Self> {
        let console_path = console_path(paths, identity.sandbox_id())?;
        Ok(Self {
            identity,
            config,
            console_path,
        })
    }

    /// Path the serial console will be bound at.
    pub fn console_path(&self) -> &Path {
        &self.console_path
    }

    /// Produce the descriptor. Device lists other than the console start empty.
    pub fn build(&self) -> DomainDescriptor {
        let config = self.config;

        let mut descriptor = DomainDescriptor {
            domain_type: "kvm".into(),
            name: DOMAIN_NAME.into(),
            uuid: self.identity.domain_uuid().hyphenated().to_string(),
            memory: Memory {
                unit: "MiB".into(),
                value: config.memory_mib,
            },
            memory_backing: None,
            vcpu: Vcpu {
                current: config.num_vcpus,
                max: config.default_max_vcpus,
            },
            os: Os {
                os_type: OsType {
                    machine: config.machine_type.clone(),
                    kind: "hvm".into(),
                },
                kernel: config.kernel_path.display().to_string(),
                initrd: config
                    .initrd_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                cmdline: kernel_cmdline(config),
            },
            features: Features {
                acpi: Some(Enabled::default()),
                apic: Some(Enabled::default()),
                ioapic: Ioapic {
                    driver: "kvm".into(),
                },
                pmu: FeatureState {
                    state: "off".into(),
                },
            },
            cpu: Cpu {
                mode: "host-passthrough".into(),
                numa: None,
            },
            clock: Clock {
                timer: vec![Timer {
                    name: "pit".into(),
                    tick_policy: "discard".into(),
                }],
            },
            devices: Devices {
                emulator: config.hypervisor_path.display().to_string(),
                consoles: vec![Console {
                    kind: "unix".into(),
                    source: UnixSource::bind(self.console_path.display().to_string()),
                    target: ConsoleTarget {
                        kind: "virtio".into(),
                    },
                }],
                channels: Vec::new(),
                filesystems: Vec::new(),
                interfaces: Vec::new(),
                controllers: vec![Controller {
                    kind: "usb".into(),
                    model: "none".into(),
                }],
                memballoon: Model::new("none"),
                rngs: vec![Rng {
                    model: "virtio".into(),
                    backend: RngBackend {
                        model: "random".into(),
                        device: "/dev/urandom".into(),
                    },
                }],
            },
        };

        if config.shared_fs.requires_shared_memory() {
            // virtio-fs needs every byte of guest RAM in one shared NUMA cell
            descriptor.memory_backing = Some(MemoryBacking {
                access: MemoryAccess {
                    mode: "shared".into(),
                },
            });
            descriptor.cpu.numa = Some(Numa {
                cell: vec![NumaCell {
                    id: 0,
                    cpus: format!("0-{}", config.default_max_vcpus.saturating_sub(1)),
                    memory: config.memory_mib,
                    unit: "MiB".into(),
                    mem_access: "shared".into(),
                }],
            });
        }

        tracing::trace!(
            sandbox_id = self.identity.sandbox_id(),
            vcpus = config.num_vcpus,
            max_vcpus = config.default_max_vcpus,
            memory_mib = config.memory_mib,
            shared_fs = %config.shared_fs,
            "Domain descriptor built"
        );

        descriptor
    }
}
