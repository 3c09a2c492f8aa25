//! In-memory libvirt domain descriptor.
//!
//! The structs here mirror the subset of the libvirt domain XML schema the
//! driver emits. Attributes are fields renamed with an `@` prefix and element
//! text is the `$text` field, following quick-xml's serde conventions.

use crate::error::{Result, VmError};
use serde::Serialize;

/// Name every sandbox domain is defined under.
pub const DOMAIN_NAME: &str = "sandbox";

/// Marker for presence-only elements such as `<acpi/>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Enabled {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename = "domain")]
pub struct DomainDescriptor {
    #[serde(rename = "@type")]
    pub domain_type: String,
    pub name: String,
    pub uuid: String,
    pub memory: Memory,
    #[serde(rename = "memoryBacking", skip_serializing_if = "Option::is_none")]
    pub memory_backing: Option<MemoryBacking>,
    pub vcpu: Vcpu,
    pub os: Os,
    pub features: Features,
    pub cpu: Cpu,
    pub clock: Clock,
    pub devices: Devices,
}

impl DomainDescriptor {
    /// Render the descriptor as libvirt domain XML.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|e| VmError::Serialize(e.to_string()))
    }

    /// Whether guest memory is backed by shared host memory.
    pub fn has_shared_memory(&self) -> bool {
        self.memory_backing
            .as_ref()
            .is_some_and(|b| b.access.mode == "shared")
    }
}

/// `<memory unit="MiB">N</memory>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    #[serde(rename = "@unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryBacking {
    pub access: MemoryAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryAccess {
    #[serde(rename = "@mode")]
    pub mode: String,
}

/// `<vcpu current="C">MAX</vcpu>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vcpu {
    #[serde(rename = "@current")]
    pub current: u32,
    #[serde(rename = "$text")]
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Os {
    #[serde(rename = "type")]
    pub os_type: OsType,
    pub kernel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    pub cmdline: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsType {
    #[serde(rename = "@machine")]
    pub machine: String,
    #[serde(rename = "$text")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Enabled>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apic: Option<Enabled>,
    pub ioapic: Ioapic,
    pub pmu: FeatureState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ioapic {
    #[serde(rename = "@driver")]
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureState {
    #[serde(rename = "@state")]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cpu {
    #[serde(rename = "@mode")]
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa: Option<Numa>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Numa {
    pub cell: Vec<NumaCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumaCell {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@cpus")]
    pub cpus: String,
    #[serde(rename = "@memory")]
    pub memory: u64,
    #[serde(rename = "@unit")]
    pub unit: String,
    #[serde(rename = "@memAccess")]
    pub mem_access: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Clock {
    pub timer: Vec<Timer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timer {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@tickpolicy")]
    pub tick_policy: String,
}

/// Device section. Each list only ever grows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Devices {
    pub emulator: String,
    #[serde(rename = "console")]
    pub consoles: Vec<Console>,
    #[serde(rename = "channel")]
    pub channels: Vec<Channel>,
    #[serde(rename = "filesystem")]
    pub filesystems: Vec<Filesystem>,
    #[serde(rename = "interface")]
    pub interfaces: Vec<Interface>,
    #[serde(rename = "controller")]
    pub controllers: Vec<Controller>,
    pub memballoon: Model,
    #[serde(rename = "rng")]
    pub rngs: Vec<Rng>,
}

/// UNIX socket character device source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnixSource {
    #[serde(rename = "@mode")]
    pub mode: String,
    #[serde(rename = "@path")]
    pub path: String,
}

impl UnixSource {
    pub fn bind(path: impl Into<String>) -> Self {
        Self {
            mode: "bind".into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Console {
    #[serde(rename = "@type")]
    pub kind: String,
    pub source: UnixSource,
    pub target: ConsoleTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleTarget {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    #[serde(rename = "@type")]
    pub kind: String,
    pub source: UnixSource,
    pub target: ChannelTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelTarget {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filesystem {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<FilesystemDriver>,
    pub source: DirRef,
    pub target: DirRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemDriver {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirRef {
    #[serde(rename = "@dir")]
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interface {
    #[serde(rename = "@type")]
    pub kind: String,
    pub mac: MacAddress,
    pub target: InterfaceTarget,
    pub model: InterfaceModel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacAddress {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@managed")]
    pub managed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceModel {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Controller {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@model")]
    pub model: String,
}

/// Element carrying only a `model` attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    #[serde(rename = "@model")]
    pub model: String,
}

impl Model {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rng {
    #[serde(rename = "@model")]
    pub model: String,
    pub backend: RngBackend,
}

/// `<backend model="random">/dev/urandom</backend>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RngBackend {
    #[serde(rename = "@model")]
    pub model: String,
    #[serde(rename = "$text")]
    pub device: String,
}
