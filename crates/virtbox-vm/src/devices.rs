//! Peripheral devices registered on a domain before it is started.

use crate::config::{socket_path, SharedFs, StorePaths};
use crate::domain::*;
use crate::error::Result;
use std::fmt;
use std::path::PathBuf;

/// File name of the agent's serial socket.
pub const AGENT_SOCKET: &str = "kata.sock";

/// A device to attach to a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// virtio-serial channel backed by a host UNIX socket.
    ConsoleChannel { host_path: PathBuf, name: String },
    /// Host directory exported to the guest under a mount tag.
    SharedFilesystem { host_path: PathBuf, mount_tag: String },
    /// Unmanaged tap interface.
    NetworkInterface { tap_name: String, mac_address: String },
    /// A device this driver has no descriptor mapping for (block drives,
    /// VFIO, vhost-user). Attaching it is a no-op.
    Other { kind: String },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::ConsoleChannel { .. } => write!(f, "console-channel"),
            Device::SharedFilesystem { .. } => write!(f, "shared-filesystem"),
            Device::NetworkInterface { .. } => write!(f, "network-interface"),
            Device::Other { kind } => write!(f, "{kind}"),
        }
    }
}

/// Append `device` to the matching list of `descriptor`.
///
/// Devices are never replaced or deduplicated; attaching the same device
/// twice yields two entries. Filesystems get the virtiofs driver only when
/// `shared_fs` is virtio-fs.
pub fn attach(descriptor: &mut DomainDescriptor, device: Device, shared_fs: SharedFs) {
    tracing::debug!(device = %device, "Attaching device");

    let devices = &mut descriptor.devices;
    match device {
        Device::ConsoleChannel { host_path, name } => devices.channels.push(Channel {
            kind: "unix".into(),
            source: UnixSource::bind(host_path.display().to_string()),
            target: ChannelTarget {
                kind: "virtio".into(),
                name,
            },
        }),
        Device::SharedFilesystem {
            host_path,
            mount_tag,
        } => devices.filesystems.push(Filesystem {
            kind: "mount".into(),
            driver: shared_fs.requires_shared_memory().then(|| FilesystemDriver {
                kind: "virtiofs".into(),
            }),
            source: DirRef {
                dir: host_path.display().to_string(),
            },
            target: DirRef { dir: mount_tag },
        }),
        Device::NetworkInterface {
            tap_name,
            mac_address,
        } => devices.interfaces.push(Interface {
            kind: "ethernet".into(),
            mac: MacAddress {
                address: mac_address,
            },
            target: InterfaceTarget {
                dev: tap_name,
                managed: "no".into(),
            },
            model: InterfaceModel {
                kind: "virtio".into(),
            },
        }),
        Device::Other { kind } => {
            tracing::debug!(kind = %kind, "Ignoring device without a libvirt mapping");
        }
    }
}

/// Host side of the guest agent's serial channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSocket {
    pub device_id: String,
    pub id: String,
    pub host_path: PathBuf,
    pub name: String,
}

impl AgentSocket {
    /// Socket for `sandbox_id` under the VM storage root.
    ///
    /// # Errors
    /// Returns an error if the socket path is too long.
    pub fn for_sandbox(paths: &StorePaths, sandbox_id: &str) -> Result<Self> {
        Ok(Self {
            device_id: "channel0".into(),
            id: "charch0".into(),
            host_path: socket_path(&paths.vm_storage, &[sandbox_id, AGENT_SOCKET])?,
            name: "agent.channel.0".into(),
        })
    }
}

impl From<AgentSocket> for Device {
    fn from(sock: AgentSocket) -> Self {
        Device::ConsoleChannel {
            host_path: sock.host_path,
            name: sock.name,
        }
    }
}
