//! Sandbox identity recovery and host filesystem layout.
//!
//! A sandbox's libvirt domain lives under an embedded libvirt root whose final
//! path segment is the domain UUID without dashes. The link
//! `<vm-storage>/<id>/libvirt -> <root>` is the only durable record of that
//! root, so resolving an identity is a matter of reading the link back or,
//! on first creation, generating a fresh UUID.

use crate::config::StorePaths;
use crate::error::{Result, VmError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the link inside the per-sandbox VM directory.
pub const ROOT_LINK_NAME: &str = "libvirt";

/// Contents written to `<root>/etc/qemu.conf`.
pub const QEMU_CONF: &str = "stdio_handler = \"file\"\n";

/// Stable identity of one sandbox's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    sandbox_id: String,
    domain_uuid: Uuid,
    root_path: PathBuf,
}

impl SandboxIdentity {
    #[cfg(test)]
    pub(crate) fn from_parts(
        sandbox_id: &str,
        domain_uuid: Uuid,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            domain_uuid,
            root_path: root_path.into(),
        }
    }

    /// Sandbox ID this identity belongs to.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// UUID of the libvirt domain.
    pub fn domain_uuid(&self) -> Uuid {
        self.domain_uuid
    }

    /// Embedded libvirt root for this domain.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Connection URI for the embedded QEMU driver rooted at [`Self::root_path`].
    pub fn uri(&self) -> String {
        format!("qemu:///embed?root={}", self.root_path.display())
    }
}

/// Strip dashes from a canonical 8-4-4-4-12 UUID string, keeping its case.
pub fn uuid_remove_dashes(uuid: &str) -> Result<String> {
    if uuid.len() != 36 || Uuid::try_parse(uuid).is_err() {
        return Err(VmError::InvalidUuid(uuid.to_string()));
    }
    Ok(uuid.replace('-', ""))
}

/// Re-insert dashes into a 32 character hex UUID, keeping its case.
pub fn uuid_add_dashes(simple: &str) -> Result<String> {
    if simple.len() != 32 || !simple.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VmError::InvalidUuid(simple.to_string()));
    }
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &simple[..8],
        &simple[8..12],
        &simple[12..16],
        &simple[16..20],
        &simple[20..]
    ))
}

/// Recover the identity of `sandbox_id`, or mint a new one if none exists.
///
/// The root link is probed without following it. A missing link means the
/// sandbox has never been started on this host; any other error is fatal.
pub async fn resolve(sandbox_id: &str, paths: &StorePaths) -> Result<SandboxIdentity> {
    let link = paths.vm_path(sandbox_id).join(ROOT_LINK_NAME);

    match tokio::fs::read_link(&link).await {
        Ok(root_path) => {
            let segment = root_path
                .file_name()
                .and_then(|s| s.to_str())
                .ok_or_else(|| VmError::InvalidUuid(root_path.display().to_string()))?;
            let domain_uuid = Uuid::try_parse(&uuid_add_dashes(segment)?)
                .map_err(|_| VmError::InvalidUuid(segment.to_string()))?;

            tracing::debug!(
                sandbox_id,
                uuid = %domain_uuid,
                root = %root_path.display(),
                "Recovered sandbox identity"
            );

            Ok(SandboxIdentity {
                sandbox_id: sandbox_id.to_string(),
                domain_uuid,
                root_path,
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let domain_uuid = Uuid::new_v4();
            let root_path = paths
                .domain_roots()?
                .join(domain_uuid.simple().to_string());

            tracing::debug!(
                sandbox_id,
                uuid = %domain_uuid,
                root = %root_path.display(),
                "Generated sandbox identity"
            );

            Ok(SandboxIdentity {
                sandbox_id: sandbox_id.to_string(),
                domain_uuid,
                root_path,
            })
        }
        Err(e) => Err(VmError::fs(link, e)),
    }
}

/// Create the directories, config file and root link a domain needs.
///
/// Directory creation is idempotent. The link is written last so that a crash
/// part way through leaves no link and the next [`resolve`] starts over; a
/// link already pointing at this root is accepted.
pub async fn prepare_host_filesystem(identity: &SandboxIdentity, paths: &StorePaths) -> Result<()> {
    let id = identity.sandbox_id();
    let conf_dir = identity.root_path().join("etc");

    let dirs = [
        paths.run_path(id),
        paths.vm_path(id),
        identity.root_path().to_path_buf(),
        conf_dir.clone(),
    ];

    for dir in &dirs {
        create_dir(dir).await?;
        tracing::trace!(sandbox_id = id, path = %dir.display(), "Host directory created");
    }

    let qemu_conf = conf_dir.join("qemu.conf");
    tokio::fs::write(&qemu_conf, QEMU_CONF)
        .await
        .map_err(|e| VmError::fs(&qemu_conf, e))?;

    let link = paths.vm_path(id).join(ROOT_LINK_NAME);
    match tokio::fs::symlink(identity.root_path(), &link).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = tokio::fs::read_link(&link)
                .await
                .map_err(|e| VmError::fs(&link, e))?;
            if existing != identity.root_path() {
                return Err(VmError::fs(
                    &link,
                    std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        format!("link points at {}", existing.display()),
                    ),
                ));
            }
        }
        Err(e) => return Err(VmError::fs(&link, e)),
    }

    tracing::debug!(
        sandbox_id = id,
        link = %link.display(),
        target = %identity.root_path().display(),
        "Host filesystem prepared"
    );
    Ok(())
}

async fn create_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder
        .create(path)
        .await
        .map_err(|e| VmError::fs(path, e))
}
