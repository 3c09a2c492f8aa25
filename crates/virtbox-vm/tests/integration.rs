//! Integration tests for virtbox-vm.
//!
//! The identity tests only need a writable filesystem. The lifecycle tests
//! require:
//! - Linux with /dev/kvm access
//! - libvirt with the embedded QEMU driver and `virsh`
//! - Kernel and initrd images
//!
//! Run with: `cargo test -p virtbox-vm -- --ignored`

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use virtbox_vm::identity::{self, uuid_add_dashes, uuid_remove_dashes};
use virtbox_vm::{
    DescriptorBuilder, LibvirtSandbox, LifecycleState, ResourceConfig, SharedFs, StorePaths,
    VirshControlPlane,
};

fn store(dir: &TempDir) -> StorePaths {
    StorePaths::new(dir.path().join("sbs"), dir.path().join("vm"))
}

/// Fresh sandbox: new UUID, root named after it, link created on prepare
#[tokio::test]
async fn test_fresh_identity_and_layout() {
    let dir = TempDir::new().unwrap();
    let paths = store(&dir);

    let identity = identity::resolve("sbx1", &paths).await.unwrap();
    let segment = identity
        .root_path()
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(segment, uuid_remove_dashes(&identity.domain_uuid().to_string()).unwrap());
    assert_eq!(uuid_add_dashes(&segment).unwrap(), identity.domain_uuid().to_string());

    identity::prepare_host_filesystem(&identity, &paths)
        .await
        .unwrap();
    let link = std::fs::read_link(paths.vm_path("sbx1").join("libvirt")).unwrap();
    assert_eq!(link, identity.root_path());

    let again = identity::resolve("sbx1", &paths).await.unwrap();
    assert_eq!(again, identity);
}

/// Separate sandboxes never share a root
#[tokio::test]
async fn test_identities_are_per_sandbox() {
    let dir = TempDir::new().unwrap();
    let paths = store(&dir);

    let a = identity::resolve("sbx-a", &paths).await.unwrap();
    let b = identity::resolve("sbx-b", &paths).await.unwrap();
    assert_ne!(a.domain_uuid(), b.domain_uuid());
    assert_ne!(a.root_path(), b.root_path());
}

/// Descriptor for the reference virtio-fs configuration
#[tokio::test]
async fn test_virtiofs_descriptor() {
    let dir = TempDir::new().unwrap();
    let paths = store(&dir);
    let config = ResourceConfig::builder()
        .vcpus(2)
        .max_vcpus(4)
        .memory_mib(2048)
        .shared_fs(SharedFs::VirtioFs)
        .build()
        .unwrap();
    let identity = identity::resolve("sbx1", &paths).await.unwrap();

    let descriptor = DescriptorBuilder::new(&identity, &config, &paths)
        .unwrap()
        .build();

    assert_eq!(descriptor.vcpu.current, 2);
    assert_eq!(descriptor.vcpu.max, 4);
    assert_eq!(descriptor.memory.value, 2048);
    let cell = &descriptor.cpu.numa.as_ref().unwrap().cell[0];
    assert_eq!(cell.cpus, "0-3");
    assert_eq!(cell.memory, 2048);
}

/// Full lifecycle against a real libvirt: define -> start -> resize -> stop.
/// Every step after connect goes through the same embedded-root connection
/// while its event pump is running.
#[tokio::test]
#[ignore = "requires Linux + KVM + libvirt"]
async fn test_sandbox_lifecycle() {
    let kernel_path = std::env::var("VIRTBOX_KERNEL_PATH")
        .unwrap_or_else(|_| "/usr/share/virtbox/vmlinux.container".to_string());
    let initrd_path = std::env::var("VIRTBOX_INITRD_PATH")
        .unwrap_or_else(|_| "/usr/share/virtbox/initrd.img".to_string());

    // Skip if files don't exist
    if !Path::new(&kernel_path).exists() || !Path::new(&initrd_path).exists() {
        eprintln!("Skipping test: kernel or initrd not found");
        eprintln!("Set VIRTBOX_KERNEL_PATH and VIRTBOX_INITRD_PATH environment variables");
        return;
    }

    let dir = TempDir::new().unwrap();
    let config = ResourceConfig::builder()
        .vcpus(1)
        .max_vcpus(2)
        .memory_mib(512)
        .kernel(&kernel_path)
        .initrd(&initrd_path)
        .hypervisor(
            std::env::var("VIRTBOX_HYPERVISOR_PATH")
                .unwrap_or_else(|_| "/usr/bin/qemu-system-x86_64".to_string()),
        )
        .build()
        .expect("invalid config");

    let mut sandbox = LibvirtSandbox::create(
        "it-lifecycle",
        config,
        store(&dir),
        Arc::new(VirshControlPlane::default()),
    )
    .await
    .expect("Failed to create sandbox");

    sandbox.start().await.expect("Failed to start domain");
    assert_eq!(sandbox.state(), LifecycleState::Running);

    let adj = sandbox.resize_vcpus(8).await.expect("Failed to resize vCPUs");
    assert_eq!(adj.applied(), 2);
    assert!(adj.was_clamped());

    // A second start on the live domain is refused without touching it
    assert!(sandbox.start().await.is_err());
    assert_eq!(sandbox.state(), LifecycleState::Running);

    sandbox.stop().await.expect("Failed to stop domain");
    assert_eq!(sandbox.state(), LifecycleState::Disconnected);
}
