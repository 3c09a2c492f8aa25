//! LibvirtSandbox type - main interface for driving one sandbox's domain.

use crate::builder::DescriptorBuilder;
use crate::config::{Capabilities, ResourceConfig, StorePaths};
use crate::control::ControlPlane;
use crate::devices::{self, AgentSocket, Device};
use crate::domain::DomainDescriptor;
use crate::error::{Result, VmError};
use crate::identity::{self, SandboxIdentity};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::scaler::VcpuAdjustment;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A sandbox VM managed through libvirt.
///
/// Holds everything needed to (re)attach to the sandbox's domain: its
/// identity, its configuration, the descriptor it is defined from, and the
/// controller owning the control plane connection.
pub struct LibvirtSandbox {
    /// Paths supplied by the persistence layer
    paths: StorePaths,
    /// Configuration the sandbox was created with
    config: ResourceConfig,
    /// Domain UUID and root, stable across restarts
    identity: SandboxIdentity,
    /// Descriptor submitted on start
    descriptor: DomainDescriptor,
    /// Path the serial console is bound at
    console_path: PathBuf,
    controller: LifecycleController,
}

impl LibvirtSandbox {
    /// Prepare a sandbox's domain without touching the control plane.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Recover or mint the sandbox identity
    /// 3. Build the domain descriptor
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the identity
    /// cannot be resolved.
    pub async fn create(
        sandbox_id: &str,
        config: ResourceConfig,
        paths: StorePaths,
        plane: Arc<dyn ControlPlane>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            sandbox_id,
            vcpus = config.num_vcpus,
            max_vcpus = config.default_max_vcpus,
            memory_mib = config.memory_mib,
            shared_fs = %config.shared_fs,
            "Creating sandbox domain"
        );

        let identity = identity::resolve(sandbox_id, &paths).await?;
        let builder = DescriptorBuilder::new(&identity, &config, &paths)?;
        let descriptor = builder.build();
        let console_path = builder.console_path().to_path_buf();
        let controller = LifecycleController::new(plane, identity.uri());

        Ok(Self {
            paths,
            config,
            identity,
            descriptor,
            console_path,
            controller,
        })
    }

    /// Get the sandbox identity.
    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    /// Get the configuration used to create this sandbox.
    pub fn resource_config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Get the domain descriptor in its current form.
    pub fn descriptor(&self) -> &DomainDescriptor {
        &self.descriptor
    }

    /// Render the domain descriptor as it would be submitted.
    pub fn domain_xml(&self) -> Result<String> {
        self.descriptor.to_xml()
    }

    /// Get the serial console socket path.
    pub fn console_path(&self) -> &Path {
        &self.console_path
    }

    /// Get the lifecycle state of the domain.
    pub fn state(&self) -> LifecycleState {
        self.controller.state()
    }

    /// Features this driver offers; filesystem sharing is always available.
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.set_fs_sharing_support();
        caps
    }

    /// Register a device on the descriptor. Only meaningful before start.
    pub fn add_device(&mut self, device: Device) {
        tracing::debug!(sandbox_id = self.identity.sandbox_id(), device = %device, "Adding device");
        devices::attach(&mut self.descriptor, device, self.config.shared_fs);
    }

    /// Socket the guest agent will be reached through.
    ///
    /// # Errors
    /// The vsock transport is not supported; the guest is booted with
    /// `agent.use_vsock=false`.
    pub fn generate_socket(&self, use_vsock: bool) -> Result<AgentSocket> {
        if use_vsock {
            return Err(VmError::Unsupported("vsock agent transport"));
        }
        let sock = AgentSocket::for_sandbox(&self.paths, self.identity.sandbox_id())?;
        tracing::debug!(path = %sock.host_path.display(), "Generated agent socket");
        Ok(sock)
    }

    /// Prepare the host filesystem, define the domain and power it on.
    pub async fn start(&mut self) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::info!(sandbox_id = self.identity.sandbox_id(), "Starting sandbox domain");

        identity::prepare_host_filesystem(&self.identity, &self.paths).await?;
        self.controller.define_and_start(&self.descriptor).await?;

        tracing::info!(
            sandbox_id = self.identity.sandbox_id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox domain started"
        );
        Ok(())
    }

    /// Force the domain off and undefine it.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!(sandbox_id = self.identity.sandbox_id(), "Stopping sandbox domain");
        self.controller.stop().await
    }

    /// Change the number of online vCPUs, capped at the defined maximum.
    pub async fn resize_vcpus(&mut self, requested: u32) -> Result<VcpuAdjustment> {
        let max_vcpus = self.descriptor.vcpu.max;
        self.controller.resize_vcpus(requested, max_vcpus).await
    }

    /// Nothing to release; the connection lives until the sandbox is dropped.
    pub fn disconnect(&self) {
        tracing::info!(sandbox_id = self.identity.sandbox_id(), "disconnect() called");
    }

    /// Emulator process IDs are not tracked.
    pub fn get_pids(&self) -> Vec<u32> {
        tracing::info!(sandbox_id = self.identity.sandbox_id(), "get_pids() called");
        Vec::new()
    }

    /// Pause the domain. Not supported.
    pub async fn pause(&mut self) -> Result<()> {
        self.unsupported("pause")
    }

    /// Resume a paused domain. Not supported.
    pub async fn resume(&mut self) -> Result<()> {
        self.unsupported("resume")
    }

    /// Save the domain to disk. Not supported.
    pub async fn save(&mut self) -> Result<()> {
        self.unsupported("save")
    }

    /// Resize guest memory online. Not supported.
    pub async fn resize_memory(&mut self, _requested_mib: u32, _block_size_mib: u32) -> Result<u32> {
        self.unsupported("resize_memory")
    }

    /// Attach a device to the running domain. Not supported.
    pub async fn hotplug_add_device(&mut self, _device: Device) -> Result<()> {
        self.unsupported("hotplug_add_device")
    }

    /// Detach a device from the running domain. Not supported.
    pub async fn hotplug_remove_device(&mut self, _device: Device) -> Result<()> {
        self.unsupported("hotplug_remove_device")
    }

    /// vCPU thread IDs. Not supported.
    pub async fn get_thread_ids(&self) -> Result<Vec<u32>> {
        self.unsupported("get_thread_ids")
    }

    /// Release host resources. Not supported.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.unsupported("cleanup")
    }

    /// Health check of the domain. Not supported.
    pub async fn check(&self) -> Result<()> {
        self.unsupported("check")
    }

    /// Export state for live migration.
    pub fn to_grpc(&self) -> Result<Vec<u8>> {
        self.unsupported("to_grpc")
    }

    /// Import state exported by [`Self::to_grpc`].
    pub fn from_grpc(&mut self, _state: &[u8]) -> Result<()> {
        self.unsupported("from_grpc")
    }

    /// Serialize driver state for persistence. Not supported.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        self.unsupported("save_state")
    }

    /// Restore state written by [`Self::save_state`]. Not supported.
    pub fn load_state(&mut self, _state: &[u8]) -> Result<()> {
        self.unsupported("load_state")
    }

    fn unsupported<T>(&self, op: &'static str) -> Result<T> {
        tracing::info!(sandbox_id = self.identity.sandbox_id(), op, "Unsupported operation called");
        Err(VmError::Unsupported(op))
    }
}

impl std::fmt::Debug for LibvirtSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtSandbox")
            .field("identity", &self.identity)
            .field("state", &self.controller.state())
            .finish()
    }
}
