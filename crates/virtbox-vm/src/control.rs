//! Interface to the virtualization control plane.
//!
//! The driver only needs a handful of libvirt calls. They sit behind these
//! traits so the lifecycle logic can run against [`crate::VirshControlPlane`]
//! in production and a recording fake in tests.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Entry point to a control plane implementation.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Prepare the process-wide event loop. Called before every new connection;
    /// implementations must tolerate repeated calls.
    async fn register_event_loop(&self) -> Result<()>;

    /// Open a connection to `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>>;
}

/// An open control plane connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register the domain `name` from its XML description.
    async fn define_xml(&self, name: &str, xml: &str) -> Result<Arc<dyn Domain>>;

    /// Look up an already-defined domain.
    async fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn Domain>>;

    /// Wait for and consume the next control plane event.
    ///
    /// An error means the event transport is gone and the connection is
    /// unusable.
    async fn next_event(&self) -> Result<String>;
}

/// A defined domain.
#[async_trait]
pub trait Domain: Send + Sync {
    /// Power the domain on.
    async fn create(&self) -> Result<()>;

    /// Force the domain off.
    async fn destroy(&self) -> Result<()>;

    /// Remove the domain definition.
    async fn undefine(&self) -> Result<()>;

    /// vCPUs currently online in the running guest.
    async fn live_vcpus(&self) -> Result<u32>;

    /// Request a new live vCPU count. Returns once the request is accepted,
    /// not once the guest has converged.
    async fn set_live_vcpus(&self, count: u32) -> Result<()>;
}
