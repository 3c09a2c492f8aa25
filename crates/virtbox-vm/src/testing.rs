//! Recording control plane used by unit tests.

use crate::builder::DescriptorBuilder;
use crate::config::{ResourceConfig, SharedFs, StorePaths};
use crate::control::{Connection, ControlPlane, Domain};
use crate::domain::DomainDescriptor;
use crate::error::{Result, VmError};
use crate::identity::SandboxIdentity;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RegisterEventLoop,
    Connect(String),
    Define(String),
    Lookup(String),
    Create,
    Destroy,
    Undefine,
    GetVcpus,
    SetVcpus(u32),
}

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    live_vcpus: AtomicU32,
}

/// Cloneable fake; every clone shares the same call log and settings.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    inner: Arc<Inner>,
}

impl FakeControlPlane {
    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Make `op` fail from now on.
    pub fn fail_on(&self, op: &'static str) {
        self.inner.failing.lock().unwrap().insert(op);
    }

    pub fn set_online_vcpus(&self, count: u32) {
        self.inner.live_vcpus.store(count, Ordering::SeqCst);
    }

    pub fn online_vcpus(&self) -> u32 {
        self.inner.live_vcpus.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call, op: &'static str) -> Result<()> {
        self.inner.calls.lock().unwrap().push(call);
        if self.inner.failing.lock().unwrap().contains(op) {
            return Err(match op {
                "connect" => VmError::Connect("connection refused".into()),
                "event" => VmError::EventLoop("event stream closed".into()),
                _ => VmError::rejected(op, "injected failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn register_event_loop(&self) -> Result<()> {
        self.record(Call::RegisterEventLoop, "register")
    }

    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        self.record(Call::Connect(uri.to_string()), "connect")?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Connection for FakeControlPlane {
    async fn define_xml(&self, _name: &str, xml: &str) -> Result<Arc<dyn Domain>> {
        self.record(Call::Define(xml.to_string()), "define")?;
        Ok(Arc::new(self.clone()))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn Domain>> {
        self.record(Call::Lookup(name.to_string()), "lookup")?;
        Ok(Arc::new(self.clone()))
    }

    async fn next_event(&self) -> Result<String> {
        if self.inner.failing.lock().unwrap().contains("event") {
            return Err(VmError::EventLoop("event stream closed".into()));
        }
        std::future::pending().await
    }
}

#[async_trait]
impl Domain for FakeControlPlane {
    async fn create(&self) -> Result<()> {
        self.record(Call::Create, "create")
    }

    async fn destroy(&self) -> Result<()> {
        self.record(Call::Destroy, "destroy")
    }

    async fn undefine(&self) -> Result<()> {
        self.record(Call::Undefine, "undefine")
    }

    async fn live_vcpus(&self) -> Result<u32> {
        self.record(Call::GetVcpus, "get_vcpus")?;
        Ok(self.online_vcpus())
    }

    async fn set_live_vcpus(&self, count: u32) -> Result<()> {
        self.record(Call::SetVcpus(count), "set_vcpus")?;
        self.set_online_vcpus(count);
        Ok(())
    }
}

/// Descriptor for a 2/4 vCPU, 2048 MiB virtio-fs sandbox.
pub fn sample_descriptor() -> DomainDescriptor {
    let paths = StorePaths::new("/run/vc/sbs", "/run/vc/vm");
    let identity = SandboxIdentity::from_parts(
        "sbx1",
        Uuid::nil(),
        "/run/vc/libvirt/00000000000000000000000000000000",
    );
    let config = ResourceConfig::builder()
        .vcpus(2)
        .max_vcpus(4)
        .memory_mib(2048)
        .shared_fs(SharedFs::VirtioFs)
        .build()
        .unwrap();
    DescriptorBuilder::new(&identity, &config, &paths)
        .unwrap()
        .build()
}
