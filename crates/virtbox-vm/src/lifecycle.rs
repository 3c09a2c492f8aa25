//! Domain lifecycle against the control plane.
//!
//! ```text
//! Disconnected --connect--> Connected --lookup--> Defined
//! Connected --define--> Defined --create--> Running
//! Running --destroy--> Stopped --undefine--> Disconnected
//! ```
//!
//! `Stopped` is the defined-but-powered-off state reached by destroy.

use crate::control::{Connection, ControlPlane, Domain};
use crate::domain::{DomainDescriptor, DOMAIN_NAME};
use crate::error::{Result, VmError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Where the controller is in the domain lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No control plane connection
    Disconnected,
    /// Connected, no domain resolved
    Connected,
    /// Domain is defined but not known to be running
    Defined,
    /// Domain has been powered on
    Running,
    /// Domain was forced off and is still defined. Equivalent to `Defined`
    /// for what the control plane holds; undefine is the only way on.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Disconnected => write!(f, "disconnected"),
            LifecycleState::Connected => write!(f, "connected"),
            LifecycleState::Defined => write!(f, "defined"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Background task draining control plane events for one connection.
///
/// The task is never restarted. Once it fails the connection it serves is
/// considered broken.
struct EventPump {
    handle: JoinHandle<()>,
    failed: Arc<AtomicBool>,
}

impl EventPump {
    fn spawn(connection: Arc<dyn Connection>, uri: String) -> Self {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();

        let handle = tokio::spawn(async move {
            loop {
                match connection.next_event().await {
                    Ok(event) => tracing::trace!(uri = %uri, event = %event, "Control plane event"),
                    Err(e) => {
                        tracing::error!(uri = %uri, error = %e, "Event loop failed, connection is unusable");
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        Self { handle, failed }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || self.handle.is_finished()
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Owns the connection and domain handle for one sandbox.
///
/// Operations take `&mut self`; a controller has a single owner and calls
/// are issued one at a time. Nothing here outlives the process: a restarted
/// process reconnects and looks the domain up by name.
pub struct LifecycleController {
    plane: Arc<dyn ControlPlane>,
    uri: String,
    state: LifecycleState,
    connection: Option<Arc<dyn Connection>>,
    domain: Option<Arc<dyn Domain>>,
    pump: Option<EventPump>,
}

impl LifecycleController {
    /// Create a disconnected controller for `uri`.
    pub fn new(plane: Arc<dyn ControlPlane>, uri: impl Into<String>) -> Self {
        Self {
            plane,
            uri: uri.into(),
            state: LifecycleState::Disconnected,
            connection: None,
            domain: None,
            pump: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Connection URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Open the connection if there is none, starting the event pump.
    ///
    /// # Errors
    /// Returns [`VmError::EventLoop`] if the pump for the existing connection
    /// has died; the driver does not reconnect on its own.
    pub async fn connect(&mut self) -> Result<Arc<dyn Connection>> {
        if let Some(pump) = &self.pump {
            if pump.is_failed() {
                return Err(VmError::EventLoop(format!(
                    "event pump for {} has stopped",
                    self.uri
                )));
            }
        }

        if let Some(conn) = &self.connection {
            tracing::trace!(uri = %self.uri, "Reusing connection");
            return Ok(conn.clone());
        }

        self.plane.register_event_loop().await?;
        tracing::debug!(uri = %self.uri, "Event loop registered");

        let conn = self.plane.connect(&self.uri).await?;
        self.pump = Some(EventPump::spawn(conn.clone(), self.uri.clone()));
        self.connection = Some(conn.clone());
        self.state = LifecycleState::Connected;

        tracing::info!(uri = %self.uri, "Connected to control plane");
        Ok(conn)
    }

    /// Connect and resolve the sandbox domain by name.
    pub async fn lookup(&mut self) -> Result<Arc<dyn Domain>> {
        let conn = self.connect().await?;

        if let Some(domain) = &self.domain {
            return Ok(domain.clone());
        }

        let domain = conn.lookup_by_name(DOMAIN_NAME).await?;
        tracing::debug!(uri = %self.uri, name = DOMAIN_NAME, "Domain found");

        self.domain = Some(domain.clone());
        if self.state == LifecycleState::Connected {
            self.state = LifecycleState::Defined;
        }
        Ok(domain)
    }

    /// Define the domain from `descriptor` and power it on.
    ///
    /// A failure after define leaves the domain defined; [`Self::stop`]
    /// removes it.
    ///
    /// # Errors
    /// Returns [`VmError::InvalidState`] unless the controller is
    /// disconnected or connected with no domain resolved.
    pub async fn define_and_start(&mut self, descriptor: &DomainDescriptor) -> Result<()> {
        if !matches!(
            self.state,
            LifecycleState::Disconnected | LifecycleState::Connected
        ) {
            return Err(VmError::InvalidState {
                expected: "disconnected or connected".into(),
                actual: self.state.to_string(),
            });
        }

        let xml = descriptor.to_xml()?;
        tracing::debug!(uri = %self.uri, xml = %xml, "Defining domain");

        let conn = self.connect().await?;

        let domain = conn.define_xml(&descriptor.name, &xml).await?;
        self.domain = Some(domain.clone());
        self.state = LifecycleState::Defined;
        tracing::debug!(uri = %self.uri, "Domain defined");

        domain.create().await?;
        self.state = LifecycleState::Running;
        tracing::info!(uri = %self.uri, uuid = %descriptor.uuid, "Domain started");

        Ok(())
    }

    /// Force the domain off and remove its definition.
    ///
    /// A failed destroy is logged and ignored since the domain may already be
    /// off. A failed undefine is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let domain = self.lookup().await?;

        match domain.destroy().await {
            Ok(()) => {
                self.state = LifecycleState::Stopped;
                tracing::debug!(uri = %self.uri, "Domain destroyed");
            }
            Err(e) => {
                tracing::warn!(uri = %self.uri, error = %e, "Failed to destroy domain");
            }
        }

        domain.undefine().await?;
        tracing::info!(uri = %self.uri, "Domain undefined");

        self.domain = None;
        self.connection = None;
        self.pump = None;
        self.state = LifecycleState::Disconnected;
        Ok(())
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_descriptor, Call, FakeControlPlane};
    use tokio_test::{assert_err, assert_ok};

    fn controller(plane: &FakeControlPlane) -> LifecycleController {
        LifecycleController::new(Arc::new(plane.clone()), "qemu:///embed?root=/r")
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let plane = FakeControlPlane::default();
        let mut ctl = controller(&plane);

        assert_eq!(ctl.state(), LifecycleState::Disconnected);
        assert_ok!(ctl.connect().await);
        assert_ok!(ctl.connect().await);

        assert_eq!(ctl.state(), LifecycleState::Connected);
        assert_eq!(
            plane.calls(),
            vec![
                Call::RegisterEventLoop,
                Call::Connect("qemu:///embed?root=/r".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_define_and_start() {
        let plane = FakeControlPlane::default();
        let mut ctl = controller(&plane);

        assert_ok!(ctl.define_and_start(&sample_descriptor()).await);

        assert_eq!(ctl.state(), LifecycleState::Running);
        let calls = plane.calls();
        assert!(matches!(calls[2], Call::Define(ref xml) if xml.contains("<name>sandbox</name>")));
        assert_eq!(calls[3], Call::Create);
    }

    #[tokio::test]
    async fn test_define_and_start_rejects_live_domain() {
        let plane = FakeControlPlane::default();
        let mut ctl = controller(&plane);
        let descriptor = sample_descriptor();

        assert_ok!(ctl.define_and_start(&descriptor).await);
        let err = ctl.define_and_start(&descriptor).await.unwrap_err();

        assert!(matches!(
            err,
            VmError::InvalidState { ref actual, .. } if actual == "running"
        ));
        assert_eq!(ctl.state(), LifecycleState::Running);
        let defines = plane
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Define(_)))
            .count();
        assert_eq!(defines, 1);
    }

    #[tokio::test]
    async fn test_define_and_start_after_lookup_is_rejected() {
        let plane = FakeControlPlane::default();
        let mut ctl = controller(&plane);

        assert!(ctl.lookup().await.is_ok());
        assert_eq!(ctl.state(), LifecycleState::Defined);

        assert_err!(ctl.define_and_start(&sample_descriptor()).await);
        assert!(!plane.calls().iter().any(|c| matches!(c, Call::Define(_))));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_domain_defined() {
        let plane = FakeControlPlane::default();
        plane.fail_on("create");
        let mut ctl = controller(&plane);

        let err = ctl.define_and_start(&sample_descriptor()).await.unwrap_err();
        assert!(matches!(err, VmError::ControlPlane { op: "create", .. }));
        assert_eq!(ctl.state(), LifecycleState::Defined);

        assert_ok!(ctl.stop().await);
        assert!(plane.calls().contains(&Call::Undefine));

        // Once undefined the domain can be defined again
        let err = ctl.define_and_start(&sample_descriptor()).await.unwrap_err();
        assert!(matches!(err, VmError::ControlPlane { op: "create", .. }));
    }

    #[tokio::test]
    async fn test_stop_tolerates_destroy_failure() {
        let plane = FakeControlPlane::default();
        plane.fail_on("destroy");
        let mut ctl = controller(&plane);

        assert_ok!(ctl.stop().await);

        let calls = plane.calls();
        assert!(calls.contains(&Call::Lookup("sandbox".into())));
        assert!(calls.contains(&Call::Destroy));
        assert_eq!(calls.last(), Some(&Call::Undefine));
        assert_eq!(ctl.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_propagates_undefine_failure() {
        let plane = FakeControlPlane::default();
        plane.fail_on("undefine");
        let mut ctl = controller(&plane);

        let err = ctl.stop().await.unwrap_err();
        assert!(matches!(err, VmError::ControlPlane { op: "undefine", .. }));
        // Destroyed but still defined
        assert_eq!(ctl.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let plane = FakeControlPlane::default();
        plane.fail_on("connect");
        let mut ctl = controller(&plane);

        let err = ctl.connect().await.err().unwrap();
        assert!(matches!(err, VmError::Connect(_)));
        assert_eq!(ctl.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let plane = FakeControlPlane::default();
        plane.fail_on("lookup");
        let mut ctl = controller(&plane);

        assert_err!(ctl.stop().await);
        assert!(!plane.calls().contains(&Call::Undefine));
    }

    #[tokio::test]
    async fn test_event_pump_failure_invalidates_connection() {
        let plane = FakeControlPlane::default();
        plane.fail_on("event");
        let mut ctl = controller(&plane);

        assert_ok!(ctl.connect().await);
        // Let the pump observe the broken stream
        for _ in 0..100 {
            if ctl.pump.as_ref().is_some_and(|p| p.is_failed()) {
                break;
            }
            tokio::task::yield_now().await;
        }

        let err = ctl.connect().await.err().unwrap();
        assert!(matches!(err, VmError::EventLoop(_)));
    }
}
