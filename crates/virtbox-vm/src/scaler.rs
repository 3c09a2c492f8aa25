//! Online vCPU resize.

use crate::error::Result;
use crate::lifecycle::LifecycleController;

/// Outcome of one vCPU resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuAdjustment {
    /// Count the caller asked for
    pub requested: u32,
    /// Count actually requested from the control plane
    pub clamped_to: u32,
    /// Live count before the request
    pub previous: u32,
}

impl VcpuAdjustment {
    /// Count the domain was asked to converge to.
    pub fn applied(&self) -> u32 {
        self.clamped_to
    }

    /// Whether the request was capped by the domain's maximum.
    pub fn was_clamped(&self) -> bool {
        self.clamped_to != self.requested
    }

    /// Whether the domain already had the requested count.
    pub fn is_noop(&self) -> bool {
        self.previous == self.clamped_to
    }
}

impl LifecycleController {
    /// Set the live vCPU count of the running domain, capped at `max_vcpus`.
    ///
    /// Returns as soon as the control plane accepts the request. The guest
    /// brings vCPUs online asynchronously and this call does not wait for
    /// it; callers that need the new count in effect must poll for it.
    ///
    /// # Errors
    /// Connect, lookup, and vCPU query/set failures are returned unchanged.
    pub async fn resize_vcpus(&mut self, requested: u32, max_vcpus: u32) -> Result<VcpuAdjustment> {
        let clamped_to = requested.min(max_vcpus);
        if clamped_to != requested {
            tracing::warn!(requested, max_vcpus, "Capped vCPUs");
        }

        let domain = self.lookup().await?;
        let previous = domain.live_vcpus().await?;

        let adjustment = VcpuAdjustment {
            requested,
            clamped_to,
            previous,
        };

        if adjustment.is_noop() {
            tracing::debug!(vcpus = previous, "vCPU count unchanged");
            return Ok(adjustment);
        }

        domain.set_live_vcpus(clamped_to).await?;
        tracing::info!(previous, applied = clamped_to, "vCPU resize requested");

        Ok(adjustment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use crate::testing::{Call, FakeControlPlane};
    use std::sync::Arc;

    fn controller(plane: &FakeControlPlane) -> LifecycleController {
        LifecycleController::new(Arc::new(plane.clone()), "qemu:///embed?root=/r")
    }

    #[tokio::test]
    async fn test_resize_clamps_to_max() {
        let plane = FakeControlPlane::default();
        plane.set_online_vcpus(2);
        let mut ctl = controller(&plane);

        let adj = ctl.resize_vcpus(10, 4).await.unwrap();

        assert_eq!(adj.applied(), 4);
        assert_eq!(adj.previous, 2);
        assert!(adj.was_clamped());
        assert!(plane.calls().contains(&Call::SetVcpus(4)));
    }

    #[tokio::test]
    async fn test_resize_within_max() {
        let plane = FakeControlPlane::default();
        plane.set_online_vcpus(1);
        let mut ctl = controller(&plane);

        for requested in 1..=4 {
            let adj = ctl.resize_vcpus(requested, 4).await.unwrap();
            assert_eq!(adj.applied(), requested);
            assert!(!adj.was_clamped());
        }
    }

    #[tokio::test]
    async fn test_resize_noop_issues_no_mutation() {
        let plane = FakeControlPlane::default();
        plane.set_online_vcpus(3);
        let mut ctl = controller(&plane);

        let adj = ctl.resize_vcpus(3, 4).await.unwrap();

        assert_eq!(adj.previous, adj.applied());
        assert!(adj.is_noop());
        assert!(!plane
            .calls()
            .iter()
            .any(|c| matches!(c, Call::SetVcpus(_))));
    }

    #[tokio::test]
    async fn test_resize_noop_after_clamp() {
        let plane = FakeControlPlane::default();
        plane.set_online_vcpus(4);
        let mut ctl = controller(&plane);

        let adj = ctl.resize_vcpus(8, 4).await.unwrap();

        assert_eq!((adj.previous, adj.applied()), (4, 4));
        assert!(!plane.calls().contains(&Call::SetVcpus(4)));
    }

    #[tokio::test]
    async fn test_resize_errors_propagate() {
        let plane = FakeControlPlane::default();
        plane.fail_on("get_vcpus");
        let mut ctl = controller(&plane);
        let err = ctl.resize_vcpus(2, 4).await.unwrap_err();
        assert!(matches!(err, VmError::ControlPlane { op: "get_vcpus", .. }));

        let plane = FakeControlPlane::default();
        plane.set_online_vcpus(1);
        plane.fail_on("set_vcpus");
        let mut ctl = controller(&plane);
        let err = ctl.resize_vcpus(2, 4).await.unwrap_err();
        assert!(matches!(err, VmError::ControlPlane { op: "set_vcpus", .. }));
        // No retry
        assert_eq!(
            plane
                .calls()
                .iter()
                .filter(|c| matches!(c, Call::SetVcpus(_)))
                .count(),
            1
        );
    }
}
