//! Driver install/remove orchestration.
//!
//! The gateway sits between the connection workers and the two OS-facing
//! collaborators (device enumeration and the driver-install primitive),
//! applying the filter policy and the bounded retry on pending
//! installations. No collaborator error escapes this boundary: every
//! outcome is mapped to the reply boolean plus a logged diagnostic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::filter::{ClassTriplet, FilterPolicy, Verdict};

/// An enumerated USB device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Opaque OS identifier for the node (sysfs port path on Linux).
    pub node_id: String,
    /// Name of the currently bound driver, if any.
    pub driver: Option<String>,
    /// Device-level class triplet.
    pub device_triplet: ClassTriplet,
    /// Per-interface class triplets; empty for non-composite devices.
    pub interface_triplets: Vec<ClassTriplet>,
}

/// Errors from the device-enumeration/removal collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DeviceOpError {
    #[error("device operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors from the driver-install primitive.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Another install for this device class is already in progress
    /// elsewhere on the system; the only retryable outcome.
    #[error("another driver installation is pending")]
    Pending,

    #[error("driver installation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver installation failed: {0}")]
    Other(String),
}

/// Device-enumeration/removal primitive.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    /// Locates the device node for (vid, pid), if present.
    async fn find_device(&self, vid: u16, pid: u16) -> Result<Option<DeviceNode>, DeviceOpError>;

    /// Uninstalls the named driver package from the node.
    async fn uninstall_package(
        &self,
        node: &DeviceNode,
        package: &str,
    ) -> Result<(), DeviceOpError>;

    /// Detaches the device node from the tree.
    async fn detach_node(&self, node: &DeviceNode) -> Result<(), DeviceOpError>;

    /// Triggers a device-tree rescan so a detached node can reappear under
    /// its original driver.
    async fn rescan(&self) -> Result<(), DeviceOpError>;
}

/// Driver-install primitive.
#[async_trait]
pub trait DriverInstaller: Send + Sync {
    /// Attempts to bind the managed driver to the node under `package`.
    async fn install_driver(&self, node: &DeviceNode, package: &str) -> Result<(), InstallError>;
}

/// Bounded retry policy for the pending-installation condition.
///
/// The budget is configuration, not a constant: the source history carries
/// both a 10 x 2000 ms and a 7 x 1000 ms variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(2000),
        }
    }
}

/// Internal failure taxonomy; surfaces only as log diagnostics.
#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("device not found")]
    NotFound,

    #[error("install denied by filter policy")]
    PolicyDenied,

    #[error("installation still pending after {attempts} attempts")]
    PendingExhausted { attempts: u32 },

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Device(#[from] DeviceOpError),
}

/// Orchestrates installs and removals against the collaborators.
///
/// Holds no per-connection state; one instance is shared read-only by every
/// connection worker.
pub struct DriverOpsGateway {
    enumerator: Arc<dyn DeviceEnumerator>,
    installer: Arc<dyn DriverInstaller>,
    policy: FilterPolicy,
    managed_driver: String,
    retry: RetryPolicy,
}

impl DriverOpsGateway {
    #[must_use]
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        installer: Arc<dyn DriverInstaller>,
        policy: FilterPolicy,
        managed_driver: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            enumerator,
            installer,
            policy,
            managed_driver: managed_driver.into(),
            retry,
        }
    }

    /// Name of the driver kind this broker manages.
    #[must_use]
    pub fn managed_driver(&self) -> &str {
        &self.managed_driver
    }

    /// Installs the managed driver for (vid, pid).
    ///
    /// Returns the reply boolean; failures are logged here, never
    /// propagated.
    pub async fn install(&self, vid: u16, pid: u16) -> bool {
        match self.try_install(vid, pid).await {
            Ok(()) => {
                tracing::info!(device = %device_id(vid, pid), "Install completed");
                true
            }
            Err(e) => {
                tracing::warn!(device = %device_id(vid, pid), error = %e, "Install failed");
                false
            }
        }
    }

    /// Removes the managed driver from (vid, pid).
    ///
    /// Returns the reply boolean; failures are logged here, never
    /// propagated.
    pub async fn remove(&self, vid: u16, pid: u16) -> bool {
        match self.try_remove(vid, pid).await {
            Ok(()) => {
                tracing::info!(device = %device_id(vid, pid), "Remove completed");
                true
            }
            Err(e) => {
                tracing::warn!(device = %device_id(vid, pid), error = %e, "Remove failed");
                false
            }
        }
    }

    async fn try_install(&self, vid: u16, pid: u16) -> Result<(), GatewayError> {
        let node = self
            .enumerator
            .find_device(vid, pid)
            .await?
            .ok_or(GatewayError::NotFound)?;

        if node.driver.as_deref() == Some(self.managed_driver.as_str()) {
            tracing::debug!(node = %node.node_id, "Managed driver already bound");
            return Ok(());
        }

        if self.policy.check(vid, pid, node.device_triplet, &node.interface_triplets)
            == Verdict::Deny
        {
            return Err(GatewayError::PolicyDenied);
        }

        let package = package_name(vid, pid);
        for attempt in 1..=self.retry.attempts {
            match self.installer.install_driver(&node, &package).await {
                Err(InstallError::Pending) => {
                    if attempt == 1 {
                        #[allow(clippy::cast_possible_truncation)]
                        let interval_ms = self.retry.interval.as_millis() as u64;
                        tracing::info!(
                            interval_ms,
                            attempts = self.retry.attempts,
                            "Another driver is installing, will retry"
                        );
                    }
                    tokio::time::sleep(self.retry.interval).await;
                }
                other => return other.map_err(GatewayError::from),
            }
        }
        Err(GatewayError::PendingExhausted {
            attempts: self.retry.attempts,
        })
    }

    async fn try_remove(&self, vid: u16, pid: u16) -> Result<(), GatewayError> {
        let node = self
            .enumerator
            .find_device(vid, pid)
            .await?
            .ok_or(GatewayError::NotFound)?;

        if node.driver.as_deref() != Some(self.managed_driver.as_str()) {
            tracing::debug!(node = %node.node_id, driver = ?node.driver, "Not managed, nothing to remove");
            return Ok(());
        }

        let package = package_name(vid, pid);
        self.enumerator.uninstall_package(&node, &package).await?;
        self.enumerator.detach_node(&node).await?;

        // best-effort final step: removal stays committed either way
        if let Err(e) = self.enumerator.rescan().await {
            tracing::warn!(error = %e, "Device-tree rescan failed after removal");
        }
        Ok(())
    }
}

/// `vid:pid` form used in log fields.
#[must_use]
pub fn device_id(vid: u16, pid: u16) -> String {
    format!("{vid:04x}:{pid:04x}")
}

/// Deterministic package name for a device, shared by install and remove.
#[must_use]
pub fn package_name(vid: u16, pid: u16) -> String {
    format!("usb_device_{vid:04x}_{pid:04x}")
}
