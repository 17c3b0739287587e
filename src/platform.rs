//! Sysfs-backed collaborator implementations.
//!
//! Default wiring for the real broker on Linux: devices are enumerated
//! from `/sys/bus/usb/devices`, driver binding goes through the managed
//! driver's `bind`/`unbind` files, and node detach through the device's
//! `remove` file. Everything OS-specific stays behind the
//! [`DeviceEnumerator`]/[`DriverInstaller`] seams; the server and gateway
//! never touch sysfs themselves.
//!
//! The sysfs reads and writes here are tiny one-shot file operations, so
//! they are issued directly rather than through a blocking pool.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::filter::ClassTriplet;
use crate::gateway::{
    DeviceEnumerator, DeviceNode, DeviceOpError, DriverInstaller, InstallError,
};

const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/usb";

/// Device enumeration and removal over sysfs.
#[derive(Debug, Clone)]
pub struct SysfsBus {
    root: PathBuf,
}

impl SysfsBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }

    /// Uses an alternate sysfs root (useful for testing against a fake
    /// tree).
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("devices")
    }

    fn device_dir(&self, node_id: &str) -> PathBuf {
        self.devices_dir().join(node_id)
    }

    fn read_node(&self, node_id: &str, dir: &Path) -> Result<DeviceNode, DeviceOpError> {
        let driver = std::fs::read_link(dir.join("driver"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));

        let device_triplet = ClassTriplet {
            class: read_hex_attr(dir, "bDeviceClass")?,
            subclass: read_hex_attr(dir, "bDeviceSubClass")?,
            protocol: read_hex_attr(dir, "bDeviceProtocol")?,
        };

        let mut interface_triplets = Vec::new();
        let interface_prefix = format!("{node_id}:");
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&interface_prefix) {
                continue;
            }
            let iface = entry.path();
            interface_triplets.push(ClassTriplet {
                class: read_hex_attr(&iface, "bInterfaceClass")?,
                subclass: read_hex_attr(&iface, "bInterfaceSubClass")?,
                protocol: read_hex_attr(&iface, "bInterfaceProtocol")?,
            });
        }

        Ok(DeviceNode {
            node_id: node_id.to_string(),
            driver,
            device_triplet,
            interface_triplets,
        })
    }
}

impl Default for SysfsBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceEnumerator for SysfsBus {
    async fn find_device(&self, vid: u16, pid: u16) -> Result<Option<DeviceNode>, DeviceOpError> {
        for entry in std::fs::read_dir(self.devices_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // interface nodes carry a ':'; root hubs have no idVendor
            if name.contains(':') {
                continue;
            }
            let dir = entry.path();
            let Some(dev_vid) = read_id_attr(&dir, "idVendor") else {
                continue;
            };
            let Some(dev_pid) = read_id_attr(&dir, "idProduct") else {
                continue;
            };
            if dev_vid == vid && dev_pid == pid {
                return self.read_node(&name, &dir).map(Some);
            }
        }
        Ok(None)
    }

    async fn uninstall_package(
        &self,
        node: &DeviceNode,
        package: &str,
    ) -> Result<(), DeviceOpError> {
        let Some(driver) = node.driver.as_deref() else {
            tracing::debug!(node = %node.node_id, package, "No driver bound, nothing to uninstall");
            return Ok(());
        };
        let unbind = self.root.join("drivers").join(driver).join("unbind");
        tracing::debug!(node = %node.node_id, driver, package, "Unbinding driver");
        std::fs::write(unbind, &node.node_id)?;
        Ok(())
    }

    async fn detach_node(&self, node: &DeviceNode) -> Result<(), DeviceOpError> {
        let remove = self.device_dir(&node.node_id).join("remove");
        std::fs::write(remove, "1")?;
        Ok(())
    }

    async fn rescan(&self) -> Result<(), DeviceOpError> {
        // reprobe every driverless device node so a detached one can come
        // back under its original driver
        let probe = self.root.join("drivers_probe");
        for entry in std::fs::read_dir(self.devices_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(':') {
                continue;
            }
            if std::fs::read_link(entry.path().join("driver")).is_ok() {
                continue;
            }
            if let Err(e) = std::fs::write(&probe, &name) {
                tracing::debug!(node = %name, error = %e, "Reprobe failed");
            }
        }
        Ok(())
    }
}

/// Driver binding over sysfs.
#[derive(Debug, Clone)]
pub struct SysfsDriverHost {
    root: PathBuf,
    managed_driver: String,
}

impl SysfsDriverHost {
    #[must_use]
    pub fn new(managed_driver: impl Into<String>) -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            managed_driver: managed_driver.into(),
        }
    }

    /// Uses an alternate sysfs root (useful for testing against a fake
    /// tree).
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    fn driver_file(&self, driver: &str, file: &str) -> PathBuf {
        self.root.join("drivers").join(driver).join(file)
    }
}

#[async_trait]
impl DriverInstaller for SysfsDriverHost {
    async fn install_driver(&self, node: &DeviceNode, package: &str) -> Result<(), InstallError> {
        if let Some(current) = node.driver.as_deref() {
            tracing::debug!(node = %node.node_id, current, "Unbinding current driver");
            std::fs::write(self.driver_file(current, "unbind"), &node.node_id)
                .map_err(map_install_err)?;
        }
        tracing::debug!(
            node = %node.node_id,
            driver = %self.managed_driver,
            package,
            "Binding managed driver"
        );
        std::fs::write(self.driver_file(&self.managed_driver, "bind"), &node.node_id)
            .map_err(map_install_err)?;
        Ok(())
    }
}

/// A busy bind target means another installation holds the device; that is
/// the one retryable outcome.
fn map_install_err(e: std::io::Error) -> InstallError {
    if e.kind() == ErrorKind::ResourceBusy {
        InstallError::Pending
    } else {
        InstallError::Io(e)
    }
}

/// Reads a two-byte hex attribute like `idVendor` (no `0x` prefix in
/// sysfs).
fn read_id_attr(dir: &Path, attr: &str) -> Option<u16> {
    let raw = std::fs::read_to_string(dir.join(attr)).ok()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

/// Reads a one-byte hex attribute like `bDeviceClass`.
fn read_hex_attr(dir: &Path, attr: &str) -> Result<u8, DeviceOpError> {
    let raw = std::fs::read_to_string(dir.join(attr))?;
    u8::from_str_radix(raw.trim(), 16)
        .map_err(|_| DeviceOpError::Other(format!("bad {attr} value {:?}", raw.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_device(
        root: &Path,
        node_id: &str,
        vid: &str,
        pid: &str,
        class: &str,
        driver: Option<&str>,
    ) {
        let dir = root.join("devices").join(node_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("idVendor"), vid).unwrap();
        std::fs::write(dir.join("idProduct"), pid).unwrap();
        std::fs::write(dir.join("bDeviceClass"), class).unwrap();
        std::fs::write(dir.join("bDeviceSubClass"), "00").unwrap();
        std::fs::write(dir.join("bDeviceProtocol"), "00").unwrap();
        if let Some(driver) = driver {
            let driver_dir = root.join("drivers").join(driver);
            std::fs::create_dir_all(&driver_dir).unwrap();
            #[cfg(unix)]
            std::os::unix::fs::symlink(&driver_dir, dir.join("driver")).unwrap();
        }
    }

    fn write_interface(root: &Path, node_id: &str, suffix: &str, class: &str) {
        let dir = root.join("devices").join(format!("{node_id}:{suffix}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bInterfaceClass"), class).unwrap();
        std::fs::write(dir.join("bInterfaceSubClass"), "00").unwrap();
        std::fs::write(dir.join("bInterfaceProtocol"), "00").unwrap();
    }

    #[tokio::test]
    async fn find_device_reads_ids_and_driver() {
        let tree = tempfile::tempdir().unwrap();
        write_device(tree.path(), "1-4", "04b4", "0888", "00", Some("other_hcd"));
        let bus = SysfsBus::with_root(tree.path());

        let node = bus.find_device(0x04b4, 0x0888).await.unwrap().unwrap();
        assert_eq!(node.node_id, "1-4");
        assert_eq!(node.driver.as_deref(), Some("other_hcd"));

        assert!(bus.find_device(0x04b4, 0x0889).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_device_collects_interface_triplets() {
        let tree = tempfile::tempdir().unwrap();
        write_device(tree.path(), "1-4", "1234", "5678", "00", None);
        write_interface(tree.path(), "1-4", "1.0", "08");
        write_interface(tree.path(), "1-4", "1.1", "03");
        let bus = SysfsBus::with_root(tree.path());

        let node = bus.find_device(0x1234, 0x5678).await.unwrap().unwrap();
        assert_eq!(node.interface_triplets.len(), 2);
        let classes: Vec<u8> = node.interface_triplets.iter().map(|t| t.class).collect();
        assert!(classes.contains(&0x08));
        assert!(classes.contains(&0x03));
    }

    #[tokio::test]
    async fn interface_entries_are_not_devices() {
        let tree = tempfile::tempdir().unwrap();
        write_device(tree.path(), "1-4", "1234", "5678", "00", None);
        write_interface(tree.path(), "1-4", "1.0", "08");
        let bus = SysfsBus::with_root(tree.path());

        // scanning must not trip over the interface dir's missing idVendor
        assert!(bus.find_device(0xffff, 0xffff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn install_binds_managed_driver() {
        let tree = tempfile::tempdir().unwrap();
        write_device(tree.path(), "1-4", "1234", "5678", "00", None);
        std::fs::create_dir_all(tree.path().join("drivers/usb_generic")).unwrap();
        std::fs::write(tree.path().join("drivers/usb_generic/bind"), "").unwrap();

        let host = SysfsDriverHost::new("usb_generic").with_root(tree.path());
        let node = DeviceNode {
            node_id: "1-4".to_string(),
            driver: None,
            device_triplet: ClassTriplet::default(),
            interface_triplets: Vec::new(),
        };
        host.install_driver(&node, "usb_device_1234_5678").await.unwrap();
        let bound = std::fs::read_to_string(tree.path().join("drivers/usb_generic/bind")).unwrap();
        assert_eq!(bound, "1-4");
    }

    #[tokio::test]
    async fn uninstall_writes_unbind_for_bound_driver() {
        let tree = tempfile::tempdir().unwrap();
        write_device(tree.path(), "1-4", "1234", "5678", "00", Some("usb_generic"));
        std::fs::write(tree.path().join("drivers/usb_generic/unbind"), "").unwrap();
        let bus = SysfsBus::with_root(tree.path());

        let node = bus.find_device(0x1234, 0x5678).await.unwrap().unwrap();
        bus.uninstall_package(&node, "usb_device_1234_5678").await.unwrap();
        let unbound =
            std::fs::read_to_string(tree.path().join("drivers/usb_generic/unbind")).unwrap();
        assert_eq!(unbound, "1-4");
    }
}
