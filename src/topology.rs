//! Enumeration snapshot and Topology Resolver
//!
//! Parents are found by path-prefix matching over the canonical sysfs paths
//! of one snapshot: the nearest hub above a device is the deepest hub whose
//! path is a proper prefix of the device's path. Nothing is re-read from
//! disk, so resolving twice on the same snapshot gives the same answer.

use std::path::{Path, PathBuf};

use crate::enumerate::Enumerator;
use crate::error::{ResetError, Result};
use crate::{ControllerRecord, DeviceRecord, HubRecord};

const GENERIC_USB_DRIVER: &str = "usb";

/// Devices and controllers seen at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    sys_root: PathBuf,
    dev_root: PathBuf,
    devices: Vec<DeviceRecord>,
    controllers: Vec<ControllerRecord>,
}

impl Snapshot {
    /// Enumerate devices and controllers. Devices that fail to parse are
    /// logged and left out.
    pub fn capture(enumerator: &Enumerator) -> Result<Self> {
        let mut devices = Vec::new();
        for record in enumerator.enumerate()? {
            match record {
                Ok(device) => devices.push(device),
                Err(e) => log::warn!("Skipping device: {}", e),
            }
        }
        let controllers = enumerator.controllers()?;

        log::debug!(
            "Snapshot: {} devices, {} controllers",
            devices.len(),
            controllers.len()
        );

        Ok(Self::from_parts(
            enumerator.sys_root(),
            enumerator.dev_root(),
            devices,
            controllers,
        ))
    }

    pub fn from_parts(
        sys_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        mut devices: Vec<DeviceRecord>,
        controllers: Vec<ControllerRecord>,
    ) -> Self {
        devices.sort_by_key(|d| (d.bus_id, d.device_address));
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            devices,
            controllers,
        }
    }

    pub fn sys_root(&self) -> &Path {
        &self.sys_root
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// Devices in bus/address order.
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn controllers(&self) -> &[ControllerRecord] {
        &self.controllers
    }

    pub fn matching(&self, vendor_id: u16, product_id: u16) -> Vec<&DeviceRecord> {
        self.devices
            .iter()
            .filter(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .collect()
    }

    pub fn by_device_path(&self, node: &Path) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.device_path == node)
    }

    pub fn by_sysfs_path(&self, path: &Path) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.sysfs_path == path)
    }

    /// Hub whose port `device` is attached to.
    pub fn resolve_hub(&self, device: &DeviceRecord) -> Result<HubRecord> {
        self.nearest_hub(&device.sysfs_path)
            .map(|hub| self.hub_record(hub))
            .ok_or_else(|| ResetError::not_found("parent hub of", device.sysfs_path.clone()))
    }

    /// Host controller that roots the bus `device` is on.
    pub fn resolve_controller(&self, device: &DeviceRecord) -> Result<ControllerRecord> {
        self.controllers
            .iter()
            .filter(|c| is_proper_ancestor(&c.sysfs_path, &device.sysfs_path))
            .max_by_key(|c| depth(&c.sysfs_path))
            .cloned()
            .ok_or_else(|| ResetError::not_found("host controller of", device.sysfs_path.clone()))
    }

    /// Every hub in the snapshot, in bus/address order.
    pub fn hubs(&self) -> Vec<HubRecord> {
        self.devices
            .iter()
            .filter(|d| d.is_hub())
            .map(|hub| self.hub_record(hub))
            .collect()
    }

    fn nearest_hub(&self, path: &Path) -> Option<&DeviceRecord> {
        self.devices
            .iter()
            .filter(|d| d.is_hub() && is_proper_ancestor(&d.sysfs_path, path))
            .max_by_key(|d| depth(&d.sysfs_path))
    }

    fn hub_record(&self, hub: &DeviceRecord) -> HubRecord {
        let child_devices = self
            .devices
            .iter()
            .filter(|d| {
                self.nearest_hub(&d.sysfs_path)
                    .is_some_and(|parent| parent.sysfs_path == hub.sysfs_path)
            })
            .cloned()
            .collect();

        HubRecord {
            sysfs_path: hub.sysfs_path.clone(),
            kernel_name: hub.kernel_name.clone(),
            driver_name: hub
                .driver
                .clone()
                .unwrap_or_else(|| GENERIC_USB_DRIVER.to_string()),
            child_devices,
        }
    }
}

fn is_proper_ancestor(ancestor: &Path, path: &Path) -> bool {
    path != ancestor && path.starts_with(ancestor)
}

fn depth(path: &Path) -> usize {
    path.components().count()
}
