use std::fmt;
use std::path::{Path, PathBuf};

pub mod config;
pub mod dispatch;
pub mod enumerate;
pub mod error;
pub mod platform;
pub mod reset;
#[cfg(all(unix, any(test, feature = "test-utils")))]
pub mod test_utils;
pub mod topology;

pub use config::{AmbiguityPolicy, Config};
pub use dispatch::{DeviceSelector, Dispatcher, Mode, OperationResult, Target};
pub use enumerate::{Devices, Enumerator};
pub use error::{ResetError, Result};
pub use reset::{Backend, BindTarget, DeviceSignal, Executor, Outcome};
pub use topology::Snapshot;

#[cfg(target_os = "linux")]
pub use platform::linux::SystemBackend;

/// bDeviceClass of a hub
pub const USB_CLASS_HUB: u8 = 0x09;

/// A USB device as seen by one enumeration pass.
///
/// `(bus_id, device_address)` identifies the device at the time of the
/// snapshot; `(vendor_id, product_id)` may be shared by several devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub bus_id: u32,
    pub device_address: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    /// usbfs node, e.g. /dev/bus/usb/002/002
    pub device_path: PathBuf,
    /// Canonical topology entry, e.g. /sys/devices/pci0000:00/0000:00:14.0/usb2/2-1
    pub sysfs_path: PathBuf,
    /// Kernel name ("2-1", "usb2"), also the identifier written to bind/unbind
    pub kernel_name: String,
    pub device_class: u8,
    /// Name of the bound driver, if any
    pub driver: Option<String>,
}

impl DeviceRecord {
    pub fn is_hub(&self) -> bool {
        self.device_class == USB_CLASS_HUB
    }

    /// One line of the device listing.
    pub fn listing_line(&self) -> String {
        format!(
            "Found device {:04x}:{:04x} at {} Manufacturer={}, Product={}",
            self.vendor_id,
            self.product_id,
            self.device_path.display(),
            self.manufacturer.as_deref().unwrap_or("N/A"),
            self.product.as_deref().unwrap_or("N/A"),
        )
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {} addr {})",
            self.vendor_id, self.product_id, self.bus_id, self.device_address
        )
    }
}

/// A hub and the devices directly attached to its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRecord {
    pub sysfs_path: PathBuf,
    pub kernel_name: String,
    pub driver_name: String,
    pub child_devices: Vec<DeviceRecord>,
}

/// A host controller and its driver binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRecord {
    /// Driver-to-device binding entry, e.g. /sys/bus/pci/drivers/xhci_hcd/0000:00:14.0
    pub driver_bind_path: PathBuf,
    /// Canonical device directory of the controller
    pub sysfs_path: PathBuf,
    /// Lowest root-hub bus number below the controller, if it has one
    pub bus_id: Option<u32>,
}

/// usbfs node for a bus/address pair: `<dev_root>/BBB/DDD`.
pub fn device_node_path(dev_root: &Path, bus_id: u32, device_address: u32) -> PathBuf {
    dev_root
        .join(format!("{:03}", bus_id))
        .join(format!("{:03}", device_address))
}
