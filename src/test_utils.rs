//! Test utilities
//!
//! [`FakeSysfs`] lays out a simulated sysfs tree (devices, `bus/usb/devices`
//! links, driver directories with `bind` / `unbind` files) under any
//! directory, and [`RecordingBackend`] stands in for the OS side of the
//! reset executor.
//!
//! # Example
//!
//! ```
//! use usb_resetter::test_utils::{FakeDevice, FakeSysfs};
//! use usb_resetter::Enumerator;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let sys = FakeSysfs::new(dir.path());
//! let xhci = sys.controller("xhci_hcd", "0000:00:14.0");
//! let root = sys.root_hub(&xhci, 1);
//! sys.device(&root, FakeDevice::new("1-1", 1, 2, 0x1199, 0x9071));
//!
//! let count = Enumerator::new(sys.root(), "/dev/bus/usb").enumerate().unwrap().count();
//! assert_eq!(count, 2);
//! ```

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ResetError, Result};
use crate::reset::{Backend, DeviceSignal};
use crate::USB_CLASS_HUB;

/// Descriptor set of a simulated device
#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub name: String,
    pub bus: u32,
    pub address: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl FakeDevice {
    pub fn new(name: &str, bus: u32, address: u32, vendor_id: u16, product_id: u16) -> Self {
        Self {
            name: name.to_string(),
            bus,
            address,
            vendor_id,
            product_id,
            class: 0,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    pub fn hub(mut self) -> Self {
        self.class = USB_CLASS_HUB;
        self
    }

    pub fn manufacturer(mut self, s: &str) -> Self {
        self.manufacturer = Some(s.to_string());
        self
    }

    pub fn product(mut self, s: &str) -> Self {
        self.product = Some(s.to_string());
        self
    }

    pub fn serial(mut self, s: &str) -> Self {
        self.serial = Some(s.to_string());
        self
    }
}

/// Simulated sysfs tree. Helpers panic on I/O errors.
pub struct FakeSysfs {
    root: PathBuf,
}

impl FakeSysfs {
    /// `root` must exist; it is canonicalized so that paths returned by the
    /// builder compare equal to enumerated ones.
    pub fn new(root: &Path) -> Self {
        let root = fs::canonicalize(root).expect("fake sysfs root");
        let sys = Self { root };
        fs::create_dir_all(sys.root.join("devices/pci0000:00")).expect("devices");
        fs::create_dir_all(sys.root.join("bus/usb/devices")).expect("bus/usb/devices");
        fs::create_dir_all(sys.root.join("bus/pci/drivers")).expect("bus/pci/drivers");
        sys.driver_dir(&sys.usb_driver_dir());
        sys
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn usb_driver_dir(&self) -> PathBuf {
        self.root.join("bus/usb/drivers/usb")
    }

    pub fn pci_driver_dir(&self, driver: &str) -> PathBuf {
        self.root.join("bus/pci/drivers").join(driver)
    }

    fn driver_dir(&self, dir: &Path) {
        fs::create_dir_all(dir).expect("driver dir");
        for file in ["bind", "unbind"] {
            let path = dir.join(file);
            if !path.exists() {
                fs::write(&path, "").expect("control file");
            }
        }
    }

    /// PCI host controller bound to `driver`; returns its device directory.
    pub fn controller(&self, driver: &str, pci_address: &str) -> PathBuf {
        let dev_dir = self.root.join("devices/pci0000:00").join(pci_address);
        fs::create_dir_all(&dev_dir).expect("controller dir");

        let driver_dir = self.pci_driver_dir(driver);
        self.driver_dir(&driver_dir);
        symlink(&dev_dir, driver_dir.join(pci_address)).expect("driver -> device link");
        symlink(&driver_dir, dev_dir.join("driver")).expect("device -> driver link");
        dev_dir
    }

    /// Linux Foundation root hub `usb<bus>` below a controller.
    pub fn root_hub(&self, controller_dir: &Path, bus: u32) -> PathBuf {
        self.device(
            controller_dir,
            FakeDevice::new(&format!("usb{}", bus), bus, 1, 0x1d6b, 0x0002)
                .hub()
                .manufacturer("Linux Foundation")
                .product("2.0 root hub"),
        )
    }

    /// Device below `parent`, bound to the generic usb driver.
    pub fn device(&self, parent: &Path, device: FakeDevice) -> PathBuf {
        let dir = parent.join(&device.name);
        fs::create_dir_all(&dir).expect("device dir");

        let write = |name: &str, value: String| {
            fs::write(dir.join(name), format!("{}\n", value)).expect("attribute");
        };
        write("idVendor", format!("{:04x}", device.vendor_id));
        write("idProduct", format!("{:04x}", device.product_id));
        write("busnum", device.bus.to_string());
        write("devnum", device.address.to_string());
        write("bDeviceClass", format!("{:02x}", device.class));
        if let Some(s) = device.manufacturer {
            write("manufacturer", s);
        }
        if let Some(s) = device.product {
            write("product", s);
        }
        if let Some(s) = device.serial {
            write("serial", s);
        }

        symlink(self.usb_driver_dir(), dir.join("driver")).expect("device -> driver link");
        symlink(&dir, self.root.join("bus/usb/devices").join(&device.name)).expect("bus link");
        dir
    }

    /// Interface entry (`1-1:1.0`) below a device.
    pub fn interface(&self, device_dir: &Path, name: &str) -> PathBuf {
        let dir = device_dir.join(name);
        fs::create_dir_all(&dir).expect("interface dir");
        fs::write(dir.join("bInterfaceClass"), "ff\n").expect("attribute");
        symlink(&dir, self.root.join("bus/usb/devices").join(name)).expect("bus link");
        dir
    }
}

/// One backend interaction, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Device { node: PathBuf, signal: DeviceSignal },
    Write { file: PathBuf, value: String },
    Settle(Duration),
}

/// Backend that records calls instead of touching the system.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: RefCell<Vec<Call>>,
    failing_paths: Vec<(PathBuf, io::ErrorKind)>,
    failing_ids: Vec<(String, io::ErrorKind)>,
    interrupt_on_settle: bool,
    interrupted: Cell<bool>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any request on this device node or control file.
    pub fn failing_path(mut self, path: impl Into<PathBuf>, kind: io::ErrorKind) -> Self {
        self.failing_paths.push((path.into(), kind));
        self
    }

    /// Fail any control write of this identifier.
    pub fn failing_id(mut self, id: &str, kind: io::ErrorKind) -> Self {
        self.failing_ids.push((id.to_string(), kind));
        self
    }

    /// Behave as if SIGINT arrived during the first settle delay.
    pub fn interrupt_on_settle(mut self) -> Self {
        self.interrupt_on_settle = true;
        self
    }

    /// Behave as if SIGINT already arrived.
    pub fn interrupted_from_start(self) -> Self {
        self.interrupted.set(true);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Write { file, value } => Some((file.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn device_requests(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Device { node, .. } => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    fn failure_for_path(&self, path: &Path) -> Option<io::ErrorKind> {
        self.failing_paths
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, kind)| *kind)
    }
}

impl Backend for RecordingBackend {
    fn device_request(&self, node: &Path, signal: DeviceSignal) -> Result<()> {
        self.calls.borrow_mut().push(Call::Device {
            node: node.to_path_buf(),
            signal,
        });
        match self.failure_for_path(node) {
            Some(kind) => Err(ResetError::from_io("ioctl", node, io::Error::from(kind))),
            None => Ok(()),
        }
    }

    fn write_control(&self, file: &Path, value: &str) -> io::Result<()> {
        self.calls.borrow_mut().push(Call::Write {
            file: file.to_path_buf(),
            value: value.to_string(),
        });
        let by_id = self
            .failing_ids
            .iter()
            .find(|(id, _)| id == value)
            .map(|(_, kind)| *kind);
        match self.failure_for_path(file).or(by_id) {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }

    fn settle(&self, delay: Duration) {
        self.calls.borrow_mut().push(Call::Settle(delay));
        if self.interrupt_on_settle {
            self.interrupted.set(true);
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupted.get()
    }
}
