//! Device Enumerator
//!
//! Walks `<sys_root>/bus/usb/devices`, where the kernel exposes one entry per
//! USB device (`usb1`, `1-1`, `1-1.4`) and per interface (`1-1:1.0`). Device
//! entries carry `idVendor`, `idProduct`, `busnum`, `devnum`, the string
//! descriptors and a `driver` link. Host controllers are found through the
//! PCI driver directories, `<sys_root>/bus/pci/drivers/<driver>/<pci address>`.

use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{ResetError, Result};
use crate::{ControllerRecord, DeviceRecord, device_node_path};

const ID_VENDOR: &str = "idVendor";
const ID_PRODUCT: &str = "idProduct";
const BUS_NUM: &str = "busnum";
const DEV_NUM: &str = "devnum";
const DEVICE_CLASS: &str = "bDeviceClass";
const MANUFACTURER: &str = "manufacturer";
const PRODUCT: &str = "product";
const USB_SERIAL: &str = "serial";

#[derive(Debug, Clone)]
pub struct Enumerator {
    sys_root: PathBuf,
    dev_root: PathBuf,
    controller_drivers: Vec<String>,
}

impl Enumerator {
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            controller_drivers: Config::default().controller_drivers,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            sys_root: config.sys_root.clone(),
            dev_root: config.dev_root.clone(),
            controller_drivers: config.controller_drivers.clone(),
        }
    }

    pub fn with_controller_drivers(mut self, drivers: Vec<String>) -> Self {
        self.controller_drivers = drivers;
        self
    }

    pub fn sys_root(&self) -> &Path {
        &self.sys_root
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    pub fn controller_drivers(&self) -> &[String] {
        &self.controller_drivers
    }

    fn usb_devices_dir(&self) -> PathBuf {
        self.sys_root.join("bus/usb/devices")
    }

    /// Start a fresh pass over the live device tree.
    ///
    /// The returned iterator reads each device lazily. A device whose
    /// descriptors cannot be read yields an `Err` item and the walk goes on.
    /// A missing USB subsystem yields an empty sequence; an unreadable one
    /// fails with `Permission`.
    pub fn enumerate(&self) -> Result<Devices> {
        let dir = self.usb_devices_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} does not exist, no USB devices", dir.display());
                None
            }
            Err(e) => return Err(ResetError::from_io("read", &dir, e)),
        };

        Ok(Devices {
            entries,
            dir,
            dev_root: self.dev_root.clone(),
        })
    }

    /// Every host controller bound to one of the configured drivers,
    /// ordered by binding path.
    pub fn controllers(&self) -> Result<Vec<ControllerRecord>> {
        let mut controllers = Vec::new();

        for driver in &self.controller_drivers {
            let driver_dir = self.sys_root.join("bus/pci/drivers").join(driver);
            let entries = match fs::read_dir(&driver_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ResetError::from_io("read", &driver_dir, e)),
            };

            for entry in entries {
                let entry = entry.map_err(|e| ResetError::from_io("read", &driver_dir, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                // bound devices are PCI addresses like 0000:00:14.0
                if !name.contains(':') {
                    continue;
                }

                let driver_bind_path = driver_dir.join(&name);
                let sysfs_path = match fs::canonicalize(&driver_bind_path) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Skipping controller {}: {}", driver_bind_path.display(), e);
                        continue;
                    }
                };
                let bus_id = root_hub_bus(&sysfs_path);

                controllers.push(ControllerRecord {
                    driver_bind_path,
                    sysfs_path,
                    bus_id,
                });
            }
        }

        controllers.sort_by(|a, b| a.driver_bind_path.cmp(&b.driver_bind_path));
        Ok(controllers)
    }
}

/// Lazy pass over `bus/usb/devices`. One-shot; call
/// [`Enumerator::enumerate`] again for a new pass.
pub struct Devices {
    entries: Option<ReadDir>,
    dir: PathBuf,
    dev_root: PathBuf,
}

impl Iterator for Devices {
    type Item = Result<DeviceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        loop {
            let entry = match entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(ResetError::from_io("read", &self.dir, e))),
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            // interfaces: "1-1:1.0"
            if name.contains(':') {
                continue;
            }

            return Some(read_device(&entry.path(), name, &self.dev_root));
        }
    }
}

fn read_device(entry: &Path, kernel_name: String, dev_root: &Path) -> Result<DeviceRecord> {
    let sysfs_path = fs::canonicalize(entry).map_err(|e| ResetError::from_io("resolve", entry, e))?;

    let vendor_id = required_attr(&sysfs_path, ID_VENDOR, |s| u16::from_str_radix(s, 16).ok())?;
    let product_id = required_attr(&sysfs_path, ID_PRODUCT, |s| u16::from_str_radix(s, 16).ok())?;
    let bus_id = required_attr(&sysfs_path, BUS_NUM, |s| s.parse::<u32>().ok())?;
    let device_address = required_attr(&sysfs_path, DEV_NUM, |s| s.parse::<u32>().ok())?;

    let device_class = attr(&sysfs_path, DEVICE_CLASS)
        .and_then(|s| u8::from_str_radix(&s, 16).ok())
        .unwrap_or(0);

    let driver = fs::read_link(sysfs_path.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));

    Ok(DeviceRecord {
        bus_id,
        device_address,
        vendor_id,
        product_id,
        manufacturer: attr(&sysfs_path, MANUFACTURER),
        product: attr(&sysfs_path, PRODUCT),
        serial: attr(&sysfs_path, USB_SERIAL),
        device_path: device_node_path(dev_root, bus_id, device_address),
        sysfs_path,
        kernel_name,
        device_class,
        driver,
    })
}

/// Optional attribute; missing, unreadable or blank reads as `None`.
fn attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn required_attr<T>(dir: &Path, name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    let path = dir.join(name);
    let raw = fs::read_to_string(&path).map_err(|e| ResetError::Io {
        op: "read",
        path: path.clone(),
        source: e,
    })?;
    parse(raw.trim()).ok_or_else(|| ResetError::Io {
        op: "parse",
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected value {:?}", raw.trim()),
        ),
        path,
    })
}

/// Lowest `usbN` child of a controller directory.
fn root_hub_bus(controller_dir: &Path) -> Option<u32> {
    fs::read_dir(controller_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("usb"))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .min()
}
