// Enumeration through libudev
// 通过 libudev 枚举设备
//
// Same records as the sysfs walk, but read from the udev database of the
// running system. Requires libudev at build time:
// 编译前需要安装 libudev 开发包：
//
// Debian/Ubuntu: sudo apt install libudev-dev
// Fedora: sudo dnf install systemd-devel
//

use std::io;
use std::path::Path;

use ::udev::{Device, Enumerator};

use crate::error::{ResetError, Result};
use crate::topology::Snapshot;
use crate::{DeviceRecord, device_node_path};

const ID_VENDOR: &str = "idVendor";
const ID_PRODUCT: &str = "idProduct";
const BUS_NUM: &str = "busnum";
const DEV_NUM: &str = "devnum";
const DEVICE_CLASS: &str = "bDeviceClass";
const USB_SERIAL: &str = "serial";

pub struct UdevScanner;

impl Default for UdevScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl UdevScanner {
    pub fn new() -> Self {
        Self
    }

    // Utility functions read sysfs attributes
    // Linux 的属性是 OsStr，我们需要转换成 String
    fn get_attribute(dev: &Device, key: &str) -> Option<String> {
        dev.attribute_value(key)
            .and_then(|s| s.to_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    // parse device
    // 解析设备
    fn parse_device(dev: &Device, dev_root: &Path) -> Option<DeviceRecord> {
        // Only devices of type "usb_device" are considered physical devices (excluding usb_interface).
        // 只有 "usb_device" 类型才算物理设备 (排除 usb_interface)
        if dev.devtype().and_then(|s| s.to_str()) != Some("usb_device") {
            return None;
        }

        // Read VID/PID (this is a hexadecimal string, such as "1a86")
        // 读取 VID / PID (这是 16 进制字符串，如 "1a86")
        let vendor_id = u16::from_str_radix(&Self::get_attribute(dev, ID_VENDOR)?, 16).ok()?;
        let product_id = u16::from_str_radix(&Self::get_attribute(dev, ID_PRODUCT)?, 16).ok()?;
        let bus_id = Self::get_attribute(dev, BUS_NUM)?.parse::<u32>().ok()?;
        let device_address = Self::get_attribute(dev, DEV_NUM)?.parse::<u32>().ok()?;

        let device_class = Self::get_attribute(dev, DEVICE_CLASS)
            .and_then(|s| u8::from_str_radix(&s, 16).ok())
            .unwrap_or(0);

        // Prefer the node udev reports; fall back to the usbfs naming convention
        // 优先使用 udev 给出的设备节点
        let device_path = dev
            .devnode()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| device_node_path(dev_root, bus_id, device_address));

        Some(DeviceRecord {
            bus_id,
            device_address,
            vendor_id,
            product_id,
            manufacturer: Self::get_attribute(dev, "manufacturer"),
            product: Self::get_attribute(dev, "product"),
            serial: Self::get_attribute(dev, USB_SERIAL),
            device_path,
            sysfs_path: dev.syspath().to_path_buf(),
            kernel_name: dev.sysname().to_string_lossy().into_owned(),
            device_class,
            driver: dev.driver().map(|d| d.to_string_lossy().into_owned()),
        })
    }

    /// All USB devices known to udev. Entries that do not parse are skipped.
    pub fn scan(&self, dev_root: &Path) -> Result<Vec<DeviceRecord>> {
        let udev_err = |e: io::Error| ResetError::from_io("enumerate", Path::new("udev"), e);

        let mut enumerator = Enumerator::new().map_err(udev_err)?;
        enumerator.match_subsystem("usb").map_err(udev_err)?;

        let mut devices = Vec::new();
        for dev in enumerator.scan_devices().map_err(udev_err)? {
            match Self::parse_device(&dev, dev_root) {
                Some(record) => devices.push(record),
                None if dev.devtype().and_then(|s| s.to_str()) == Some("usb_device") => {
                    log::warn!("Skipping device {}: unreadable descriptors", dev.syspath().display());
                }
                None => {}
            }
        }
        Ok(devices)
    }

    /// Snapshot built from udev devices and the sysfs controller walk.
    pub fn capture(&self, enumerator: &crate::Enumerator) -> Result<Snapshot> {
        let devices = self.scan(enumerator.dev_root())?;
        let controllers = enumerator.controllers()?;
        Ok(Snapshot::from_parts(
            enumerator.sys_root(),
            enumerator.dev_root(),
            devices,
            controllers,
        ))
    }
}
