//! Reset Executor
//!
//! Device operations open the usbfs node, issue one request and close it.
//! Hub and controller resets detach the driver and attach it again:
//!
//! ```text
//! Idle -> Unbound -> RebindPending -> Bound
//! ```
//!
//! The unbind and bind writes are independent. A failure after `Unbound`
//! leaves the branch without a driver (no power to downstream devices) and is
//! reported as [`ResetError::PartialReset`] so the bind can be retried by hand.
//! An interrupt seen after `Unbound` ([`Backend::interrupted`]) ends the
//! sequence there and is reported the same way; operations that have not
//! started yet are skipped.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{ResetError, Result};
use crate::{ControllerRecord, DeviceRecord, HubRecord};

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
const GENERIC_USB_DRIVER: &str = "usb";

/// Request sent to a device node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    Reset,
    Disconnect,
    Connect,
}

impl DeviceSignal {
    pub fn name(self) -> &'static str {
        match self {
            DeviceSignal::Reset => "reset",
            DeviceSignal::Disconnect => "disconnect",
            DeviceSignal::Connect => "connect",
        }
    }
}

/// The OS side of the executor.
pub trait Backend {
    /// Open `node` exclusively, issue `signal`, close it.
    fn device_request(&self, node: &Path, signal: DeviceSignal) -> Result<()>;

    /// Write `value` into a driver control file (`bind` / `unbind`).
    fn write_control(&self, file: &Path, value: &str) -> io::Result<()>;

    /// Give the kernel time to release the device after an unbind.
    fn settle(&self, delay: Duration) {
        thread::sleep(delay);
    }

    /// Whether the user asked the process to stop (SIGINT / SIGTERM).
    fn interrupted(&self) -> bool {
        false
    }
}

impl<B: Backend + ?Sized> Backend for &B {
    fn device_request(&self, node: &Path, signal: DeviceSignal) -> Result<()> {
        (**self).device_request(node, signal)
    }

    fn write_control(&self, file: &Path, value: &str) -> io::Result<()> {
        (**self).write_control(file, value)
    }

    fn settle(&self, delay: Duration) {
        (**self).settle(delay)
    }

    fn interrupted(&self) -> bool {
        (**self).interrupted()
    }
}

/// Where and what to write to detach / attach a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTarget {
    /// Driver directory holding the `bind` and `unbind` files
    pub control_dir: PathBuf,
    /// Identifier written to both files
    pub id: String,
    /// Path shown in status lines
    pub display_path: PathBuf,
}

impl BindTarget {
    pub fn for_hub(sys_root: &Path, hub: &HubRecord) -> Self {
        Self {
            control_dir: usb_driver_dir(sys_root, &hub.driver_name),
            id: hub.kernel_name.clone(),
            display_path: hub.sysfs_path.clone(),
        }
    }

    /// The device's own binding, used when a hub is named by its device node.
    pub fn for_device(sys_root: &Path, device: &DeviceRecord) -> Self {
        let driver = device.driver.as_deref().unwrap_or(GENERIC_USB_DRIVER);
        Self {
            control_dir: usb_driver_dir(sys_root, driver),
            id: device.kernel_name.clone(),
            display_path: device.sysfs_path.clone(),
        }
    }

    pub fn for_controller(controller: &ControllerRecord) -> Result<Self> {
        Self::split(&controller.driver_bind_path)
    }

    /// Interpret a user-supplied sysfs path.
    ///
    /// The last component is the identifier. Paths inside a PCI or USB driver
    /// directory use that directory for control; anything else (for example
    /// `/sys/bus/usb/devices/1-1`) goes through the generic usb driver.
    pub fn from_path(sys_root: &Path, path: &Path) -> Result<Self> {
        let Self {
            control_dir,
            id,
            display_path,
        } = Self::split(path)?;

        let pci_drivers = sys_root.join("bus/pci/drivers");
        let usb_drivers = sys_root.join("bus/usb/drivers");
        let control_dir = if control_dir.starts_with(&pci_drivers) || control_dir.starts_with(&usb_drivers) {
            control_dir
        } else {
            usb_driver_dir(sys_root, GENERIC_USB_DRIVER)
        };

        Ok(Self {
            control_dir,
            id,
            display_path,
        })
    }

    fn split(path: &Path) -> Result<Self> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ResetError::invalid(format!("{} does not name a device", path.display())))?;
        let control_dir = path
            .parent()
            .ok_or_else(|| ResetError::invalid(format!("{} has no parent directory", path.display())))?;

        Ok(Self {
            control_dir: control_dir.to_path_buf(),
            id: id.to_string(),
            display_path: path.to_path_buf(),
        })
    }

    pub fn unbind_file(&self) -> PathBuf {
        self.control_dir.join("unbind")
    }

    pub fn bind_file(&self) -> PathBuf {
        self.control_dir.join("bind")
    }
}

/// Operation skipped because the process is shutting down.
fn interrupted(op: &'static str, path: &Path) -> ResetError {
    ResetError::Io {
        op,
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Interrupted, "interrupted, not attempted"),
    }
}

fn usb_driver_dir(sys_root: &Path, driver: &str) -> PathBuf {
    sys_root.join("bus/usb/drivers").join(driver)
}

/// Result of one operation on one target.
#[derive(Debug)]
pub struct Outcome {
    pub target: PathBuf,
    /// Status lines, in the order the steps were started
    pub steps: Vec<String>,
    pub error: Option<ResetError>,
}

impl Outcome {
    fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            steps: Vec::new(),
            error: None,
        }
    }

    fn failed(mut self, error: ResetError) -> Self {
        log::debug!("{}: {}", self.target.display(), error);
        self.error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Idle,
    Unbound,
    RebindPending,
    Bound,
}

pub struct Executor<B> {
    backend: B,
    sys_root: PathBuf,
    settle_delay: Duration,
}

impl<B: Backend> Executor<B> {
    pub fn new(backend: B, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            sys_root: sys_root.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn sys_root(&self) -> &Path {
        &self.sys_root
    }

    pub fn reset_device(&self, device: &DeviceRecord) -> Outcome {
        self.signal_device(device, DeviceSignal::Reset)
    }

    pub fn signal_device(&self, device: &DeviceRecord, signal: DeviceSignal) -> Outcome {
        let node = &device.device_path;
        let mut outcome = Outcome::new(node);
        if self.backend.interrupted() {
            return outcome.failed(interrupted(signal.name(), node));
        }
        outcome.steps.push(match signal {
            DeviceSignal::Reset => format!("Resetting usb device {}", node.display()),
            other => format!("Sending signal {} to usb device {}", other.name(), node.display()),
        });

        match self.backend.device_request(node, signal) {
            Ok(()) => outcome,
            Err(e) => outcome.failed(e),
        }
    }

    pub fn reset_hub(&self, hub: &HubRecord) -> Outcome {
        self.rebind(&BindTarget::for_hub(&self.sys_root, hub))
    }

    pub fn reset_controller(&self, controller: &ControllerRecord) -> Outcome {
        match BindTarget::for_controller(controller) {
            Ok(target) => self.rebind(&target),
            Err(e) => Outcome::new(&controller.driver_bind_path).failed(e),
        }
    }

    /// Unbind, wait, bind. Bind is never attempted when unbind fails.
    pub fn rebind(&self, target: &BindTarget) -> Outcome {
        let mut outcome = Outcome::new(&target.display_path);
        let mut state = BindState::Idle;
        log::debug!("{}: {:?}", target.display_path.display(), state);

        if self.backend.interrupted() {
            return outcome.failed(interrupted("unbind", &target.display_path));
        }

        let unbind_file = target.unbind_file();
        outcome.steps.push(format!("unbind hub {}", target.display_path.display()));
        if let Err(e) = self.backend.write_control(&unbind_file, &target.id) {
            return outcome.failed(ResetError::from_io("write", &unbind_file, e));
        }
        state = BindState::Unbound;
        log::debug!("{}: {:?}", target.display_path.display(), state);

        self.backend.settle(self.settle_delay);
        state = BindState::RebindPending;
        log::debug!("{}: {:?}", target.display_path.display(), state);

        let bind_file = target.bind_file();
        // stopping here leaves the branch unbound
        if self.backend.interrupted() {
            return outcome.failed(ResetError::PartialReset {
                path: target.display_path.clone(),
                id: target.id.clone(),
                bind_file,
                source: io::Error::new(io::ErrorKind::Interrupted, "interrupted before bind"),
            });
        }
        outcome.steps.push(format!("bind hub {}", target.display_path.display()));
        if let Err(e) = self.backend.write_control(&bind_file, &target.id) {
            return outcome.failed(ResetError::PartialReset {
                path: target.display_path.clone(),
                id: target.id.clone(),
                bind_file,
                source: e,
            });
        }
        state = BindState::Bound;
        log::debug!("{}: {:?}", target.display_path.display(), state);

        outcome
    }

    /// Detach the driver only; the branch stays off until [`Executor::bind`].
    pub fn unbind(&self, target: &BindTarget) -> Outcome {
        let mut outcome = Outcome::new(&target.display_path);
        if self.backend.interrupted() {
            return outcome.failed(interrupted("unbind", &target.display_path));
        }
        let file = target.unbind_file();
        outcome.steps.push(format!("unbind hub {}", target.display_path.display()));
        match self.backend.write_control(&file, &target.id) {
            Ok(()) => outcome,
            Err(e) => outcome.failed(ResetError::from_io("write", &file, e)),
        }
    }

    pub fn bind(&self, target: &BindTarget) -> Outcome {
        let mut outcome = Outcome::new(&target.display_path);
        if self.backend.interrupted() {
            return outcome.failed(interrupted("bind", &target.display_path));
        }
        let file = target.bind_file();
        outcome.steps.push(format!("bind hub {}", target.display_path.display()));
        match self.backend.write_control(&file, &target.id) {
            Ok(()) => outcome,
            Err(e) => outcome.failed(ResetError::from_io("write", &file, e)),
        }
    }
}
