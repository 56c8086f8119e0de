//! Selector/Dispatcher
//!
//! Maps a target (`vendor:product`, an explicit hub path, or every host
//! controller) and a mode onto executor calls against one snapshot.
//!
//! A vendor:product pair may match several devices. With
//! [`AmbiguityPolicy::All`] every match is acted upon; with
//! [`AmbiguityPolicy::RequireUnique`] the target must carry a
//! `@<bus>:<address>` qualifier once it matches more than one device.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::AmbiguityPolicy;
use crate::error::{EXIT_OK, ResetError, Result};
use crate::reset::{Backend, BindTarget, DeviceSignal, Executor, Outcome};
use crate::topology::Snapshot;
use crate::{DeviceRecord, HubRecord};

/// `vendor:product`, optionally pinned to one bus/address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: Option<(u32, u32)>,
}

impl DeviceSelector {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            location: None,
        }
    }

    pub fn at(mut self, bus_id: u32, device_address: u32) -> Self {
        self.location = Some((bus_id, device_address));
        self
    }

    pub fn matches(&self, device: &DeviceRecord) -> bool {
        device.vendor_id == self.vendor_id
            && device.product_id == self.product_id
            && self
                .location
                .is_none_or(|loc| loc == (device.bus_id, device.device_address))
    }
}

fn parse_hex_id(s: &str) -> Option<u16> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.is_empty() || s.len() > 4 {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}

impl FromStr for DeviceSelector {
    type Err = ResetError;

    /// `1199:9071` or `1199:9071@2:2`
    fn from_str(s: &str) -> Result<Self> {
        let bogus = || ResetError::invalid(format!("bogus device '{}', expected vendor_id:product_id", s));

        let (ids, location) = match s.split_once('@') {
            Some((ids, loc)) => (ids, Some(loc)),
            None => (s, None),
        };

        let (vendor, product) = ids.split_once(':').ok_or_else(bogus)?;
        let mut selector = DeviceSelector::new(
            parse_hex_id(vendor).ok_or_else(bogus)?,
            parse_hex_id(product).ok_or_else(bogus)?,
        );

        if let Some(loc) = location {
            let (bus, addr) = loc
                .split_once(':')
                .and_then(|(b, a)| Some((b.trim().parse().ok()?, a.trim().parse().ok()?)))
                .ok_or_else(|| {
                    ResetError::invalid(format!("bogus location '{}', expected <bus>:<address>", loc))
                })?;
            selector = selector.at(bus, addr);
        }

        Ok(selector)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some((bus, addr)) = self.location {
            write!(f, "@{}:{}", bus, addr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Device(DeviceSelector),
    /// sysfs entry (`/sys/bus/usb/devices/1-1`, a driver binding) or usbfs node
    HubPath(PathBuf),
    AllControllers,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(sel) => write!(f, "device {}", sel),
            Target::HubPath(p) => write!(f, "hub path {}", p.display()),
            Target::AllControllers => f.write_str("all controllers"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ResetDevice,
    DisconnectDevice,
    ConnectDevice,
    ResetHub,
    DisableHub,
    EnableHub,
    ResetController,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::ResetDevice => "reset-device",
            Mode::DisconnectDevice => "disconnect-device",
            Mode::ConnectDevice => "connect-device",
            Mode::ResetHub => "reset-hub",
            Mode::DisableHub => "disable-hub",
            Mode::EnableHub => "enable-hub",
            Mode::ResetController => "reset-controller",
        }
    }

    fn device_signal(self) -> Option<DeviceSignal> {
        match self {
            Mode::ResetDevice => Some(DeviceSignal::Reset),
            Mode::DisconnectDevice => Some(DeviceSignal::Disconnect),
            Mode::ConnectDevice => Some(DeviceSignal::Connect),
            _ => None,
        }
    }

    fn is_hub_mode(self) -> bool {
        matches!(self, Mode::ResetHub | Mode::DisableHub | Mode::EnableHub)
    }

    pub fn accepts(self, target: &Target) -> bool {
        match target {
            Target::Device(_) => true,
            Target::HubPath(_) => self.is_hub_mode(),
            Target::AllControllers => self == Mode::ResetController,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregated outcome of one dispatch.
#[derive(Debug)]
pub struct OperationResult {
    pub mode: Mode,
    /// Devices or controllers the target selected
    pub matched: usize,
    /// One entry per operation attempted, in order
    pub outcomes: Vec<Outcome>,
}

impl OperationResult {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }

    /// Worst exit status among the failed outcomes.
    pub fn exit_code(&self) -> i32 {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_ref())
            .map(ResetError::exit_code)
            .fold(EXIT_OK, i32::max)
    }
}

pub struct Dispatcher<'a, B> {
    snapshot: &'a Snapshot,
    executor: &'a Executor<B>,
    policy: AmbiguityPolicy,
}

impl<'a, B: Backend> Dispatcher<'a, B> {
    pub fn new(snapshot: &'a Snapshot, executor: &'a Executor<B>) -> Self {
        Self {
            snapshot,
            executor,
            policy: AmbiguityPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the combination, select targets and run the operation on
    /// each. Per-target failures are collected in the result; only argument
    /// and selection problems are returned as `Err`.
    pub fn dispatch(&self, target: &Target, mode: Mode) -> Result<OperationResult> {
        if !mode.accepts(target) {
            return Err(ResetError::invalid(format!("{} cannot be used with {}", mode, target)));
        }

        log::info!("{} on {}", mode, target);

        let (matched, outcomes) = match target {
            Target::AllControllers => self.all_controllers()?,
            Target::HubPath(path) => {
                let bind_target = self.hub_path_target(path)?;
                (1, vec![self.bind_op(mode, &bind_target)])
            }
            Target::Device(selector) => {
                let devices = self.select(selector)?;
                (devices.len(), self.device_targets(&devices, mode))
            }
        };

        Ok(OperationResult {
            mode,
            matched,
            outcomes,
        })
    }

    /// Hubs in the snapshot, or only those the selected devices hang off.
    pub fn hubs(&self, selector: Option<&DeviceSelector>) -> Result<Vec<HubRecord>> {
        let Some(selector) = selector else {
            return Ok(self.snapshot.hubs());
        };

        let devices: Vec<&DeviceRecord> = self
            .snapshot
            .devices()
            .iter()
            .filter(|d| selector.matches(d))
            .collect();
        if devices.is_empty() {
            return Err(ResetError::no_match(selector));
        }

        let mut hubs: Vec<HubRecord> = Vec::new();
        for device in devices {
            let hub = self.snapshot.resolve_hub(device)?;
            if !hubs.iter().any(|h| h.sysfs_path == hub.sysfs_path) {
                hubs.push(hub);
            }
        }
        Ok(hubs)
    }

    fn select(&self, selector: &DeviceSelector) -> Result<Vec<&'a DeviceRecord>> {
        let devices: Vec<&DeviceRecord> = self
            .snapshot
            .devices()
            .iter()
            .filter(|d| selector.matches(d))
            .collect();

        if devices.is_empty() {
            return Err(ResetError::no_match(selector));
        }

        if devices.len() > 1 && self.policy == AmbiguityPolicy::RequireUnique {
            let candidates: Vec<String> = devices
                .iter()
                .map(|d| format!("{}@{}:{}", selector, d.bus_id, d.device_address))
                .collect();
            return Err(ResetError::invalid(format!(
                "{} matches {} devices, pick one of: {}",
                selector,
                devices.len(),
                candidates.join(", ")
            )));
        }

        log::debug!("{} matched {} device(s)", selector, devices.len());
        Ok(devices)
    }

    fn device_targets(&self, devices: &[&DeviceRecord], mode: Mode) -> Vec<Outcome> {
        if let Some(signal) = mode.device_signal() {
            return devices
                .iter()
                .map(|d| self.executor.signal_device(d, signal))
                .collect();
        }

        let mut outcomes = Vec::new();
        let mut seen: Vec<PathBuf> = Vec::new();

        for device in devices {
            let resolved = if mode.is_hub_mode() {
                self.snapshot
                    .resolve_hub(device)
                    .map(|hub| BindTarget::for_hub(self.snapshot.sys_root(), &hub))
            } else {
                self.snapshot
                    .resolve_controller(device)
                    .and_then(|c| BindTarget::for_controller(&c))
            };

            match resolved {
                Ok(target) => {
                    // several matches may share one parent
                    if seen.contains(&target.display_path) {
                        continue;
                    }
                    seen.push(target.display_path.clone());
                    outcomes.push(self.bind_op(mode, &target));
                }
                Err(e) => {
                    log::warn!("{}: {}", device, e);
                    outcomes.push(Outcome {
                        target: device.sysfs_path.clone(),
                        steps: Vec::new(),
                        error: Some(e),
                    });
                }
            }
        }

        outcomes
    }

    fn all_controllers(&self) -> Result<(usize, Vec<Outcome>)> {
        let controllers = self.snapshot.controllers();
        if controllers.is_empty() {
            return Err(ResetError::not_found(
                "host controller under",
                self.snapshot.sys_root().join("bus/pci/drivers"),
            ));
        }

        let outcomes = controllers
            .iter()
            .map(|c| self.executor.reset_controller(c))
            .collect();
        Ok((controllers.len(), outcomes))
    }

    fn hub_path_target(&self, path: &Path) -> Result<BindTarget> {
        if path.starts_with(self.snapshot.dev_root()) {
            let device = self
                .snapshot
                .by_device_path(path)
                .ok_or_else(|| ResetError::not_found("device node", path))?;
            if !device.is_hub() {
                log::warn!("{} is not a hub, rebinding the device itself", device);
            }
            return Ok(BindTarget::for_device(self.snapshot.sys_root(), device));
        }

        BindTarget::from_path(self.snapshot.sys_root(), path)
    }

    fn bind_op(&self, mode: Mode, target: &BindTarget) -> Outcome {
        match mode {
            Mode::DisableHub => self.executor.unbind(target),
            Mode::EnableHub => self.executor.bind(target),
            _ => self.executor.rebind(target),
        }
    }
}
