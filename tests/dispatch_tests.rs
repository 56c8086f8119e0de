//! Dispatch and reset against a simulated sysfs tree

#![cfg(target_os = "linux")]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::tempdir;
use usb_resetter::test_utils::{Call, FakeDevice, FakeSysfs, RecordingBackend};
use usb_resetter::{
    AmbiguityPolicy, DeviceSelector, Dispatcher, Enumerator, Executor, Mode, ResetError, Snapshot,
    SystemBackend, Target,
};

fn capture(root: &Path) -> Snapshot {
    Snapshot::capture(&Enumerator::new(root, "/dev/bus/usb")).unwrap()
}

fn device(s: &str) -> Target {
    Target::Device(s.parse::<DeviceSelector>().unwrap())
}

/// Two buses: 1d6b:0002 root hub at 1/1, modem 1199:9071 at 2/2.
fn scenario(sys: &FakeSysfs) -> PathBuf {
    let xhci = sys.controller("xhci_hcd", "0000:00:14.0");
    sys.root_hub(&xhci, 1);
    let ehci = sys.controller("ehci-pci", "0000:00:1d.0");
    let usb2 = sys.root_hub(&ehci, 2);
    sys.device(&usb2, FakeDevice::new("2-2", 2, 2, 0x1199, 0x9071));
    usb2
}

#[test]
fn test_scenario_list_reset_device_reset_hub() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    let usb2 = scenario(&sys);
    let snapshot = capture(sys.root());

    let listing: Vec<String> = snapshot.devices().iter().map(|d| d.listing_line()).collect();
    let root_line = listing
        .iter()
        .position(|l| l.starts_with("Found device 1d6b:0002 at /dev/bus/usb/001/001 "))
        .unwrap();
    let modem_line = listing
        .iter()
        .position(|l| l.starts_with("Found device 1199:9071 at /dev/bus/usb/002/002 "))
        .unwrap();
    assert!(root_line < modem_line);

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher.dispatch(&device("1199:9071"), Mode::ResetDevice).unwrap();
    let steps: Vec<&String> = result.outcomes.iter().flat_map(|o| &o.steps).collect();
    assert_eq!(steps, vec!["Resetting usb device /dev/bus/usb/002/002"]);
    assert_eq!(backend.device_requests(), vec![PathBuf::from("/dev/bus/usb/002/002")]);

    let result = dispatcher.dispatch(&device("1199:9071"), Mode::ResetHub).unwrap();
    assert!(result.is_success());
    assert_eq!(
        result.outcomes[0].steps,
        vec![
            format!("unbind hub {}", usb2.display()),
            format!("bind hub {}", usb2.display()),
        ]
    );
    assert_eq!(
        backend.writes(),
        vec![
            (sys.usb_driver_dir().join("unbind"), "usb2".to_string()),
            (sys.usb_driver_dir().join("bind"), "usb2".to_string()),
        ]
    );
}

#[test]
fn test_no_match_is_not_found() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let err = dispatcher.dispatch(&device("dead:beef"), Mode::ResetDevice).unwrap_err();
    assert!(matches!(err, ResetError::NotFound { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(backend.calls().is_empty());

    // qualifier pointing elsewhere
    let err = dispatcher
        .dispatch(&device("1199:9071@1:2"), Mode::ResetDevice)
        .unwrap_err();
    assert!(matches!(err, ResetError::NotFound { .. }));
}

#[test]
fn test_ambiguous_target_acts_on_all_matches() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher.dispatch(&device("1d6b:0002"), Mode::ResetDevice).unwrap();
    assert_eq!(result.matched, 2);
    assert_eq!(result.outcomes.len(), 2);
    assert_eq!(result.successes(), 2);
    assert_eq!(
        backend.device_requests(),
        vec![
            PathBuf::from("/dev/bus/usb/001/001"),
            PathBuf::from("/dev/bus/usb/002/001"),
        ]
    );
}

#[test]
fn test_require_unique_policy() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor).with_policy(AmbiguityPolicy::RequireUnique);

    let err = dispatcher.dispatch(&device("1d6b:0002"), Mode::ResetDevice).unwrap_err();
    match err {
        ResetError::InvalidArgument(msg) => {
            assert!(msg.contains("1d6b:0002@1:1"));
            assert!(msg.contains("1d6b:0002@2:1"));
        }
        other => panic!("expected invalid argument, got {:?}", other),
    }
    assert!(backend.calls().is_empty());

    let result = dispatcher
        .dispatch(&device("1d6b:0002@2:1"), Mode::ResetDevice)
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(backend.device_requests(), vec![PathBuf::from("/dev/bus/usb/002/001")]);
}

#[test]
fn test_hub_reset_shares_parent_once() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    let xhci = sys.controller("xhci_hcd", "0000:00:14.0");
    let usb1 = sys.root_hub(&xhci, 1);
    let hub = sys.device(&usb1, FakeDevice::new("1-1", 1, 2, 0x05e3, 0x0610).hub());
    sys.device(&hub, FakeDevice::new("1-1.1", 1, 3, 0x0403, 0x6001));
    sys.device(&hub, FakeDevice::new("1-1.2", 1, 4, 0x0403, 0x6001));
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root()).with_settle_delay(Duration::from_millis(10));
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher.dispatch(&device("0403:6001"), Mode::ResetHub).unwrap();
    assert_eq!(result.matched, 2);
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(
        backend.calls(),
        vec![
            Call::Write {
                file: sys.usb_driver_dir().join("unbind"),
                value: "1-1".into(),
            },
            Call::Settle(Duration::from_millis(10)),
            Call::Write {
                file: sys.usb_driver_dir().join("bind"),
                value: "1-1".into(),
            },
        ]
    );
}

#[test]
fn test_failed_unbind_skips_bind() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend =
        RecordingBackend::new().failing_path(sys.usb_driver_dir().join("unbind"), io::ErrorKind::PermissionDenied);
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher.dispatch(&device("1199:9071"), Mode::ResetHub).unwrap();
    assert!(!result.is_success());
    assert!(matches!(
        result.outcomes[0].error,
        Some(ResetError::Permission { .. })
    ));
    assert_eq!(result.exit_code(), 1);
    assert_eq!(backend.writes().len(), 1);
    assert!(backend.writes()[0].0.ends_with("unbind"));
}

#[test]
fn test_failed_bind_reports_partial_reset() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new().failing_path(sys.usb_driver_dir().join("bind"), io::ErrorKind::Other);
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher.dispatch(&device("1199:9071"), Mode::ResetHub).unwrap();
    assert!(matches!(
        result.outcomes[0].error,
        Some(ResetError::PartialReset { .. })
    ));
    assert_eq!(result.exit_code(), 4);
}

#[test]
fn test_all_controllers_continue_past_failure() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    for (driver, addr, bus) in [
        ("xhci_hcd", "0000:00:14.0", 1),
        ("ehci-pci", "0000:00:1a.0", 2),
        ("ehci-pci", "0000:00:1d.0", 3),
    ] {
        let ctrl = sys.controller(driver, addr);
        sys.root_hub(&ctrl, bus);
    }
    let snapshot = capture(sys.root());
    assert_eq!(snapshot.controllers().len(), 3);

    let backend = RecordingBackend::new().failing_id("0000:00:1a.0", io::ErrorKind::Other);
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let result = dispatcher
        .dispatch(&Target::AllControllers, Mode::ResetController)
        .unwrap();
    assert_eq!(result.matched, 3);
    assert_eq!(result.successes(), 2);
    assert_eq!(result.failures(), 1);
    assert_eq!(result.exit_code(), 1);

    let failed: Vec<&PathBuf> = result
        .outcomes
        .iter()
        .filter(|o| !o.is_success())
        .map(|o| &o.target)
        .collect();
    assert_eq!(failed, vec![&sys.pci_driver_dir("ehci-pci").join("0000:00:1a.0")]);

    // the other two went through unbind and bind
    let binds: Vec<String> = backend
        .writes()
        .into_iter()
        .filter(|(file, _)| file.ends_with("bind") && !file.ends_with("unbind"))
        .map(|(_, id)| id)
        .collect();
    assert_eq!(binds, vec!["0000:00:1d.0", "0000:00:14.0"]);
}

#[test]
fn test_all_controllers_with_none_present() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let err = Dispatcher::new(&snapshot, &executor)
        .dispatch(&Target::AllControllers, Mode::ResetController)
        .unwrap_err();
    assert!(matches!(err, ResetError::NotFound { .. }));
}

#[test]
fn test_controller_reset_for_device() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&device("1199:9071"), Mode::ResetController)
        .unwrap();

    assert!(result.is_success());
    assert_eq!(
        backend.writes(),
        vec![
            (sys.pci_driver_dir("ehci-pci").join("unbind"), "0000:00:1d.0".to_string()),
            (sys.pci_driver_dir("ehci-pci").join("bind"), "0000:00:1d.0".to_string()),
        ]
    );
}

#[test]
fn test_incompatible_target_and_mode() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    let hub_path = Target::HubPath(sys.root().join("bus/usb/devices/usb2"));
    for (target, mode) in [
        (&hub_path, Mode::ResetDevice),
        (&hub_path, Mode::ResetController),
        (&Target::AllControllers, Mode::ResetHub),
        (&Target::AllControllers, Mode::ResetDevice),
    ] {
        let err = dispatcher.dispatch(target, mode).unwrap_err();
        assert!(matches!(err, ResetError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), 2);
    }
    assert!(backend.calls().is_empty());
}

#[test]
fn test_explicit_hub_paths() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    // bus/usb/devices entry goes through the generic usb driver
    let by_name = Target::HubPath(sys.root().join("bus/usb/devices/usb2"));
    let result = dispatcher.dispatch(&by_name, Mode::ResetHub).unwrap();
    assert!(result.is_success());
    assert_eq!(
        result.outcomes[0].steps[0],
        format!("unbind hub {}", sys.root().join("bus/usb/devices/usb2").display())
    );

    // a PCI binding uses its own driver directory
    let by_binding = Target::HubPath(sys.pci_driver_dir("xhci_hcd").join("0000:00:14.0"));
    dispatcher.dispatch(&by_binding, Mode::DisableHub).unwrap();

    // a usbfs node resolves through the snapshot
    let by_node = Target::HubPath(PathBuf::from("/dev/bus/usb/002/001"));
    dispatcher.dispatch(&by_node, Mode::EnableHub).unwrap();

    assert_eq!(
        backend.writes(),
        vec![
            (sys.usb_driver_dir().join("unbind"), "usb2".to_string()),
            (sys.usb_driver_dir().join("bind"), "usb2".to_string()),
            (sys.pci_driver_dir("xhci_hcd").join("unbind"), "0000:00:14.0".to_string()),
            (sys.usb_driver_dir().join("bind"), "usb2".to_string()),
        ]
    );

    let unknown = Target::HubPath(PathBuf::from("/dev/bus/usb/009/009"));
    assert!(matches!(
        dispatcher.dispatch(&unknown, Mode::ResetHub).unwrap_err(),
        ResetError::NotFound { .. }
    ));
}

#[test]
fn test_list_hubs_for_device() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    let usb2 = scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let dispatcher = Dispatcher::new(&snapshot, &executor);

    assert_eq!(dispatcher.hubs(None).unwrap().len(), 2);

    let selector: DeviceSelector = "1199:9071".parse().unwrap();
    let hubs = dispatcher.hubs(Some(&selector)).unwrap();
    assert_eq!(hubs.len(), 1);
    assert_eq!(hubs[0].sysfs_path, usb2);
}

#[test]
fn test_system_backend_writes_control_files() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let executor = Executor::new(SystemBackend::new(), sys.root()).with_settle_delay(Duration::ZERO);
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&device("1199:9071"), Mode::ResetController)
        .unwrap();
    assert!(result.is_success());

    let driver_dir = sys.pci_driver_dir("ehci-pci");
    assert_eq!(fs::read_to_string(driver_dir.join("unbind")).unwrap(), "0000:00:1d.0");
    assert_eq!(fs::read_to_string(driver_dir.join("bind")).unwrap(), "0000:00:1d.0");
}

#[test]
fn test_root_hub_without_parent_exits_not_found() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new();
    let executor = Executor::new(&backend, sys.root());
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&device("1d6b:0002@1:1"), Mode::ResetHub)
        .unwrap();

    assert!(matches!(
        result.outcomes[0].error,
        Some(ResetError::NotFound { .. })
    ));
    assert_eq!(result.exit_code(), 3);
    assert!(backend.calls().is_empty());
}

#[test]
fn test_missing_device_node_exits_not_found() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let nodes = tempdir().unwrap();
    let snapshot = Snapshot::capture(&Enumerator::new(sys.root(), nodes.path())).unwrap();

    let executor = Executor::new(SystemBackend::new(), sys.root());
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&device("1199:9071"), Mode::ResetDevice)
        .unwrap();

    assert!(matches!(
        result.outcomes[0].error,
        Some(ResetError::NotFound { .. })
    ));
    assert_eq!(result.exit_code(), 3);
}

#[test]
fn test_partial_reset_outranks_other_failures() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    // first controller loses its bind, second cannot be unbound
    let backend = RecordingBackend::new()
        .failing_path(sys.pci_driver_dir("ehci-pci").join("bind"), io::ErrorKind::Other)
        .failing_path(sys.pci_driver_dir("xhci_hcd").join("unbind"), io::ErrorKind::PermissionDenied);
    let executor = Executor::new(&backend, sys.root());
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&Target::AllControllers, Mode::ResetController)
        .unwrap();

    assert_eq!(result.failures(), 2);
    assert_eq!(result.exit_code(), 4);
}

#[test]
fn test_interrupt_during_all_controllers() {
    let dir = tempdir().unwrap();
    let sys = FakeSysfs::new(dir.path());
    scenario(&sys);
    let snapshot = capture(sys.root());

    let backend = RecordingBackend::new().interrupt_on_settle();
    let executor = Executor::new(&backend, sys.root());
    let result = Dispatcher::new(&snapshot, &executor)
        .dispatch(&Target::AllControllers, Mode::ResetController)
        .unwrap();

    assert_eq!(result.outcomes.len(), 2);
    match &result.outcomes[0].error {
        Some(ResetError::PartialReset { id, bind_file, .. }) => {
            assert_eq!(id, "0000:00:1d.0");
            assert_eq!(bind_file, &sys.pci_driver_dir("ehci-pci").join("bind"));
        }
        other => panic!("expected partial reset, got {:?}", other),
    }
    assert!(matches!(
        &result.outcomes[1].error,
        Some(ResetError::Io { source, .. }) if source.kind() == io::ErrorKind::Interrupted
    ));
    assert_eq!(result.exit_code(), 4);
    assert_eq!(
        backend.writes(),
        vec![(sys.pci_driver_dir("ehci-pci").join("unbind"), "0000:00:1d.0".to_string())]
    );
}
