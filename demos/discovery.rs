use usb_resetter::{Config, Enumerator, Snapshot};

fn main() -> anyhow::Result<()> {
    env_logger::try_init().ok();

    let config = Config::load(None)?;
    let snapshot = Snapshot::capture(&Enumerator::from_config(&config))?;
    println!("Scanning USB topology under {} ...\n", snapshot.sys_root().display());

    if snapshot.devices().is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    // Hex ids for --device, kernel names for --hub, parent hub for --reset-hub
    println!(
        "{:<9} | {:<9} | {:<10} | {:<12} | {:<20} | Controller",
        "Bus:Addr", "VID:PID", "Kernel", "Parent hub", "Node"
    );
    println!("{}", "-".repeat(110));

    for dev in snapshot.devices() {
        let parent = snapshot
            .resolve_hub(dev)
            .map(|hub| hub.kernel_name)
            .unwrap_or_else(|_| "-".to_string());
        let controller = snapshot
            .resolve_controller(dev)
            .map(|c| c.driver_bind_path.display().to_string())
            .unwrap_or_else(|_| "-".to_string());

        println!(
            "{:03}:{:03}   | {:04x}:{:04x} | {:<10} | {:<12} | {:<20} | {}",
            dev.bus_id,
            dev.device_address,
            dev.vendor_id,
            dev.product_id,
            dev.kernel_name,
            parent,
            dev.device_path.display(),
            controller
        );
    }

    println!();
    for hub in snapshot.hubs() {
        println!(
            "Hub {} ({} device(s) attached): {}",
            hub.kernel_name,
            hub.child_devices.len(),
            hub.sysfs_path.display()
        );
    }

    Ok(())
}
