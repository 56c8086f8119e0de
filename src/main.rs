use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use usb_resetter::error::{EXIT_FAILED, EXIT_INVALID_ARGUMENT, EXIT_OK};
use usb_resetter::{
    AmbiguityPolicy, Backend, Config, DeviceSelector, Enumerator, Mode, OperationResult, ResetError,
    Snapshot, Target,
};

#[derive(Parser, Debug)]
#[command(name = "usb-resetter")]
#[command(author, version, about = "USB hub / controllers & devices reset tool")]
#[command(arg_required_else_help = true)]
#[command(long_about = "
Resets a single USB device, the hub it is plugged into, or whole host
controllers (driver unbind + bind). Also lists devices like lsusb.

EXAMPLES:
    # List devices
    usb-resetter --list

    # Reset every device with this id
    usb-resetter --device 1199:9071 --reset-device

    # Reset the hub a device is attached to
    usb-resetter --device 1199:9071 --reset-hub

    # Reset one hub by path
    usb-resetter --hub /sys/bus/usb/devices/1-1 --reset-hub

    # Reset all USB controllers
    usb-resetter --reset-all

EXIT STATUS:
    0 success, 1 operation failed, 2 invalid arguments,
    3 no matching device, 4 unbound but not re-bound
")]
struct Args {
    /// List USB devices and paths
    #[arg(short, long)]
    list: bool,

    /// List hubs; with --device, only the hubs the device is connected to
    #[arg(long)]
    list_hubs: bool,

    /// Device(s) to act on, vendor_id:product_id[@bus:address], comma separated
    #[arg(short, long, value_name = "VID:PID", value_delimiter = ',')]
    device: Vec<String>,

    /// Full sysfs path of a hub, or its /dev/bus/usb node, for hub actions
    #[arg(long, value_name = "PATH")]
    hub: Option<PathBuf>,

    /// Reset devices given by --device
    #[arg(long)]
    reset_device: bool,

    /// Send a connect request to devices given by --device
    #[arg(long)]
    connect_device: bool,

    /// Send a disconnect request to devices given by --device
    #[arg(long)]
    disconnect_device: bool,

    /// Reset all USB controllers, including their hubs and devices
    #[arg(short, long)]
    reset_all: bool,

    /// Reset the hub given by --hub, or the hubs devices given by --device are connected to
    #[arg(long)]
    reset_hub: bool,

    /// Unbind the hub given by --hub or --device, leaving it off
    #[arg(long)]
    disable_hub: bool,

    /// Bind the hub given by --hub or --device again
    #[arg(long)]
    enable_hub: bool,

    /// Reset the host controller owning devices given by --device
    #[arg(long)]
    reset_controller: bool,

    /// Refuse to act when a vendor:product id matches several devices
    #[arg(long)]
    require_unique: bool,

    /// Delay between unbind and bind, in milliseconds
    #[arg(long, value_name = "MS")]
    settle_ms: Option<u64>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root of the sysfs tree
    #[arg(long, value_name = "PATH")]
    sys_root: Option<PathBuf>,

    /// Root of the usbfs device nodes
    #[arg(long, value_name = "PATH")]
    dev_root: Option<PathBuf>,

    /// Enumerate devices through libudev instead of walking sysfs
    #[cfg(feature = "udev")]
    #[arg(long)]
    udev: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn modes(&self) -> Vec<Mode> {
        [
            (self.reset_device, Mode::ResetDevice),
            (self.connect_device, Mode::ConnectDevice),
            (self.disconnect_device, Mode::DisconnectDevice),
            (self.disable_hub, Mode::DisableHub),
            (self.enable_hub, Mode::EnableHub),
            (self.reset_hub, Mode::ResetHub),
            (self.reset_controller, Mode::ResetController),
        ]
        .into_iter()
        .filter_map(|(on, mode)| on.then_some(mode))
        .collect()
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(root) = &args.sys_root {
        config.sys_root = root.clone();
    }
    if let Some(root) = &args.dev_root {
        config.dev_root = root.clone();
    }
    if let Some(ms) = args.settle_ms {
        config.settle_delay_ms = ms;
    }
    if args.require_unique {
        config.ambiguity = AmbiguityPolicy::RequireUnique;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[cfg_attr(not(feature = "udev"), allow(unused_variables))]
fn capture(args: &Args, enumerator: &Enumerator) -> usb_resetter::Result<Snapshot> {
    #[cfg(feature = "udev")]
    if args.udev {
        return usb_resetter::platform::udev::UdevScanner::new().capture(enumerator);
    }
    Snapshot::capture(enumerator)
}

// error messages already name the affected path
fn report_error(error: &ResetError) {
    eprintln!("{}", error);
}

fn print_result(result: &OperationResult) {
    for outcome in &result.outcomes {
        for step in &outcome.steps {
            println!("{}", step);
        }
        if let Some(e) = &outcome.error {
            eprintln!("{} failed: {}", result.mode, e);
        }
    }

    if result.outcomes.len() > 1 {
        println!(
            "{}: {} matched, {} succeeded, {} failed",
            result.mode,
            result.matched,
            result.successes(),
            result.failures()
        );
        for outcome in &result.outcomes {
            let status = if outcome.is_success() { "ok" } else { "failed" };
            println!("  {:<6} {}", status, outcome.target.display());
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<i32> {
    let config = load_config(&args)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    log::info!("usb-resetter v{}", env!("CARGO_PKG_VERSION"));

    usb_resetter::platform::linux::install_interrupt_handler()
        .context("Failed to install signal handlers")?;

    let selectors = match args
        .device
        .iter()
        .map(|d| d.parse::<DeviceSelector>())
        .collect::<usb_resetter::Result<Vec<_>>>()
    {
        Ok(selectors) => selectors,
        Err(e) => {
            report_error(&e);
            return Ok(EXIT_INVALID_ARGUMENT);
        }
    };

    let enumerator = Enumerator::from_config(&config);
    let mut snapshot = match capture(&args, &enumerator) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            report_error(&e);
            return Ok(e.exit_code());
        }
    };

    let executor = usb_resetter::Executor::new(usb_resetter::SystemBackend::new(), &config.sys_root)
        .with_settle_delay(config.settle_delay());

    let mut jobs: Vec<(Target, Mode)> = Vec::new();
    if args.reset_all {
        jobs.push((Target::AllControllers, Mode::ResetController));
    }
    for mode in args.modes() {
        let hub_mode = matches!(mode, Mode::ResetHub | Mode::DisableHub | Mode::EnableHub);
        if let Some(hub) = args.hub.as_ref().filter(|_| hub_mode || selectors.is_empty()) {
            jobs.push((Target::HubPath(hub.clone()), mode));
        } else if !selectors.is_empty() {
            jobs.extend(selectors.iter().map(|s| (Target::Device(*s), mode)));
        } else {
            eprintln!("--{} requires --device", mode);
            return Ok(EXIT_INVALID_ARGUMENT);
        }
    }

    let mut code = EXIT_OK;
    {
        let dispatcher = usb_resetter::Dispatcher::new(&snapshot, &executor).with_policy(config.ambiguity);
        for (target, mode) in &jobs {
            if executor.backend().interrupted() {
                eprintln!("Program interrupted, skipping {} on {}", mode, target);
                code = code.max(EXIT_FAILED);
                continue;
            }
            match dispatcher.dispatch(target, *mode) {
                Ok(result) => {
                    print_result(&result);
                    code = code.max(result.exit_code());
                }
                Err(e) => {
                    report_error(&e);
                    code = code.max(e.exit_code());
                }
            }
        }
    }

    // resets invalidate the snapshot
    if !jobs.is_empty() && (args.list || args.list_hubs) {
        snapshot = match capture(&args, &enumerator) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                report_error(&e);
                return Ok(code.max(e.exit_code()));
            }
        };
    }

    if args.list {
        for device in snapshot.devices() {
            println!("{}", device.listing_line());
        }
    }

    if args.list_hubs {
        let dispatcher = usb_resetter::Dispatcher::new(&snapshot, &executor);
        let filters: Vec<Option<&DeviceSelector>> = if selectors.is_empty() {
            vec![None]
        } else {
            selectors.iter().map(Some).collect()
        };
        for filter in filters {
            match dispatcher.hubs(filter) {
                Ok(hubs) => {
                    for hub in hubs {
                        println!("Found hub {}", hub.sysfs_path.display());
                    }
                }
                Err(e) => {
                    report_error(&e);
                    code = code.max(e.exit_code());
                }
            }
        }
    }

    Ok(code)
}

#[cfg(target_os = "linux")]
fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Program failed with error {:#}", e);
            process::exit(EXIT_FAILED);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("This tool can only run on Linux");
    process::exit(EXIT_FAILED);
}
