// Linux USB reset: everything is a file
// 在 Linux 上，复位操作也是和文件打交道。
//
// Two kernel interfaces are involved:
// 涉及两个内核接口：
//     usbfs (/dev/bus/usb/BBB/DDD):
//         One character device per USB device. USBDEVFS_RESET on an open
//         node performs a port reset of that device.
//         每个 USB 设备对应一个字符设备，对打开的节点发送 USBDEVFS_RESET 即可复位该设备。
//     sysfs driver directories (/sys/bus/{usb,pci}/drivers/<driver>/):
//         Writing a device name into `unbind` detaches the driver, writing it
//         into `bind` attaches it again. For a hub or a host controller this
//         takes down and rebuilds everything below it.
//         向 unbind 写入设备名会解绑驱动，再写入 bind 则重新绑定。
//

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::{ResetError, Result};
use crate::reset::{Backend, DeviceSignal};

// linux/usbdevice_fs.h
nix::ioctl_none!(usbdevfs_reset, b'U', 20);
nix::ioctl_none!(usbdevfs_disconnect, b'U', 22);
nix::ioctl_none!(usbdevfs_connect, b'U', 23);

// Set from the signal handler, read by SystemBackend::interrupted
// 由信号处理函数置位
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const SETTLE_POLL: Duration = Duration::from_millis(50);

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Catch SIGINT and SIGTERM so a reset in progress can stop at a known
/// state instead of dying between unbind and bind. A second signal gets
/// the default action.
/// 捕获 SIGINT / SIGTERM，第二次信号按默认方式结束进程
pub fn install_interrupt_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Idle,
    Opened,
    RequestIssued,
    Closed,
}

/// Backend talking to the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        Self
    }

    // Open the node and take an exclusive, non-blocking lock on it.
    // Another holder makes this fail immediately instead of waiting.
    // 打开设备节点并加非阻塞排他锁，被占用时立即失败而不是等待
    fn open_exclusive(node: &Path) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(node)
            .map_err(|e| ResetError::from_io("open", node, e))?;

        Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| ResetError::from_io("lock", node, io::Error::from(errno)))
    }
}

impl Backend for SystemBackend {
    fn device_request(&self, node: &Path, signal: DeviceSignal) -> Result<()> {
        let mut state = NodeState::Idle;
        log::debug!("{}: {:?}", node.display(), state);

        let handle = Self::open_exclusive(node)?;
        state = NodeState::Opened;
        log::debug!("{}: {:?}", node.display(), state);

        let fd = handle.as_raw_fd();
        // SAFETY: fd belongs to `handle`, which stays open for the call
        let issued = unsafe {
            match signal {
                DeviceSignal::Reset => usbdevfs_reset(fd),
                DeviceSignal::Disconnect => usbdevfs_disconnect(fd),
                DeviceSignal::Connect => usbdevfs_connect(fd),
            }
        };
        issued.map_err(|errno| ResetError::from_io("ioctl", node, io::Error::from(errno)))?;
        state = NodeState::RequestIssued;
        log::debug!("{}: {:?} ({})", node.display(), state, signal.name());

        // unlock and close
        drop(handle);
        state = NodeState::Closed;
        log::debug!("{}: {:?}", node.display(), state);

        Ok(())
    }

    fn write_control(&self, file: &Path, value: &str) -> io::Result<()> {
        log::debug!("Writing '{}' to {}", value, file.display());

        // sysfs attributes take the whole value in a single write
        // sysfs 属性要求一次写入完整的值
        let mut f = OpenOptions::new().write(true).open(file)?;
        f.write_all(value.as_bytes())?;
        f.flush()
    }

    // Sleep in short slices so an interrupt cuts the wait short
    fn settle(&self, delay: Duration) {
        let start = Instant::now();
        while !self.interrupted() {
            let elapsed = start.elapsed();
            if elapsed >= delay {
                break;
            }
            thread::sleep((delay - elapsed).min(SETTLE_POLL));
        }
    }

    fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}
