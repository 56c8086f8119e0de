#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(all(target_os = "linux", feature = "udev"))]
pub mod udev;
