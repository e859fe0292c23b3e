//! ADB plumbing: command execution and the stock [`DeviceFactory`].
//!
//! [`CommandRunner`] is the seam between the capture strategies and the
//! `adb` binary; [`AdbDevice`] layers screen probing and method fallback
//! on top of it.
//!
//! [`DeviceFactory`]: crate::device::DeviceFactory

mod device;
mod runner;

pub use device::{AdbDevice, attempt_order, is_awake, is_keyguard_locked};
pub use runner::{AdbRunner, CommandRunner, classify_failure};

/// Device serial made safe for use in a file name (`host:port` serials
/// contain characters some filesystems reject).
pub fn sanitize_device_id(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_network_serials() {
        assert_eq!(sanitize_device_id("192.168.1.5:5555"), "192_168_1_5_5555");
        assert_eq!(sanitize_device_id("emulator-5554"), "emulator-5554");
    }
}
