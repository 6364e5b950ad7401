//! The device seam.
//!
//! Device-file I/O dispatches on a device key stored in the inode rather
//! than on driver objects, keeping the VFS core free of driver lifetimes.
//! The built-in keys cover the boot set: `/dev/null`, `/dev/zero`,
//! `/dev/console`, and `/dev/tty`.

use crate::drivers::console;

/// Key identifying which device an inode fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Reads EOF, discards writes.
    Null,
    /// Reads zeros, discards writes.
    Zero,
    /// Keyboard in, VGA out.
    Console,
    /// Alias of the console.
    Tty,
}

/// Device read semantics:
///
/// | device  | read                                   |
/// |---------|----------------------------------------|
/// | null    | returns 0 (EOF)                        |
/// | zero    | fills the buffer with 0x00             |
/// | console | pending keyboard bytes (0 if none)     |
/// | tty     | same as console                        |
pub fn device_read(kind: DeviceKind, buf: &mut [u8]) -> usize {
    match kind {
        DeviceKind::Null => 0,
        DeviceKind::Zero => {
            buf.fill(0);
            buf.len()
        }
        DeviceKind::Console | DeviceKind::Tty => console::read_bytes(buf),
    }
}

/// Device write semantics: null and zero discard (reporting full length),
/// console and tty forward to the VGA driver.
pub fn device_write(kind: DeviceKind, buf: &[u8]) -> usize {
    match kind {
        DeviceKind::Null | DeviceKind::Zero => buf.len(),
        DeviceKind::Console | DeviceKind::Tty => console::write_bytes(buf),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn null_reads_eof_and_swallows_writes() {
        let mut buf = [0xFFu8; 4];
        assert_eq!(device_read(DeviceKind::Null, &mut buf), 0);
        assert_eq!(buf, [0xFF; 4]); // untouched
        assert_eq!(device_write(DeviceKind::Null, b"discarded"), 9);
    }

    #[test]
    fn zero_fills_and_swallows_writes() {
        let mut buf = [0xFFu8; 5];
        assert_eq!(device_read(DeviceKind::Zero, &mut buf), 5);
        assert_eq!(buf, [0u8; 5]);
        assert_eq!(device_write(DeviceKind::Zero, b"xyz"), 3);
    }

    #[test]
    fn console_write_reports_length() {
        assert_eq!(device_write(DeviceKind::Console, b"boot ok"), 7);
        assert_eq!(device_write(DeviceKind::Tty, b""), 0);
    }
}
