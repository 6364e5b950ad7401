//! Console driver: keyboard in, VGA text out.
//!
//! This is the device behind `/dev/console` and `/dev/tty`. Reads drain
//! the keyboard ring buffer (returning 0 when no input is pending); writes
//! go to the VGA text screen, serialized by the VGA writer's own mutex.

use crate::error::KernelResult;

use super::{keyboard, ControlOp, Driver};

/// Write bytes to the console output. On the host there is no screen;
/// the bytes are accepted and dropped.
pub fn write_bytes(buf: &[u8]) -> usize {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::hal::without_interrupts(|| {
        let mut writer = crate::arch::x86_64::vga::WRITER.lock();
        for &byte in buf {
            match byte {
                0x20..=0x7e | b'\n' => writer.write_byte(byte),
                _ => writer.write_byte(0xfe),
            }
        }
    });
    buf.len()
}

/// Read pending keyboard input, non-blocking. Returns 0 until a keyboard
/// producer has pushed something.
pub fn read_bytes(buf: &mut [u8]) -> usize {
    let mut n = 0;
    while n < buf.len() {
        match keyboard::read_key() {
            Some(byte) => {
                buf[n] = byte;
                n += 1;
            }
            None => break,
        }
    }
    n
}

/// Blocking single-character read: halts until the keyboard delivers.
#[cfg(target_os = "none")]
pub fn getchar() -> u8 {
    loop {
        if let Some(byte) = keyboard::read_key() {
            return byte;
        }
        crate::arch::x86_64::hal::hlt();
    }
}

/// Console driver for the device registry.
pub struct ConsoleDriver;

impl ConsoleDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ConsoleDriver {
    fn init(&mut self) -> KernelResult<()> {
        Ok(())
    }

    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        Ok(read_bytes(buf))
    }

    fn write(&mut self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        Ok(write_bytes(buf))
    }

    fn control(&mut self, op: ControlOp) -> KernelResult<()> {
        if op == ControlOp::Flush {
            let mut sink = [0u8; 64];
            while read_bytes(&mut sink) > 0 {}
        }
        Ok(())
    }

    fn shutdown(&mut self) -> KernelResult<()> {
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn write_reports_full_length() {
        assert_eq!(write_bytes(b"hello"), 5);
        assert_eq!(write_bytes(b""), 0);
    }

    #[test]
    fn read_returns_zero_without_input() {
        let _guard = keyboard::TEST_LOCK.lock();
        keyboard::init();
        let mut buf = [0u8; 8];
        assert_eq!(read_bytes(&mut buf), 0);
    }

    #[test]
    fn read_drains_injected_scancodes() {
        let _guard = keyboard::TEST_LOCK.lock();
        keyboard::init();
        keyboard::handle_scancode(0x1E); // 'a' press
        keyboard::handle_scancode(0x9E); // 'a' release
        let mut buf = [0u8; 8];
        assert_eq!(read_bytes(&mut buf), 1);
        assert_eq!(buf[0], b'a');
    }
}
