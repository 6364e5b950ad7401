//! COM1 serial port.
//!
//! Mirrors console output for headless runs (QEMU `-serial stdio`) and is
//! the log sink of last resort once interrupts are disabled on the panic
//! path.

use core::fmt;

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

/// I/O base of the first serial port.
#[cfg(target_os = "none")]
const COM1: u16 = 0x3F8;

#[cfg(target_os = "none")]
lazy_static! {
    static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is owned
        // exclusively by this static for the kernel's lifetime.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    use crate::arch::x86_64::hal;

    hal::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Write a string to COM1 without taking the interrupt guard. Used by the
/// panic handler, which runs with interrupts already disabled.
#[cfg(target_os = "none")]
pub fn write_str_raw(s: &str) {
    use fmt::Write;

    let _ = SERIAL1.lock().write_str(s);
}

#[allow(dead_code)]
#[cfg(not(target_os = "none"))]
pub fn _print(_args: fmt::Arguments) {}
