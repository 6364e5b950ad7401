//! 8254 programmable interval timer.
//!
//! Channel 0 is programmed as a rate generator (mode 0x36, lobyte/hibyte)
//! dividing the 1,193,182 Hz base clock down to the kernel tick rate. The
//! IRQ0 handler advances the tick counter and invokes the scheduler; this
//! module only owns the hardware programming.

use crate::error::{KernelError, KernelResult};

use super::{ControlOp, Driver};

/// Mode/command register.
pub const COMMAND_PORT: u16 = 0x43;
/// Channel 0 data port.
pub const CHANNEL0_PORT: u16 = 0x40;

/// Input clock of the 8254.
pub const BASE_FREQUENCY_HZ: u64 = 1_193_182;

/// Channel 0, access lobyte/hibyte, mode 3 (square wave rate generator).
pub const MODE_RATE_GENERATOR: u8 = 0x36;

/// Divisor that produces `target_hz` interrupts per second. The 16-bit
/// reload register treats 0 as 65536.
pub fn divisor_for(target_hz: u64) -> u16 {
    let divisor = BASE_FREQUENCY_HZ / target_hz.max(19); // 19 Hz is the floor a 16-bit divisor allows
    divisor.min(u16::MAX as u64) as u16
}

#[cfg(target_os = "none")]
fn program_channel0(divisor: u16) {
    use crate::arch::x86_64::hal;

    // SAFETY: Writing the mode byte followed by the divisor lobyte/hibyte
    // is the documented 8254 programming sequence; interrupts are held off
    // so the two data writes are not torn by a tick.
    hal::without_interrupts(|| unsafe {
        hal::outb(COMMAND_PORT, MODE_RATE_GENERATOR);
        hal::outb(CHANNEL0_PORT, (divisor & 0xFF) as u8);
        hal::outb(CHANNEL0_PORT, (divisor >> 8) as u8);
    });
}

/// PIT driver for the device registry.
pub struct PitDriver {
    target_hz: u64,
}

impl PitDriver {
    pub fn new(target_hz: u64) -> Self {
        Self { target_hz }
    }
}

impl Driver for PitDriver {
    fn init(&mut self) -> KernelResult<()> {
        let divisor = divisor_for(self.target_hz);
        #[cfg(target_os = "none")]
        program_channel0(divisor);
        log::info!(
            "pit: channel 0 at {} Hz (divisor {})",
            self.target_hz,
            divisor
        );
        Ok(())
    }

    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        // Reading the PIT yields the current tick count, little-endian.
        let ticks = crate::timer::get_ticks().to_le_bytes();
        let n = buf.len().min(ticks.len());
        buf[..n].copy_from_slice(&ticks[..n]);
        Ok(n)
    }

    fn write(&mut self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotPermitted {
            operation: "write to the timer device",
        })
    }

    fn control(&mut self, op: ControlOp) -> KernelResult<()> {
        match op {
            ControlOp::SetRate(hz) => {
                if hz == 0 || hz > BASE_FREQUENCY_HZ {
                    return Err(KernelError::Invalid {
                        what: "timer frequency out of range",
                    });
                }
                self.target_hz = hz;
                #[cfg(target_os = "none")]
                program_channel0(divisor_for(hz));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn shutdown(&mut self) -> KernelResult<()> {
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn default_rate_divisor() {
        // 1,193,182 / 100 Hz = 11931 (integer division).
        assert_eq!(divisor_for(100), 11931);
    }

    #[test]
    fn rates_below_the_hardware_floor_are_clamped() {
        // A 16-bit divisor cannot produce less than ~19 Hz.
        assert_eq!(divisor_for(1), divisor_for(19));
        assert_eq!(divisor_for(19), (BASE_FREQUENCY_HZ / 19) as u16);
    }

    #[test]
    fn constants_are_the_legacy_values() {
        assert_eq!(COMMAND_PORT, 0x43);
        assert_eq!(CHANNEL0_PORT, 0x40);
        assert_eq!(BASE_FREQUENCY_HZ, 1_193_182);
        assert_eq!(MODE_RATE_GENERATOR, 0x36);
    }

    #[test]
    fn set_rate_validates_range() {
        let mut pit = PitDriver::new(100);
        assert!(pit.control(ControlOp::SetRate(0)).is_err());
        assert!(pit.control(ControlOp::SetRate(1000)).is_ok());
        assert_eq!(pit.target_hz, 1000);
    }
}
