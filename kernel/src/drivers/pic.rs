//! Legacy 8259 PIC driver.
//!
//! On init the cascaded pair is reprogrammed so IRQ 0-7 land on vectors
//! 0x20-0x27 and IRQ 8-15 on 0x28-0x2F, with all lines unmasked. Every IRQ
//! handler must send exactly one end-of-interrupt before returning: to the
//! master alone for IRQ 0-7, to both controllers for IRQ 8-15 (the slave
//! cascades through master line 2). A missed EOI masks the line for good.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;

use super::{ControlOp, Driver};

/// Master PIC command/data ports.
pub const MASTER_COMMAND: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
/// Slave PIC command/data ports.
pub const SLAVE_COMMAND: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;

/// Remapped vector bases.
pub const MASTER_OFFSET: u8 = 0x20;
pub const SLAVE_OFFSET: u8 = 0x28;

/// End-of-interrupt command byte.
pub const EOI: u8 = 0x20;

/// Number of IRQ lines across both controllers.
pub const IRQ_LINES: usize = 16;

#[cfg(target_os = "none")]
static PICS: spin::Mutex<pic8259::ChainedPics> =
    // SAFETY: The offsets 0x20/0x28 do not collide with CPU exceptions and
    // the object is the sole owner of the PIC ports.
    spin::Mutex::new(unsafe { pic8259::ChainedPics::new(MASTER_OFFSET, SLAVE_OFFSET) });

/// Per-line EOI counters (diagnostics and the EOI-discipline invariant).
static EOI_COUNTS: [AtomicU64; IRQ_LINES] = [const { AtomicU64::new(0) }; IRQ_LINES];

/// Which controllers an EOI for `irq` must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoiTargets {
    pub master: bool,
    pub slave: bool,
}

/// EOI routing: the master always acknowledges; the slave only for its
/// own lines (IRQ 8-15).
pub fn eoi_targets(irq: u8) -> EoiTargets {
    EoiTargets {
        master: true,
        slave: irq >= 8,
    }
}

/// Signal end-of-interrupt for `irq` to the correct controller(s).
pub fn send_eoi(irq: u8) {
    debug_assert!((irq as usize) < IRQ_LINES);
    EOI_COUNTS[irq as usize % IRQ_LINES].fetch_add(1, Ordering::Relaxed);

    #[cfg(target_os = "none")]
    {
        // SAFETY: notify_end_of_interrupt writes the EOI command to the
        // controller(s) responsible for this vector; the PICS mutex keeps
        // command sequences whole.
        unsafe {
            PICS.lock().notify_end_of_interrupt(MASTER_OFFSET + irq);
        }
    }
}

/// EOIs issued so far for `irq`.
pub fn eoi_count(irq: u8) -> u64 {
    EOI_COUNTS[irq as usize % IRQ_LINES].load(Ordering::Relaxed)
}

/// PIC driver wrapper for the device registry.
pub struct PicDriver {
    initialized: bool,
}

impl PicDriver {
    pub fn new() -> Self {
        Self { initialized: false }
    }
}

impl Default for PicDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for PicDriver {
    fn init(&mut self) -> KernelResult<()> {
        #[cfg(target_os = "none")]
        {
            // SAFETY: Runs the ICW1/ICW2/ICW3/ICW4 initialization sequence
            // (0x11, vector bases, cascade wiring 4/2, mode 0x01) on ports
            // this driver owns, then clears both masks.
            unsafe {
                let mut pics = PICS.lock();
                pics.initialize();
                pics.write_masks(0, 0);
            }
        }
        self.initialized = true;
        log::info!(
            "pic: remapped to vectors {:#x}/{:#x}, all lines unmasked",
            MASTER_OFFSET,
            SLAVE_OFFSET
        );
        Ok(())
    }

    fn read(&mut self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Ok(0)
    }

    fn write(&mut self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        Ok(buf.len())
    }

    fn control(&mut self, op: ControlOp) -> KernelResult<()> {
        if let ControlOp::Raw(irq, _) = op {
            send_eoi(irq as u8);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> KernelResult<()> {
        #[cfg(target_os = "none")]
        {
            // SAFETY: Masking every line is always safe; no further IRQs
            // will be delivered from the PIC.
            unsafe {
                PICS.lock().write_masks(0xFF, 0xFF);
            }
        }
        self.initialized = false;
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn master_only_for_low_irqs() {
        for irq in 0..8 {
            let targets = eoi_targets(irq);
            assert!(targets.master);
            assert!(!targets.slave, "irq {} must not reach the slave", irq);
        }
    }

    #[test]
    fn both_pics_for_high_irqs() {
        for irq in 8..16 {
            let targets = eoi_targets(irq);
            assert!(targets.master);
            assert!(targets.slave, "irq {} must reach both PICs", irq);
        }
    }

    #[test]
    fn each_eoi_is_counted_exactly_once() {
        let before = eoi_count(5);
        send_eoi(5);
        send_eoi(5);
        assert_eq!(eoi_count(5), before + 2);
    }

    #[test]
    fn port_constants_are_the_legacy_values() {
        assert_eq!(MASTER_COMMAND, 0x20);
        assert_eq!(MASTER_DATA, 0x21);
        assert_eq!(SLAVE_COMMAND, 0xA0);
        assert_eq!(SLAVE_DATA, 0xA1);
        assert_eq!(EOI, 0x20);
        assert_eq!(MASTER_OFFSET, 0x20);
        assert_eq!(SLAVE_OFFSET, 0x28);
    }
}
