//! Device drivers.
//!
//! A driver is a capability record of five operations (init, read, write,
//! control, shutdown) behind the [`Driver`] trait; the [`DeviceManager`]
//! keeps the registry the VFS device seam and diagnostics look drivers up
//! in. Built-ins cover the hardware needed to boot to an interactive
//! prompt: PIC, PIT, PS/2 keyboard, and the VGA text console.

use alloc::{boxed::Box, collections::BTreeMap, string::String, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub mod console;
pub mod keyboard;
pub mod pic;
pub mod pit;

/// Driver control commands, passed to [`Driver::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Re-program the device rate (PIT frequency, keyboard repeat, ...).
    SetRate(u64),
    /// Flush any buffered input/output.
    Flush,
    /// Device-specific command with a raw argument.
    Raw(u64, u64),
}

/// The driver capability record.
pub trait Driver: Send {
    /// Bring the device to a known state. Called once during boot.
    fn init(&mut self) -> KernelResult<()>;

    /// Read from the device at `offset` into `buf`, returning the byte
    /// count. Drivers surface errors as short counts or `DeviceError`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write `buf` to the device at `offset`, returning the byte count.
    fn write(&mut self, offset: u64, buf: &[u8]) -> KernelResult<usize>;

    /// Device-specific control operation.
    fn control(&mut self, op: ControlOp) -> KernelResult<()>;

    /// Quiesce the device.
    fn shutdown(&mut self) -> KernelResult<()>;
}

/// Name-indexed driver registry.
pub struct DeviceManager {
    drivers: Mutex<BTreeMap<String, Box<dyn Driver>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            drivers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a driver and run its `init`.
    pub fn register(&self, name: &str, mut driver: Box<dyn Driver>) -> KernelResult<()> {
        let mut drivers = self.drivers.lock();
        if drivers.contains_key(name) {
            return Err(KernelError::AlreadyExists { resource: "driver" });
        }
        driver.init()?;
        drivers.insert(String::from(name), driver);
        log::info!("drivers: registered {}", name);
        Ok(())
    }

    /// Remove a driver after running its `shutdown`.
    pub fn unregister(&self, name: &str) -> KernelResult<()> {
        let mut drivers = self.drivers.lock();
        let mut driver = drivers.remove(name).ok_or(KernelError::NotFound {
            resource: "driver",
        })?;
        driver.shutdown()
    }

    /// Run `f` against a registered driver.
    pub fn with_driver<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut dyn Driver) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let mut drivers = self.drivers.lock();
        let driver = drivers.get_mut(name).ok_or(KernelError::NotFound {
            resource: "driver",
        })?;
        f(driver.as_mut())
    }

    /// Names of all registered drivers.
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.lock().is_empty()
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in drivers in dependency order (PIC before PIT so
/// the timer line is routable when it starts firing).
pub fn register_builtin(devices: &DeviceManager) -> KernelResult<()> {
    devices.register("pic", Box::new(pic::PicDriver::new()))?;
    devices.register("pit", Box::new(pit::PitDriver::new(crate::timer::TICK_HZ)))?;
    devices.register("keyboard", Box::new(keyboard::KeyboardDriver::new()))?;
    devices.register("console", Box::new(console::ConsoleDriver::new()))?;
    Ok(())
}
