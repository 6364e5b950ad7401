//! Boot handoff types and kernel configuration.
//!
//! The boot stub invokes the kernel with a [`RawBootInfo`] pointer
//! describing the machine: an ordered memory map, the kernel image extent,
//! an optional initrd, and the command line. A null or absent handoff falls
//! back to a single default RAM region so the kernel can still come up on
//! a bare loader.

use core::slice;

use crate::process::SchedPolicy;

/// Default fallback RAM region: 1 MiB .. 17 MiB.
pub const FALLBACK_RAM_BASE: u64 = 0x10_0000;
pub const FALLBACK_RAM_LENGTH: u64 = 0x100_0000;

/// Memory-map region classification, matching the handoff encoding
/// (1=RAM, 2=Reserved, 3=ACPI, 4=NVS, 5=Unusable, 7=Persistent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Ram,
    Reserved,
    Acpi,
    Nvs,
    Unusable,
    Persistent,
}

impl RegionType {
    /// Decode the raw integer from the handoff map. Unknown values are
    /// treated as Reserved so the allocator never hands out frames from
    /// regions it does not understand.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Ram,
            2 => Self::Reserved,
            3 => Self::Acpi,
            4 => Self::Nvs,
            5 => Self::Unusable,
            7 => Self::Persistent,
            _ => Self::Reserved,
        }
    }

    /// Only RAM contributes allocatable frames.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ram)
    }
}

/// One entry of the handoff memory map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

impl MemoryMapEntry {
    pub fn region_type(&self) -> RegionType {
        RegionType::from_raw(self.kind)
    }
}

/// Initrd location, if the loader provided one.
#[derive(Debug, Clone, Copy)]
pub struct InitrdInfo {
    pub base: u64,
    pub size: u64,
}

/// Decoded boot information, borrowed from loader-provided memory.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    pub kernel_base: u64,
    pub kernel_size: u64,
    pub initrd: Option<InitrdInfo>,
    pub cmdline: &'a str,
}

static FALLBACK_MAP: [MemoryMapEntry; 1] = [MemoryMapEntry {
    base: FALLBACK_RAM_BASE,
    length: FALLBACK_RAM_LENGTH,
    kind: 1,
}];

impl BootInfo<'static> {
    /// The default machine description used when the loader hands over
    /// nothing: one RAM region at 1 MiB..17 MiB, empty command line.
    pub fn fallback() -> Self {
        Self {
            memory_map: &FALLBACK_MAP,
            kernel_base: FALLBACK_RAM_BASE,
            kernel_size: 0,
            initrd: None,
            cmdline: "",
        }
    }
}

/// The raw record the boot stub passes in RDI. All pointers are physical
/// addresses reachable through the loader's identity mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBootInfo {
    pub memory_map_ptr: u64,
    pub memory_map_len: u64,
    pub kernel_base: u64,
    pub kernel_size: u64,
    pub initrd_base: u64,
    pub initrd_size: u64,
    pub cmdline_ptr: u64,
    pub cmdline_len: u64,
}

impl RawBootInfo {
    /// Decode the raw handoff into borrowed form.
    ///
    /// # Safety
    ///
    /// The embedded pointers must reference memory that stays valid and
    /// unmodified for the returned lifetime, with `memory_map_len` entries
    /// and `cmdline_len` bytes of UTF-8 (invalid bytes degrade to an empty
    /// command line).
    pub unsafe fn decode<'a>(&self) -> BootInfo<'a> {
        let memory_map = if self.memory_map_ptr == 0 || self.memory_map_len == 0 {
            &FALLBACK_MAP[..]
        } else {
            // SAFETY: Per the function contract.
            unsafe {
                slice::from_raw_parts(
                    self.memory_map_ptr as *const MemoryMapEntry,
                    self.memory_map_len as usize,
                )
            }
        };

        let cmdline = if self.cmdline_ptr == 0 || self.cmdline_len == 0 {
            ""
        } else {
            // SAFETY: Per the function contract.
            let bytes = unsafe {
                slice::from_raw_parts(self.cmdline_ptr as *const u8, self.cmdline_len as usize)
            };
            core::str::from_utf8(bytes).unwrap_or("")
        };

        BootInfo {
            memory_map,
            kernel_base: self.kernel_base,
            kernel_size: self.kernel_size,
            initrd: (self.initrd_base != 0).then_some(InitrdInfo {
                base: self.initrd_base,
                size: self.initrd_size,
            }),
            cmdline,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel configuration (command line)
// ---------------------------------------------------------------------------

/// Runtime configuration parsed from the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Maximum log level (`loglevel=` on the command line).
    pub log_level: log::LevelFilter,
    /// Default scheduling policy for new processes (`sched=`).
    pub default_policy: SchedPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            default_policy: SchedPolicy::Cfs,
        }
    }
}

impl KernelConfig {
    /// Parse `key=value` options separated by whitespace. Unknown keys and
    /// malformed values are ignored; defaults apply.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();
        for option in cmdline.split_whitespace() {
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            match key {
                "loglevel" => {
                    config.log_level = match value {
                        "off" => log::LevelFilter::Off,
                        "error" => log::LevelFilter::Error,
                        "warn" => log::LevelFilter::Warn,
                        "info" => log::LevelFilter::Info,
                        "debug" => log::LevelFilter::Debug,
                        "trace" => log::LevelFilter::Trace,
                        _ => config.log_level,
                    };
                }
                "sched" => {
                    config.default_policy = match value {
                        "rr" => SchedPolicy::RoundRobin,
                        "cfs" => SchedPolicy::Cfs,
                        "batch" => SchedPolicy::Batch,
                        _ => config.default_policy,
                    };
                }
                _ => {}
            }
        }
        config
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn fallback_map_is_one_ram_region() {
        let info = BootInfo::fallback();
        assert_eq!(info.memory_map.len(), 1);
        assert_eq!(info.memory_map[0].region_type(), RegionType::Ram);
        assert_eq!(info.memory_map[0].base, 0x10_0000);
        assert_eq!(info.memory_map[0].length, 0x100_0000);
    }

    #[test]
    fn region_type_decoding() {
        assert_eq!(RegionType::from_raw(1), RegionType::Ram);
        assert_eq!(RegionType::from_raw(2), RegionType::Reserved);
        assert_eq!(RegionType::from_raw(3), RegionType::Acpi);
        assert_eq!(RegionType::from_raw(4), RegionType::Nvs);
        assert_eq!(RegionType::from_raw(5), RegionType::Unusable);
        assert_eq!(RegionType::from_raw(99), RegionType::Reserved);
        assert!(RegionType::Ram.is_usable());
        assert!(!RegionType::Acpi.is_usable());
    }

    #[test]
    fn cmdline_parsing() {
        let config = KernelConfig::parse("loglevel=debug sched=rr quiet");
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.default_policy, SchedPolicy::RoundRobin);

        let defaults = KernelConfig::parse("");
        assert_eq!(defaults.log_level, log::LevelFilter::Info);
        assert_eq!(defaults.default_policy, SchedPolicy::Cfs);
    }
}
