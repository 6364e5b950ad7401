// Global Descriptor Table

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Selector values baked into freshly created process contexts.
/// They must agree with the GDT layout below.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x2B; // GDT offset 0x28 + RPL 3
pub const USER_CODE_SELECTOR: u16 = 0x33; // GDT offset 0x30 + RPL 3

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod table {
    use lazy_static::lazy_static;
    use x86_64::{
        structures::{
            gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
            tss::TaskStateSegment,
        },
        VirtAddr,
    };

    use super::DOUBLE_FAULT_IST_INDEX;

    lazy_static! {
        static ref TSS: TaskStateSegment = {
            let mut tss = TaskStateSegment::new();

            // Kernel stack for ring 0 transitions. Must be 16-byte aligned
            // for the x86_64 ABI (movaps et al.).
            tss.privilege_stack_table[0] = {
                const STACK_SIZE: usize = 4096 * 5;
                #[repr(align(16))]
                #[allow(dead_code)] // Alignment wrapper -- accessed via raw pointer
                struct AlignedStack([u8; STACK_SIZE]);
                static mut KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

                let stack_ptr = &raw const KERNEL_STACK;
                let stack_start = VirtAddr::from_ptr(stack_ptr);
                stack_start + STACK_SIZE as u64
            };

            // Dedicated double-fault stack so a kernel stack overflow still
            // reaches the handler.
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                const STACK_SIZE: usize = 4096 * 5;
                #[repr(align(16))]
                #[allow(dead_code)] // Alignment wrapper -- accessed via raw pointer
                struct AlignedStack([u8; STACK_SIZE]);
                static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

                let stack_ptr = &raw const STACK;
                let stack_start = VirtAddr::from_ptr(stack_ptr);
                stack_start + STACK_SIZE as u64
            };
            tss
        };
    }

    lazy_static! {
        static ref GDT: (GlobalDescriptorTable, Selectors) = {
            let mut gdt = GlobalDescriptorTable::new();
            let code_selector = gdt.append(Descriptor::kernel_code_segment());    // 0x08
            let data_selector = gdt.append(Descriptor::kernel_data_segment());    // 0x10
            let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));         // 0x18 (2 entries)
            let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x28 (+ RPL 3 = 0x2B)
            let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x30 (+ RPL 3 = 0x33)
            (
                gdt,
                Selectors {
                    code_selector,
                    data_selector,
                    tss_selector,
                    user_data_selector,
                    user_code_selector,
                },
            )
        };
    }

    /// GDT segment selectors for kernel and user mode.
    ///
    /// Layout:
    /// - 0x00: Null descriptor
    /// - 0x08: Kernel code segment (Ring 0)
    /// - 0x10: Kernel data segment (Ring 0)
    /// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
    /// - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
    /// - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
    #[allow(dead_code)]
    struct Selectors {
        code_selector: SegmentSelector,
        data_selector: SegmentSelector,
        tss_selector: SegmentSelector,
        user_data_selector: SegmentSelector,
        user_code_selector: SegmentSelector,
    }

    /// Load the GDT and reload segment registers and the TSS.
    pub fn init() {
        use x86_64::instructions::{
            segmentation::{Segment, CS, SS},
            tables::load_tss,
        };

        GDT.0.load();
        // SAFETY: The selectors come from the GDT loaded on the line above;
        // CS/SS must be reloaded for the new descriptors to take effect,
        // and the TSS selector points at the static TSS.
        unsafe {
            CS::set_reg(GDT.1.code_selector);
            SS::set_reg(GDT.1.data_selector);
            load_tss(GDT.1.tss_selector);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use table::init;
