//! Interrupt handling module.
//!
//! Installs the 256-entry Interrupt Descriptor Table: vectors 0..32 are CPU
//! exceptions whose common path logs the mnemonic over serial and halts with
//! interrupts masked (there is no kernel fault recovery in this iteration);
//! vectors 32..48 are the legacy PIC lines remapped past the exception range.
//! Handlers run through interrupt gates, so device handlers complete
//! atomically with respect to other IRQs on this CPU.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::{
    instructions::port::Port,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::{gdt, keyboard, pit, serial_println};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting
/// after the CPU exception vectors).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The chained PICs used for handling hardware interrupts.
pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the interrupt indices.
pub enum InterruptIndex {
    /// Timer interrupt index.
    Timer = PIC_1_OFFSET,
    /// Keyboard interrupt index.
    Keyboard,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        // SAFETY:
        // The double fault handler is safe to set as the IST index is valid.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(keyboard_interrupt_handler);

        // The remaining PIC lines are masked, but a gate behind each keeps
        // a spurious delivery from double-faulting.
        idt[34].set_handler_fn(irq_stub_34);
        idt[35].set_handler_fn(irq_stub_35);
        idt[36].set_handler_fn(irq_stub_36);
        idt[37].set_handler_fn(irq_stub_37);
        idt[38].set_handler_fn(irq_stub_38);
        idt[39].set_handler_fn(irq_stub_39);
        idt[40].set_handler_fn(irq_stub_40);
        idt[41].set_handler_fn(irq_stub_41);
        idt[42].set_handler_fn(irq_stub_42);
        idt[43].set_handler_fn(irq_stub_43);
        idt[44].set_handler_fn(irq_stub_44);
        idt[45].set_handler_fn(irq_stub_45);
        idt[46].set_handler_fn(irq_stub_46);
        idt[47].set_handler_fn(irq_stub_47);
        idt
    };
}

/// Acknowledge-and-ignore stubs for device lines no driver claims; the
/// chained PIC driver routes each EOI to the right controller.
macro_rules! unhandled_irq_stub {
    ($($name:ident => $vector:expr),* $(,)?) => {
        $(
            extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
                // SAFETY:
                // We are notifying the PIC that the interrupt has been
                // handled.
                unsafe {
                    PICS.lock().notify_end_of_interrupt($vector);
                }
            }
        )*
    };
}

unhandled_irq_stub! {
    irq_stub_34 => 34,
    irq_stub_35 => 35,
    irq_stub_36 => 36,
    irq_stub_37 => 37,
    irq_stub_38 => 38,
    irq_stub_39 => 39,
    irq_stub_40 => 40,
    irq_stub_41 => 41,
    irq_stub_42 => 42,
    irq_stub_43 => 43,
    irq_stub_44 => 44,
    irq_stub_45 => 45,
    irq_stub_46 => 46,
    irq_stub_47 => 47,
}

/// Initialize the Interrupt Descriptor Table (IDT).
pub fn init_idt() {
    IDT.load();
}

/// Common exit for CPU exceptions taken in kernel context: log and stop.
fn fatal_exception(mnemonic: &str, stack_frame: &InterruptStackFrame) -> ! {
    serial_println!("EXCEPTION: {}\n{:#?}", mnemonic, stack_frame);
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("DIVIDE ERROR", &stack_frame);
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("DEBUG", &stack_frame);
}

extern "x86-interrupt" fn nmi_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("NON-MASKABLE INTERRUPT", &stack_frame);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    // int3 is the one exception that is not fatal; it is used by the
    // interrupt smoke test.
    serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn overflow_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("OVERFLOW", &stack_frame);
}

extern "x86-interrupt" fn bound_range_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("BOUND RANGE EXCEEDED", &stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("INVALID OPCODE", &stack_frame);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("DEVICE NOT AVAILABLE", &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    fatal_exception("DOUBLE FAULT", &stack_frame);
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    serial_println!("EXCEPTION: INVALID TSS (error {:#x})", error_code);
    fatal_exception("INVALID TSS", &stack_frame);
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    serial_println!("EXCEPTION: SEGMENT NOT PRESENT (error {:#x})", error_code);
    fatal_exception("SEGMENT NOT PRESENT", &stack_frame);
}

extern "x86-interrupt" fn stack_segment_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    serial_println!("EXCEPTION: STACK-SEGMENT FAULT (error {:#x})", error_code);
    fatal_exception("STACK-SEGMENT FAULT", &stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    serial_println!("EXCEPTION: GENERAL PROTECTION FAULT (error {:#x})", error_code);
    fatal_exception("GENERAL PROTECTION FAULT", &stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    serial_println!("EXCEPTION: PAGE FAULT");
    serial_println!("Accessed address: {:?}", Cr2::read());
    serial_println!("Error code: {:?}", error_code);
    fatal_exception("PAGE FAULT", &stack_frame);
}

extern "x86-interrupt" fn x87_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("X87 FLOATING POINT", &stack_frame);
}

extern "x86-interrupt" fn alignment_check_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) {
    fatal_exception("ALIGNMENT CHECK", &stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    fatal_exception("MACHINE CHECK", &stack_frame);
}

extern "x86-interrupt" fn simd_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("SIMD FLOATING POINT", &stack_frame);
}

extern "x86-interrupt" fn virtualization_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("VIRTUALIZATION", &stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    pit::record_tick();

    // Acknowledge before the scheduler callback: the callback may switch to
    // a task that leaves the kernel through a path that never returns here,
    // and the in-service line must not stay latched. Interrupts remain
    // masked until `iretq`, so no nested tick can slip in.
    //
    // SAFETY:
    // We are notifying the PIC that the interrupt has been handled.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    pit::run_tick_callback();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let mut port = Port::new(0x60);

    // Read the scancode from the keyboard port.
    //
    // SAFETY:
    // We are reading from the keyboard data port which is known to be safe.
    let scancode: u8 = unsafe { port.read() };
    keyboard::add_scancode(scancode);

    // SAFETY:
    // We are notifying the PIC that the interrupt has been handled.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

#[cfg(test)]
mod tests {
    use x86_64::instructions::interrupts;

    #[test_case]
    fn test_breakpoint_exception() {
        interrupts::int3();
    }
}
