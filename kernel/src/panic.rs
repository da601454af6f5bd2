// =============================================================================
// MinimalOS NextGen — Kernel Panic Handler
// =============================================================================
//
// Every broken invariant in the scheduler and its locks ends up here. The
// handler logs without the serial lock (this CPU may hold it), stops in an
// attached debugger, and halts this CPU with interrupts disabled. Other CPUs
// keep running until they hit the same state or a lock the panicking CPU
// holds.
// =============================================================================

use core::panic::PanicInfo;

use khal::cpu;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cpu::irq_save_disable();

    match info.location() {
        Some(location) => klog::emergency(format_args!(
            "KERNEL PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        )),
        None => klog::emergency(format_args!("KERNEL PANIC: {}", info.message())),
    }

    cpu::debug_trap();
    cpu::halt_forever()
}
