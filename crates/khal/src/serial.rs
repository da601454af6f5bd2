//! Serial port (COM1 UART 16550) driver.
//!
//! Polled output only. The global instance is taken with interrupts
//! disabled so an interrupt handler that logs cannot deadlock against
//! the code it interrupted.

use core::fmt;

use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

/// COM1 base port address
const COM1_PORT: u16 = 0x3F8;

/// Line status register bit 5: transmit holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;

/// Serial port driver for COM1
pub struct Serial {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
    initialized: bool,
}

impl Serial {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
            initialized: false,
        }
    }

    /// Initialize the serial port (115200 baud, 8N1).
    pub fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00);

            // DLAB on, divisor 1 (115200 baud), DLAB off with 8N1.
            self.line_ctrl.write(0x80);
            self.data.write(0x01);
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x03);

            // FIFO on and cleared, 14-byte threshold.
            self.fifo_ctrl.write(0xC7);

            // DTR, RTS, OUT1, OUT2; interrupts stay off, we poll.
            self.modem_ctrl.write(0x0F);
        }
        self.initialized = true;
    }

    fn transmit_empty(&mut self) -> bool {
        unsafe { self.line_status.read() & LSR_THR_EMPTY != 0 }
    }

    /// Write a byte to the serial port
    pub fn write_byte(&mut self, byte: u8) {
        if !self.initialized {
            return;
        }

        while !self.transmit_empty() {
            core::hint::spin_loop();
        }

        unsafe {
            self.data.write(byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global serial port instance (COM1)
static SERIAL: Mutex<Serial> = Mutex::new(Serial::new(COM1_PORT));

/// Initialize the global serial port
pub fn init() {
    interrupts::without_interrupts(|| SERIAL.lock().init());
}

/// Write a string to the serial port
pub fn write_str(s: &str) {
    use fmt::Write;
    interrupts::without_interrupts(|| {
        let _ = SERIAL.lock().write_str(s);
    });
}

/// Write formatted arguments to the serial port
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    interrupts::without_interrupts(|| {
        let _ = SERIAL.lock().write_fmt(args);
    });
}

/// Writes without taking the lock, for the panic path where the lock
/// may be held by the CPU that panicked.
///
/// # Safety
/// Output may interleave with a concurrent writer.
pub unsafe fn write_fmt_unlocked(args: fmt::Arguments) {
    use fmt::Write;
    let mut port = Serial::new(COM1_PORT);
    port.initialized = true;
    let _ = port.write_fmt(args);
}
