//! `log` backend on a PL011 UART
//!
//! Records are written synchronously under a spinlock, one line each, as
//! `[LEVEL] target: message`.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::mmio::RegisterIo;
use crate::sync::SpinLock;

const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
/// Transmit FIFO full.
const UART_FR_TXFF: u32 = 1 << 5;

/// Level used when the platform does not pick one.
pub const DEFAULT_LEVEL: LevelFilter = if cfg!(feature = "mmio_trace") {
    LevelFilter::Trace
} else {
    LevelFilter::Info
};

/// Transmit side of a PL011.
pub struct Pl011<R> {
    regs: R,
}

impl<R: RegisterIo> Pl011<R> {
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    pub fn putc(&self, c: u8) {
        while self.regs.read32(UART_FR) & UART_FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        self.regs.write32(UART_DR, c as u32);
    }
}

impl<R: RegisterIo> Write for Pl011<R> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
        Ok(())
    }
}

pub struct UartLogger<R> {
    uart: SpinLock<Pl011<R>>,
    level: LevelFilter,
}

impl<R: RegisterIo> UartLogger<R> {
    pub const fn new(regs: R, level: LevelFilter) -> Self {
        Self {
            uart: SpinLock::new(Pl011::new(regs)),
            level,
        }
    }
}

impl<R: RegisterIo + Send> Log for UartLogger<R> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut uart = self.uart.lock();
        let _ = writeln!(uart, "[{:<5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install `logger` as the global logger. Only the first call succeeds.
pub fn init<R: RegisterIo + Send>(logger: &'static UartLogger<R>) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(logger.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeUart {
        tx: Mutex<Vec<u8>>,
    }

    impl RegisterIo for FakeUart {
        fn read32(&self, _offset: usize) -> u32 {
            0
        }
        fn write32(&self, offset: usize, value: u32) {
            assert_eq!(offset, UART_DR);
            self.tx.lock().unwrap().push(value as u8);
        }
        fn read64(&self, _offset: usize) -> u64 {
            0
        }
        fn write64(&self, _offset: usize, _value: u64) {}
    }

    fn output(logger: &UartLogger<FakeUart>) -> String {
        let uart = logger.uart.lock();
        let bytes = uart.regs.tx.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_record_format() {
        let logger = UartLogger::new(FakeUart::default(), LevelFilter::Info);
        logger.log(
            &Record::builder()
                .level(log::Level::Warn)
                .target("iommu")
                .args(format_args!("domain {} busy", 5))
                .build(),
        );
        assert_eq!(output(&logger), "[WARN ] iommu: domain 5 busy\r\n");
    }

    #[test]
    fn test_level_filter() {
        let logger = UartLogger::new(FakeUart::default(), LevelFilter::Warn);
        logger.log(
            &Record::builder()
                .level(log::Level::Debug)
                .args(format_args!("dropped"))
                .build(),
        );
        assert!(output(&logger).is_empty());
    }
}
