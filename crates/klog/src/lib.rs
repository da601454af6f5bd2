//! Kernel logging subsystem.
//!
//! Two entry points onto the same serial sink: the `log` facade (what
//! library code calls through `log::warn!` and friends once `init` has
//! run) and the crate's own macros for the earliest boot code.
#![no_std]

use core::fmt;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// `log` backend writing to COM1.
struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit(record.level().into(), Some(record.target()), *record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Initializes the serial port and installs the `log` backend.
///
/// Calling it twice keeps the first logger.
pub fn init(max_level: log::LevelFilter) {
    khal::serial::init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}

fn emit(level: Level, target: Option<&str>, args: fmt::Arguments) {
    match target {
        Some(target) => khal::serial::write_fmt(format_args!(
            "{}[{}]\x1b[0m {}: {}\n",
            level.color(),
            level.as_str(),
            target,
            args
        )),
        None => khal::serial::write_fmt(format_args!(
            "{}[{}]\x1b[0m {}\n",
            level.color(),
            level.as_str(),
            args
        )),
    }
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    emit(level, None, args);
}

/// Logs at ERROR level without taking the serial lock, for the panic path
/// where the panicking CPU may already hold it.
pub fn emergency(args: fmt::Arguments) {
    let level = Level::Error;
    // SAFETY: interleaving with a concurrent writer is acceptable here.
    unsafe {
        khal::serial::write_fmt_unlocked(format_args!(
            "{}[{}]\x1b[0m {}\n",
            level.color(),
            level.as_str(),
            args
        ));
    }
}

/// Print to serial without formatting
pub fn print(args: fmt::Arguments) {
    khal::serial::write_fmt(args);
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}
