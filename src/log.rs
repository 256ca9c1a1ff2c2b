//! Logging Infrastructure
//!
//! Structured, leveled logging for the runtime. The minimum level is read
//! from `FILAMENT_LOG_LEVEL` on first use and can be changed at run time.
//! Output goes to stderr in plain text.
//!
//! Besides the usual leveled helpers, this module provides the rate-limited
//! warning macros the runtime internals rely on: [`warn_once!`] for
//! conditions worth reporting exactly once per process (e.g. a fiber-local
//! slot index past the inline range) and [`warn_every_second!`] for
//! conditions that may persist and would otherwise flood the log (e.g. a
//! pool whose free backlog keeps piling up).

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Get the level from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Minimum log level. 0xff means "not yet loaded from the environment".
static MIN_LEVEL: AtomicU8 = AtomicU8::new(0xff);

fn load_min_level() -> u8 {
    let level = std::env::var("FILAMENT_LOG_LEVEL")
        .ok()
        .and_then(|s| LogLevel::parse(&s))
        .unwrap_or_default() as u8;
    MIN_LEVEL.store(level, Ordering::Relaxed);
    level
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    let mut v = MIN_LEVEL.load(Ordering::Relaxed);
    if v == 0xff {
        v = load_min_level();
    }
    LogLevel::from_u8(v).unwrap_or_default()
}

/// Check if a log level would be logged.
pub fn would_log(lvl: LogLevel) -> bool {
    lvl >= level()
}

/// Seconds since process start (coarse, monotonic). Shared anchor for
/// rate-limited logging.
pub fn coarse_uptime_secs() -> u64 {
    crate::time::since_start().as_secs()
}

/// Emit a log line at the given level.
pub fn log(lvl: LogLevel, message: impl AsRef<str>) {
    if !would_log(lvl) {
        return;
    }
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("?");
    let _ = writeln!(
        std::io::stderr(),
        "[{:>6}.{:03}] {:<5} ({}) {}",
        coarse_uptime_secs(),
        0, // sub-second precision is not worth a second clock read here
        lvl.as_str(),
        name,
        message.as_ref()
    );
}

/// Log a trace message.
pub fn trace(message: impl AsRef<str>) {
    log(LogLevel::Trace, message);
}

/// Log a debug message.
pub fn debug(message: impl AsRef<str>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl AsRef<str>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl AsRef<str>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl AsRef<str>) {
    log(LogLevel::Error, message);
}

/// Log a warning at most once per process, per call site.
#[macro_export]
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static FIRED: ::std::sync::atomic::AtomicBool =
            ::std::sync::atomic::AtomicBool::new(false);
        if !FIRED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            $crate::log::warn(format!($($arg)*));
        }
    }};
}

/// Log a warning at most once per second, per call site.
#[macro_export]
macro_rules! warn_every_second {
    ($($arg:tt)*) => {{
        // Stores the next second at which this call site may fire again.
        static NEXT: ::std::sync::atomic::AtomicU64 =
            ::std::sync::atomic::AtomicU64::new(0);
        let now = $crate::log::coarse_uptime_secs();
        let next = NEXT.load(::std::sync::atomic::Ordering::Relaxed);
        if now >= next
            && NEXT
                .compare_exchange(
                    next,
                    now + 1,
                    ::std::sync::atomic::Ordering::Relaxed,
                    ::std::sync::atomic::Ordering::Relaxed,
                )
                .is_ok()
        {
            $crate::log::warn(format!($($arg)*));
        }
    }};
}
