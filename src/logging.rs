//! Process-global logging and panic callbacks.
//!
//! The plugin is loaded as a shared library, so its logging and panic
//! reporting are necessarily process-global singletons rather than
//! instance state. Ordinary `tracing`
//! events are always emitted for in-process consumers (tests, or a host
//! that links this crate directly as an `rlib`); the callback pair below
//! additionally lets a C ABI host receive the same events and
//! panics without linking `tracing` itself.

use std::sync::Mutex;

use tracing::Level;

/// Severity of a log event, mirroring the source's `LogLevel` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + 'static>;
pub type PanicCallback = Box<dyn Fn(&str) + Send + 'static>;

static LOG_CALLBACK: Mutex<Option<LogCallback>> = Mutex::new(None);
static PANIC_CALLBACK: Mutex<Option<PanicCallback>> = Mutex::new(None);

/// Sets (or, with `None`, reverts to the default of) the process-global log
/// callback.
pub fn set_log_callback(callback: Option<LogCallback>) {
    *LOG_CALLBACK.lock().unwrap() = callback;
}

/// Sets (or, with `None`, reverts to the default of) the process-global
/// panic callback.
pub fn set_panic_callback(callback: Option<PanicCallback>) {
    *PANIC_CALLBACK.lock().unwrap() = callback;
}

/// Emits one log event: always through `tracing`, and through the
/// registered callback (if any) for hosts that aren't a `tracing`
/// subscriber.
pub fn log(level: LogLevel, message: &str) {
    match level.as_tracing_level() {
        Level::INFO => tracing::info!("{message}"),
        Level::WARN => tracing::warn!("{message}"),
        Level::ERROR => tracing::error!("{message}"),
        _ => tracing::debug!("{message}"),
    }

    if let Some(cb) = LOG_CALLBACK.lock().unwrap().as_ref() {
        cb(level, message);
    }
}

/// Reports a panic payload to the registered panic callback, or to stderr
/// if none is registered. Called from the C ABI's panic firewall (spec
/// §4.8) just before the process aborts.
pub fn report_panic(message: &str) {
    let guard = PANIC_CALLBACK.lock().unwrap();
    match guard.as_ref() {
        Some(cb) => cb(message),
        None => eprintln!("retrojsvice: fatal: {message}"),
    }
}

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)+) => { $crate::logging::log($crate::logging::LogLevel::Info, &format!($($arg)+)) };
}

#[macro_export]
macro_rules! warning_log {
    ($($arg:tt)+) => { $crate::logging::log($crate::logging::LogLevel::Warning, &format!($($arg)+)) };
}

#[macro_export]
macro_rules! error_log {
    ($($arg:tt)+) => { $crate::logging::log($crate::logging::LogLevel::Error, &format!($($arg)+)) };
}
