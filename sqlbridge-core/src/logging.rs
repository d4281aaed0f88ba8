// sqlbridge-core/src/logging.rs
//! Embedded logging for the bridge
//!
//! A global atomic level plus `log_*!` macros. Output goes to stderr unless
//! a sink has been installed, which lets a host route bridge diagnostics
//! into its own logger (the JNI layer forwards them to a managed callback
//! when one is configured).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

/// Log levels (ordered by severity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Failures that abort an operation
    Error = 0,
    /// Suppressed callback exceptions, teardown failures
    Warn = 1,
    /// Lifecycle events (open, close, shutdown)
    Info = 2,
    /// Cache resolutions and hook (un)binding
    Debug = 3,
    /// Every boundary crossing
    Trace = 4,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_uppercase().as_str() {
            "ERROR" => Some(LogLevel::Error),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "TRACE" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(level: u8) -> LogLevel {
        match level {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            4 => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// Receiver for formatted log records
pub type LogSink = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

// Global log level (default: WARN)
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

lazy_static! {
    static ref LOG_SINK: RwLock<Option<LogSink>> = RwLock::new(None);
}

pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> LogLevel {
    LogLevel::from_u8(GLOBAL_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Install a sink; replaces any previous one
pub fn set_log_sink(sink: LogSink) {
    *LOG_SINK.write() = Some(sink);
}

/// Drop the installed sink and fall back to stderr
pub fn reset_log_sink() {
    *LOG_SINK.write() = None;
}

#[inline]
pub fn should_log(level: LogLevel) -> bool {
    level <= get_log_level()
}

#[doc(hidden)]
pub fn log_message(level: LogLevel, module: &str, message: &str) {
    if !should_log(level) {
        return;
    }
    // Clone out of the lock: a sink may itself log.
    let sink = LOG_SINK.read().clone();
    match sink {
        Some(sink) => sink(level, module, message),
        None => eprintln!("[sqlbridge] {} {}: {}", level.as_str(), module, message),
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Trace,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" DeBuG "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    // Level and sink are process-global, so both are checked in one test.
    #[test]
    fn test_level_filtering_and_sink() {
        use parking_lot::Mutex;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        set_log_sink(Arc::new(move |level, module, msg| {
            if module.ends_with("logging::tests") {
                sink_seen.lock().push(format!("{} {}", level.as_str(), msg));
            }
        }));

        set_log_level(LogLevel::Info);
        assert_eq!(get_log_level(), LogLevel::Info);
        assert!(should_log(LogLevel::Warn));
        assert!(!should_log(LogLevel::Debug));

        crate::log_info!("opened {}", "main");
        crate::log_debug!("hidden");
        reset_log_sink();
        set_log_level(LogLevel::Warn);

        let seen = seen.lock();
        assert_eq!(*seen, vec!["INFO opened main".to_string()]);
    }
}
