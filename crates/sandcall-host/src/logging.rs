//! Logging host function implementation.
//!
//! This module provides the host side of `env.log`, allowing guest modules to
//! emit log lines that are captured by the runtime.

use std::panic::{AssertUnwindSafe, catch_unwind};

use sandcall_core::store::{InvocationContext, LogLevel};
use tracing::{debug, error, info, warn};

/// Host implementation for the logging interface.
///
/// Every guest log line is:
/// 1. Emitted via the `tracing` crate for observability
/// 2. Forwarded to the module's [`LogCallback`](sandcall_core::LogCallback),
///    if one was registered at load
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the given numeric level.
    ///
    /// The callback receives the level exactly as the guest passed it. A
    /// callback that returns an error or panics is logged and otherwise
    /// ignored.
    pub fn log(ctx: &mut InvocationContext, level: u32, message: &str) {
        ctx.metrics.log_count += 1;

        let invocation_id = ctx.invocation_id.as_str();
        match level_from_u32(level) {
            LogLevel::Debug => debug!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(invocation_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(invocation_id, guest_log = true, "{}", message),
        }

        let Some(callback) = ctx.log_callback() else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(level, message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(invocation_id, level, error = %e, "Log callback failed");
            }
            Err(_) => {
                error!(invocation_id, level, "Log callback panicked");
            }
        }
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// `0` is debug, `1` info, `2` warn and `3` error. Unknown values map to
/// info.
pub fn level_from_u32(level: u32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use sandcall_core::LogCallback;
    use sandcall_core::store::LogSinkError;
    use wasmtime::StoreLimitsBuilder;
    use wasmtime_wasi::WasiCtxBuilder;

    fn context(log_callback: Option<LogCallback>) -> InvocationContext {
        InvocationContext::new(
            "test-123".into(),
            WasiCtxBuilder::new().build_p1(),
            StoreLimitsBuilder::new().build(),
            log_callback,
        )
    }

    fn recording() -> (LogCallback, Arc<std::sync::Mutex<Vec<(u32, String)>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: LogCallback = Arc::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
            Ok(())
        });
        (callback, seen)
    }

    #[test]
    fn test_logging_counts_lines() {
        let mut ctx = context(None);

        LoggingHost::log(&mut ctx, 1, "Hello");
        LoggingHost::log(&mut ctx, 3, "World");

        assert_eq!(ctx.metrics.log_count, 2);
    }

    #[test]
    fn test_logging_forwards_raw_level() {
        let (callback, seen) = recording();
        let mut ctx = context(Some(callback));

        LoggingHost::log(&mut ctx, 0, "debug");
        LoggingHost::log(&mut ctx, 2, "warn");
        LoggingHost::log(&mut ctx, 42, "unknown");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (0, "debug".to_string()),
                (2, "warn".to_string()),
                (42, "unknown".to_string()),
            ]
        );
    }

    #[test]
    fn test_callback_error_is_contained() {
        let callback: LogCallback =
            Arc::new(|_, _| Err(LogSinkError::from("sink unavailable")));
        let mut ctx = context(Some(callback));

        LoggingHost::log(&mut ctx, 1, "still fine");
        assert_eq!(ctx.metrics.log_count, 1);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let callback: LogCallback = Arc::new(|_, _| panic!("sink exploded"));
        let mut ctx = context(Some(callback));

        LoggingHost::log(&mut ctx, 3, "first");
        LoggingHost::log(&mut ctx, 3, "second");
        assert_eq!(ctx.metrics.log_count, 2);
    }

    #[test]
    fn test_level_from_u32() {
        assert_eq!(level_from_u32(0), LogLevel::Debug);
        assert_eq!(level_from_u32(1), LogLevel::Info);
        assert_eq!(level_from_u32(2), LogLevel::Warn);
        assert_eq!(level_from_u32(3), LogLevel::Error);
        assert_eq!(level_from_u32(99), LogLevel::Info);
    }
}
