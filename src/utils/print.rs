//! Helper macros for logging (console printing).

use std::sync::OnceLock;

use env_logger::Env;

/// Global variable holding the process identity string used as logging
/// prefix, e.g. "acsd" for the daemon or "client" for proxy tools.
pub static LOG_NAME: OnceLock<String> = OnceLock::new();

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// ad_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ad_trace {
    ($($fmt_args:tt)*) => {
        log::trace!(
            "({}) {}",
            $crate::LOG_NAME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// ad_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ad_debug {
    ($($fmt_args:tt)*) => {
        log::debug!(
            "({}) {}",
            $crate::LOG_NAME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// ad_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ad_info {
    ($($fmt_args:tt)*) => {
        log::info!(
            "({}) {}",
            $crate::LOG_NAME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// ad_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ad_warn {
    ($($fmt_args:tt)*) => {
        log::warn!(
            "({}) {}",
            $crate::LOG_NAME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// ad_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ad_error {
    ($($fmt_args:tt)*) => {
        log::error!(
            "({}) {}",
            $crate::LOG_NAME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return an `AcsError` containing
/// the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            ad_error!($($fmt_args)*);
            Err($crate::AcsError::msg(format!($($fmt_args)*)))
        }
    };
}
