pub use colored::Colorize;

use std::sync::atomic::{AtomicU8, Ordering};

/// How much the logging macros print. Each level includes
/// every level above it.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Sets the most verbose level that will be printed.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> Level {
    match MAX_LEVEL.load(Ordering::Relaxed) {
        0 => Level::Error,
        1 => Level::Warning,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

#[inline]
pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Internal macro used to deduplicate logic.
/// Please do not use this. This is an implementation
/// detail and may disappear at any time. This macro
/// is public because `macro_rules!` is limited
/// and rust-analyzer doesn't handle macros 2.0.
#[cfg(debug_assertions)]
#[doc(hidden)]
#[macro_export]
macro_rules! log {
    (($name:ident, $colour:ident, $level:ident) => $fmt:literal $(,)?) => {{
        if $crate::enabled($crate::Level::$level) {
            eprintln!(
                "{} {} {}",
                $crate::Colorize::$colour(concat!("[", stringify!($name), "]")),
                $crate::Colorize::yellow(concat!(file!(), ":", line!(), ":")),
                $fmt
            );
        }
    }};

    (($name:ident, $colour:ident, $level:ident) => $fmt:literal, $($arg:expr),* $(,)?) => {{
        if $crate::enabled($crate::Level::$level) {
            eprintln!(
                "{} {} {}",
                $crate::Colorize::$colour(concat!("[", stringify!($name), "]")),
                $crate::Colorize::yellow(concat!(file!(), ":", line!(), ":")),
                format!($fmt, $($arg),*)
            );
        }
    }};
}

#[cfg(not(debug_assertions))]
#[doc(hidden)]
#[macro_export]
macro_rules! log {
    (($name:ident, $colour:ident, $level:ident) => $fmt:literal $(,)?) => {{
        if $crate::enabled($crate::Level::$level) {
            eprintln!(
                "{} {}",
                $crate::Colorize::$colour(concat!("[", stringify!($name), "]")),
                $fmt
            );
        }
    }};

    (($name:ident, $colour:ident, $level:ident) => $fmt:literal, $($arg:expr),* $(,)?) => {{
        if $crate::enabled($crate::Level::$level) {
            eprintln!(
                "{} {}",
                $crate::Colorize::$colour(concat!("[", stringify!($name), "]")),
                format!($fmt, $($arg),*)
            );
        }
    }};
}

/// For verbose output tracking every stack operation.
#[macro_export]
macro_rules! trace {
    ($($input:tt)*) => {
        $crate::log!((trace, purple, Trace) => $($input)*)
    };
}

/// For additional information that might be helpful for debugging.
#[macro_export]
macro_rules! debug {
    ($($input:tt)*) => {
        $crate::log!((debug, cyan, Debug) => $($input)*)
    };
}

/// Information that may be useful to the user.
#[macro_export]
macro_rules! info {
    ($($input:tt)*) => {
        $crate::log!((info, blue, Info) => $($input)*)
    };
}

/// An alert that something may have gone wrong.
#[macro_export]
macro_rules! warning {
    ($($input:tt)*) => {
        $crate::log!((warning, bright_yellow, Warning) => $($input)*)
    };
}

/// An alert that something has gone horribly wrong.
#[macro_export]
macro_rules! error {
    ($($input:tt)*) => {
        $crate::log!((error, bright_red, Error) => $($input)*)
    };
}
