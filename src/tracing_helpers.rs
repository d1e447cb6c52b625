//! Logging macros that vanish without the `tracing` feature.
//!
//! Every level macro routes through `emit!`, which is the only place the
//! feature gate lives. Without the feature the arguments are discarded
//! unevaluated.
//!
//! ```bash
//! # Release build, no events compiled in
//! cargo build --release
//!
//! # Tests with split, convert and reclaim events
//! RUST_LOG=blinkhash=debug cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {};
}

/// Trace-level event.
macro_rules! trace_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(trace, $($arg)*)
    };
}

/// Debug-level event.
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(debug, $($arg)*)
    };
}

/// Warn-level event.
macro_rules! warn_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(warn, $($arg)*)
    };
}

/// Error-level event; used for invariant violations.
macro_rules! error_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(error, $($arg)*)
    };
}

pub(crate) use debug_log;
pub(crate) use emit;
pub(crate) use error_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
