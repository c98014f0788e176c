// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Logging macros shared by the sequence compiler crates.
//!
//! All records are emitted through the `log` facade with a target of the form
//! `sequence.rust::<module path>`, so a host application can route compiler
//! output independently of its own logging.

use std::sync::{atomic::AtomicBool, atomic::Ordering};

#[doc(hidden)]
pub use log as _log;

/// Emit a record at `$level` with the target of the calling module.
#[doc(hidden)]
#[macro_export]
macro_rules! record {
    ($level:ident, $($arg:tt)+) => {
        sequence_log::_log::$level!(
            target: concat!("sequence.rust::", module_path!()),
            $($arg)+
        )
    };
}

#[macro_export]
macro_rules! info {
    ($msg:literal $($rest:tt)*) => {
        sequence_log::record!(info, $msg $($rest)*);
    };
}

#[macro_export]
macro_rules! warn {
    ($msg:literal $($rest:tt)*) => {
        sequence_log::record!(warn, $msg $($rest)*);
    };
}

/// Log a diagnostic message at debug level if diagnostics logging is enabled.
#[macro_export]
macro_rules! diagnostic {
    ($msg:literal $($rest:tt)*) => {
        if sequence_log::is_diagnostics_enabled() {
            sequence_log::record!(debug, $msg $($rest)*);
        }
    };
}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::Acquire)
}

/// Initialize the logging.
///
/// Only the diagnostics flag is owned by this crate. Installing a concrete
/// logger is left to the host application.
pub fn init_logging(with_diagnostics: bool) {
    DIAGNOSTICS_ENABLED.store(with_diagnostics, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_flag() {
        init_logging(true);
        assert!(is_diagnostics_enabled());
        init_logging(false);
        assert!(!is_diagnostics_enabled());
    }
}
