//! Process-fatal failure handling
//!
//! Illegal state transitions and failures on commit paths leave invariants
//! broken; continuing would corrupt the session. These paths log and abort
//! the process instead of propagating an error.

/// Log an error and abort the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort();
    }};
}
