//! Logging setup.
//!
//! Library code only uses `tracing` macros; the binary calls
//! [`init_logging`] once at startup.

mod logging;

pub use logging::{env_filter, init_logging, LogFormat};
