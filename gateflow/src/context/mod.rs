//! Run context: what triggered the run and which secrets it may use.

mod run;
mod secrets;

pub use run::{EventKind, RunContext};
pub use secrets::{Redactor, SecretSet, REDACTED};
