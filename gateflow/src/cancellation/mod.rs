//! Cooperative cancellation shared by the engine, stage tasks and the runner.

mod token;

pub use token::CancellationToken;
