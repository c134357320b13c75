//! Command-line interface for gateflow.
//!
//! Provides `run` to execute a pipeline, `plan` to preview which stages a
//! given event would schedule, and `sweep` to apply artifact retention.

mod commands;

pub use commands::{
    parse_cli, render_plan, run_with_cli, Cli, Commands, PlanArgs, RunArgs, SweepArgs, TargetArgs,
    EXIT_CONFIGURATION,
};
