//! gateflow CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use gateflow::observability::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = gateflow::cli::parse_cli();

    // RUST_LOG wins over --log-level
    init_logging(cli.log_format, &cli.log_level)?;

    let code = gateflow::cli::run_with_cli(cli).await?;
    std::process::exit(code);
}
