//! Data source registry tool.
//!
//! Lists, edits and tests the connection definitions of a project.
//!
//! # Security Guarantees
//! - Passwords are read from the terminal or the environment, never echoed
//! - Connection URLs are redacted in logs
//! - Saved passwords go to the vault or the credentials file, never to the
//!   plain configuration

use clap::Parser;
use dsregistry::{Cli, run};
use dsregistry_core::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose, cli.global.quiet)?;

    let mut stdout = std::io::stdout().lock();
    run(&cli, &mut stdout).await
}
