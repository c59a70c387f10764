// Entrypoint for the CLI application.
// - Keeps `main` small: set up logging, parse flags and hand off to `cli`.
// - Returns `anyhow::Result` so failures print their full context chain.

use clap::Parser;
use ctw::cli::{self, Cli};

fn main() -> anyhow::Result<()> {
    ctw::logging::init();
    cli::execute(Cli::parse())
}
