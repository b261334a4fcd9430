//! Thin binary wiring `clap` to `pseudocode::cli` (SPEC_FULL.md §2), the
//! way `raya-cli/src/main.rs` is a thin shell over `raya_runtime::Runtime`.

use clap::Parser;
use pseudocode::cli::Cli;

fn main() {
    let cli = Cli::parse();
    std::process::exit(pseudocode::cli::run(&cli));
}
