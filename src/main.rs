//! walwarden CLI entry point
//!
//! Parsing, configuration, dispatch and error reporting all live in
//! `cli::run`; the only thing done here is turning its result into the
//! process exit code.

use walwarden::cli;

fn main() {
    std::process::exit(cli::run());
}
