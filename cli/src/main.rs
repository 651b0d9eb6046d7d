//! Command-line entry point for the elemental snapshot tool.

// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    elemental_utils::initialize_tracing();
    tracing::trace!("starting");
    elemental_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
