// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    slate_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(slate_lib::cli::exit_code_for(&e));
    }
}
