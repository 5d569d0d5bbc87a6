#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use std::env;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    match cmd.as_str() {
        "selfcheck" => {
            let report = rime_harness::selfcheck()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                bail!("selfcheck failed");
            }
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {cmd}")
        }
    }
}

fn print_usage() {
    println!("rime-harness");
    println!();
    println!("USAGE:");
    println!("  rime-harness selfcheck    run the in-memory splice scenario");
}
