//! Conformance harness CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use weft_harness::{run_all, run_scenario, HarnessError, Outcome, RunReport, SCENARIOS};

#[derive(Parser)]
#[command(name = "harness", about = "Conformance scenarios for the weft thread runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered scenarios.
    List,
    /// Run scenarios and print a report.
    Run {
        /// Run a single scenario instead of all of them.
        #[arg(long)]
        scenario: Option<String>,
        /// Write the JSON report to this path.
        #[arg(long)]
        json: Option<PathBuf>,
        /// Use the original (slow) problem sizes.
        #[arg(long)]
        full: bool,
    },
}

fn run(command: Command) -> Result<bool, HarnessError> {
    match command {
        Command::List => {
            for scenario in SCENARIOS {
                println!("{:28} {}", scenario.name, scenario.about);
            }
            Ok(true)
        }
        Command::Run {
            scenario,
            json,
            full,
        } => {
            let report = match scenario {
                Some(name) => RunReport::new(vec![run_scenario(&name, full)?]),
                None => run_all(full),
            };
            for s in &report.scenarios {
                let mark = match s.outcome {
                    Outcome::Pass => "PASS",
                    Outcome::Fail => "FAIL",
                };
                println!("{mark} {:28} {:6}ms  {}", s.name, s.millis, s.detail);
            }
            println!("digest sha256:{}", report.digest()?);
            if let Some(path) = json {
                std::fs::write(&path, report.to_json()?)?;
                println!("report written to {}", path.display());
            }
            Ok(report.passed())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("harness: {err}");
            ExitCode::FAILURE
        }
    }
}
