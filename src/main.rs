mod cli;

use clap::Parser;
use cli::Cli;
use metered_ledger::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            // Operator-visible settlement failures get their own status for scripts
            match e {
                Error::SettlementConsistencyViolation { .. } => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
