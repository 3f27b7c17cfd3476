use clap::{Parser, Subcommand};
use metered_ledger::config::Config;
use metered_ledger::error::{Error, Result};
use metered_ledger::ledger::{ChargeFilter, Ledger, TickInput};
use metered_ledger::logger;
use metered_ledger::payout::MockPayoutExecutor;
use metered_ledger::quote::PriceQuote;
use metered_ledger::state::RailRef;
use metered_ledger::storage::FileStore;
use metered_ledger::Amount;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "metered-ledger")]
#[command(about = "Metered Ledger CLI - Pay-per-use reservations, metering and settlement")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: "human" or "json"
    #[arg(short, long)]
    pub format: Option<String>,

    /// Data directory path
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory
    Init,

    /// Grant additional allowance to an account
    Approve {
        account: String,
        amount: f64,

        /// Rail transaction that granted the allowance
        #[arg(long)]
        tx_ref: Option<String>,

        #[arg(long)]
        chain_id: Option<u64>,
    },

    /// Record an on-rail deposit (informational)
    Deposit {
        account: String,
        amount: f64,

        /// Rail transaction that moved the funds
        #[arg(long)]
        tx_ref: Option<String>,

        #[arg(long)]
        chain_id: Option<u64>,
    },

    /// Open a reservation from a price quote
    Open {
        #[arg(long)]
        account: String,

        #[arg(long)]
        content: String,

        #[arg(long)]
        payee: String,

        /// Quote JSON (or read from --file / stdin if not provided)
        #[arg(short, long)]
        quote: Option<String>,

        /// Quote file path
        #[arg(long)]
        file: Option<String>,
    },

    /// Record one activity tick
    Tick {
        reservation: String,

        #[arg(long, default_value_t = 5_000)]
        tick_ms: u64,

        #[arg(long)]
        focus: bool,

        #[arg(long, default_value_t = 1.0)]
        visibility: f64,

        #[arg(long, default_value_t = 0.0)]
        scroll: f64,
    },

    /// Close a reservation into a charge or refund
    Finalize {
        reservation: String,
    },

    /// Show an account summary
    Account {
        account: String,
    },

    /// Show ledger-wide totals
    Totals,

    /// List finalized charges
    Charges {
        /// all, valid or unsettled
        #[arg(long, default_value = "all")]
        filter: ChargeFilter,
    },

    /// Create or reuse the draft settlement batch
    Aggregate,

    /// Pay out a draft batch with the mock executor
    Distribute {
        batch: String,

        /// JSON file mapping payee id to payout address
        #[arg(long)]
        payees: String,
    },

    /// Expire reservations whose TTL has passed
    Sweep,

    /// Check the ledger's money invariants
    Audit,
}

/// Read a document from file or stdin
fn read_input(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| Error::InvalidQuote(format!("Failed to read file {}: {}", path, e))),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| Error::InvalidQuote(format!("Failed to read from stdin: {}", e)))?;
            Ok(buffer)
        }
    }
}

fn parse_quote(json: &str) -> Result<PriceQuote> {
    serde_json::from_str(json)
        .map_err(|e| Error::InvalidQuote(format!("Failed to parse quote JSON: {}", e)))
}

fn parse_amount(value: f64) -> Result<Amount> {
    Amount::from_f64(value)
        .ok_or_else(|| Error::InvalidAmount(format!("{} is not a valid amount", value)))
}

fn load_payees(path: &str) -> Result<HashMap<String, String>> {
    let json = fs::read_to_string(path)
        .map_err(|e| Error::StorageError(format!("Failed to read payee file {}: {}", path, e)))?;
    serde_json::from_str(&json)
        .map_err(|e| Error::StorageError(format!("Failed to parse payee file {}: {}", path, e)))
}

/// Format output based on format type
fn format_output<T: serde::Serialize + std::fmt::Debug>(data: &T, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(data)
            .map_err(|e| Error::StorageError(format!("Failed to serialize JSON: {}", e))),
        _ => Ok(format!("{:#?}", data)),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.set_data_dir(PathBuf::from(dir));
    }
    if let Some(format) = cli.format {
        config.set_output_format(format);
    }
    logger::init(config.get_log_level());

    if let Commands::Init = cli.command {
        fs::create_dir_all(config.get_data_dir())
            .map_err(|e| Error::StorageError(format!("Failed to create data directory: {}", e)))?;
        FileStore::open(&config)?;
        println!(
            "Initialized data directory at: {}",
            config.get_data_dir().display()
        );
        return Ok(());
    }

    let store = FileStore::open(&config)?;
    let ledger = Ledger::new(store).with_policy(config.policy.clone());
    let format = config.get_output_format().to_string();

    match cli.command {
        Commands::Init => Ok(()),

        Commands::Approve {
            account,
            amount,
            tx_ref,
            chain_id,
        } => {
            let rail = RailRef { tx_ref, chain_id };
            let account =
                ledger.approve_allowance_with_ref(&account, parse_amount(amount)?, rail)?;
            println!("✓ Allowance approved");
            println!("{}", format_output(&account, &format)?);
            Ok(())
        }

        Commands::Deposit {
            account,
            amount,
            tx_ref,
            chain_id,
        } => {
            let rail = RailRef { tx_ref, chain_id };
            let account = ledger.record_deposit_with_ref(&account, parse_amount(amount)?, rail)?;
            println!("✓ Deposit recorded");
            println!("{}", format_output(&account, &format)?);
            Ok(())
        }

        Commands::Open {
            account,
            content,
            payee,
            quote,
            file,
        } => {
            let quote_json = match quote {
                Some(json) => json,
                None => read_input(file.as_deref())?,
            };
            let quote = parse_quote(&quote_json)?;
            let opened = ledger.open(&account, &content, &payee, &quote)?;
            println!("{}", format_output(&opened, &format)?);
            Ok(())
        }

        Commands::Tick {
            reservation,
            tick_ms,
            focus,
            visibility,
            scroll,
        } => {
            let outcome = ledger.record_tick(
                &reservation,
                TickInput {
                    tick_ms,
                    focus,
                    visibility,
                    scroll,
                },
            )?;
            println!("{}", format_output(&outcome, &format)?);
            Ok(())
        }

        Commands::Finalize { reservation } => {
            let outcome = ledger.finalize(&reservation)?;
            println!("{}", format_output(&outcome, &format)?);
            Ok(())
        }

        Commands::Account { account } => {
            let summary = ledger.account_summary(&account)?;
            println!("{}", format_output(&summary, &format)?);
            Ok(())
        }

        Commands::Totals => {
            let totals = ledger.ledger_totals()?;
            println!("{}", format_output(&totals, &format)?);
            Ok(())
        }

        Commands::Charges { filter } => {
            let charges = ledger.list_charges(filter)?;
            println!("{}", format_output(&charges, &format)?);
            Ok(())
        }

        Commands::Aggregate => match ledger.aggregate_draft()? {
            Some(batch) => {
                println!("{}", format_output(&batch, &format)?);
                Ok(())
            }
            None => {
                println!("Nothing to settle");
                Ok(())
            }
        },

        Commands::Distribute { batch, payees } => {
            let directory = load_payees(&payees)?;
            let receipt = ledger.distribute(&batch, &directory, &MockPayoutExecutor::new())?;
            println!("✓ Batch distributed");
            println!("{}", format_output(&receipt, &format)?);
            Ok(())
        }

        Commands::Sweep => {
            let swept = ledger.sweep_expired()?;
            println!("{}", format_output(&swept, &format)?);
            Ok(())
        }

        Commands::Audit => {
            let report = ledger.audit()?;
            println!("{}", format_output(&report, &format)?);
            if report.is_clean() {
                Ok(())
            } else {
                Err(Error::StorageError(format!(
                    "Audit found {} problem(s)",
                    report.findings.len()
                )))
            }
        }
    }
}
