pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stockpilot",
    about = "StockPilot operator CLI",
    long_about = "Prepare the stock database, inspect configuration and the tool catalog, and ask the assistant one-off questions.",
    after_help = "Examples:\n  stockpilot migrate\n  stockpilot seed\n  stockpilot search 银行\n  stockpilot ask \"浦发银行的市盈率是多少？\"\n  stockpilot doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo stock dataset (idempotent)")]
    Seed,
    #[command(about = "Summarise the stock tables: row counts and the latest trade date")]
    Stats,
    #[command(about = "Find stocks whose code or name contains a keyword (first 20)")]
    Search {
        #[arg(help = "Code or name fragment")]
        keyword: String,
    },
    #[command(about = "Print the tool catalog advertised to the model")]
    Tools,
    #[command(about = "Run one conversation through the configured provider")]
    Ask {
        #[arg(help = "Question for the assistant")]
        question: String,
        #[arg(long, help = "Optional system prompt prepended to the conversation")]
        system: Option<String>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM adapter setup, and database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Stats => commands::stats::run(),
        Command::Search { keyword } => commands::search::run(&keyword),
        Command::Tools => commands::tools::run(),
        Command::Ask { question, system } => commands::ask::run(&question, system.as_deref()),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
