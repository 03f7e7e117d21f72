pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "dealgate",
    about = "Dealgate operator CLI",
    long_about = "Operate Dealgate migrations, demo seed data, config inspection, readiness checks, and policy simulation.",
    after_help = "Examples:\n  dealgate doctor --json\n  dealgate config\n  dealgate simulate --policy proposed.json --deals deals.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Load and verify the deterministic demo dataset covering three deal pipelines"
    )]
    Seed,
    #[command(about = "Run end-to-end readiness checks with per-check timing details")]
    Smoke,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, integration readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Preview a proposed policy against a list of what-if deals without persisting anything"
    )]
    Simulate {
        #[arg(long, value_name = "FILE", help = "JSON file holding the proposed policy")]
        policy: PathBuf,
        #[arg(long, value_name = "FILE", help = "JSON file holding the deal list to evaluate")]
        deals: PathBuf,
        #[arg(long, help = "Pretty-print the simulation report")]
        pretty: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Smoke => commands::smoke::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Simulate { policy, deals, pretty } => {
            commands::simulate::run(&policy, &deals, pretty)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
