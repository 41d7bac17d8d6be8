pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "leadroute",
    about = "Leadroute operator CLI",
    long_about = "Operate the lead routing store: migrations, demo rules, config inspection, \
                  readiness checks, and the lead event queue.",
    after_help = "Examples:\n  leadroute doctor --json\n  leadroute enqueue '{\"leadId\":\"L-1\",\"funnelId\":\"roofing\",\"zipCode\":\"90001\"}'\n  leadroute drain\n  leadroute dead-letters --limit 20"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo rule set (idempotent)")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity, and queue readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Put a raw lead-created payload on the lead event queue")]
    Enqueue {
        #[arg(help = "Lead created event JSON")]
        payload: String,
    },
    #[command(about = "Route queued lead events until nothing is claimable")]
    Drain,
    #[command(about = "List dead-lettered lead events")]
    DeadLetters {
        #[arg(long, default_value_t = 50, help = "Maximum number of events to list")]
        limit: u32,
    },
    #[command(about = "Return a dead-lettered lead event to the queue with a fresh attempt budget")]
    Requeue {
        #[arg(help = "Lead event id as shown by `dead-letters`")]
        event_id: String,
    },
    #[command(about = "Purge expired cap counters and unassigned entries once")]
    Sweep,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Enqueue { payload } => commands::enqueue::run(&payload),
        Command::Drain => commands::drain::run(),
        Command::DeadLetters { limit } => commands::dead_letters::run(limit),
        Command::Requeue { event_id } => commands::requeue::run(&event_id),
        Command::Sweep => commands::sweep::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
