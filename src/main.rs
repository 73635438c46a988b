use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use subfleet::{default_config_path, AppState, InstancePatch, Result};

#[derive(Parser)]
#[command(name = "subfleet")]
#[command(about = "Supervise sub-instances of the host application")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SUBFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor until interrupted, autostarting flagged instances
    Serve,
    /// Create a new instance
    Create {
        id: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// List all instances
    List,
    /// Show one instance with its log
    Show { id: String },
    /// Update title, autostart flag or fixed port (0 clears it)
    Patch {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        auto_start: Option<bool>,
        #[arg(long)]
        fixed_port: Option<u16>,
    },
    /// Delete a stopped instance, its workspace and its remote link
    Delete { id: String },
    /// Print the admin password of a stopped instance
    AdminPass { id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn execute(state: &AppState, command: Command) -> Result<()> {
    let controller = &state.controller;
    match command {
        Command::Serve => Ok(()),
        Command::Create { id, title } => print_json(&controller.create(&id, title.as_deref())?),
        Command::List => print_json(&controller.list()),
        Command::Show { id } => print_json(&controller.get(&id)?),
        Command::Patch {
            id,
            title,
            auto_start,
            fixed_port,
        } => {
            let patch = InstancePatch {
                title,
                auto_start,
                fixed_port,
            };
            print_json(&controller.patch(&id, patch)?)
        }
        Command::Delete { id } => {
            controller.delete(&id)?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        Command::AdminPass { id } => {
            print_json(&serde_json::json!({ "adminPassword": controller.admin_password(&id)? }))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let state = AppState::open(&config_path)?;

    match cli.command {
        Command::Serve => subfleet::run(state).await,
        command => execute(&state, command),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    subfleet::init_logging(&cli.log_level);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            if let Ok(json) = serde_json::to_string(&e) {
                eprintln!("{json}");
            }
            ExitCode::FAILURE
        }
    }
}
