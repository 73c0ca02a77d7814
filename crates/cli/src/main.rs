//! Proshop CLI - Database migrations and back-office tools.
//!
//! # Usage
//!
//! ```bash
//! # Run storefront database migrations
//! proshop-cli migrate
//!
//! # Load products and variants from YAML
//! proshop-cli seed catalog.yaml
//!
//! # Move a refund through approval and payout
//! proshop-cli refund approve 12
//! proshop-cli refund process 12 --transaction-id re_123
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

use commands::refund::RefundAction;

#[derive(Parser)]
#[command(name = "proshop-cli")]
#[command(author, version, about = "Proshop CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Seed the catalog from a YAML file
    Seed {
        /// Path to the catalog YAML file
        file: String,
    },
    /// Manage refund requests
    Refund {
        #[command(subcommand)]
        action: RefundCommand,
    },
}

#[derive(Subcommand)]
enum RefundCommand {
    /// Approve a requested refund
    Approve { id: i32 },
    /// Reject a requested refund
    Reject { id: i32 },
    /// Record the payout of an approved refund
    Process {
        id: i32,

        /// Provider refund transaction ID
        #[arg(short, long)]
        transaction_id: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::storefront().await?,
        Commands::Seed { file } => commands::seed::catalog(&file).await?,
        Commands::Refund { action } => {
            let (id, action) = match action {
                RefundCommand::Approve { id } => (id, RefundAction::Approve),
                RefundCommand::Reject { id } => (id, RefundAction::Reject),
                RefundCommand::Process { id, transaction_id } => {
                    (id, RefundAction::Process { transaction_id })
                }
            };
            commands::refund::apply(id, action).await?;
        }
    }
    Ok(())
}
