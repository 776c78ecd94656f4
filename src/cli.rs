use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use uuid::Uuid;

/// plan-proxy: Anthropic Messages proxy with Bedrock fallback
#[derive(Parser)]
#[command(name = "plan-proxy", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Serve {
        /// Port to bind; defaults to PROXY_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations
    Migrate,

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage access keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a new user
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Monthly Bedrock budget in USD
        #[arg(long)]
        budget: Option<Decimal>,
    },
    /// List users
    List {
        #[arg(long, default_value = "100")]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Issue an access key; the raw key is printed once
    Issue {
        #[arg(long)]
        user_id: Uuid,
        #[arg(long)]
        bedrock_region: Option<String>,
        #[arg(long)]
        bedrock_model: Option<String>,
    },
    /// Revoke an access key
    Revoke {
        #[arg(long)]
        key_id: Uuid,
    },
}
