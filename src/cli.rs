use clap::{Parser, Subcommand};

/// Authoritative rules engine for the Estates property-trading board game.
#[derive(Debug, Parser)]
pub struct Cli {
    #[command(subcommand)]
    pub intent: Intent,
}

#[derive(Debug, Subcommand)]
pub enum Intent {
    /// Run a full bot-driven game, printing every room broadcast as a JSON
    /// line
    Simulate {
        /// Number of bot players seated at the table
        #[arg(short, long, default_value_t = 4)]
        players: usize,
        /// Seed for the dice and deck shuffles; random when omitted
        #[arg(short, long)]
        seed: Option<u64>,
        /// Turn count after which the game is ended early
        #[arg(short, long, default_value_t = 500)]
        max_turns: u64,
    },
    /// Print the standard board layout as JSON
    Board,
}
