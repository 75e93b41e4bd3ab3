use serde::{Deserialize, Serialize};

pub mod board;
pub mod cards;
pub mod landing;
pub mod messages;
pub mod player;
pub mod session;

/// Integer currency unit. Balances never go negative; shortfalls are routed
/// through debt resolution instead.
pub type Money = u32;

/// Index of a square on the board.
pub type SquareId = usize;

/// Tunable rule constants for one game. The defaults describe the standard
/// ruleset; tests and the CLI may override individual knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Cash every player starts with.
    pub starting_balance: Money,
    /// Bonus credited for passing the start square.
    pub lap_bonus: Money,
    /// Flat cost of buying out of jail.
    pub jail_fine: Money,
    /// Escape-roll attempts granted on jail entry.
    pub jail_roll_attempts: u8,
    /// Consecutive doubles that redirect the roller to jail.
    pub doubles_limit: u8,
    /// Toll multiplier applied when the owner holds the square's whole group.
    pub group_monopoly_multiplier: Money,
    /// Completed ownership groups needed to win outright.
    pub target_completed_groups: usize,
    /// Turns an alliance stays active once accepted.
    pub alliance_turns: u32,
    /// Turns a festival toll boost stays on a square.
    pub festival_boost_turns: u32,
    /// Most-recent action log entries retained for client replay.
    pub log_capacity: usize,
    /// Units of one building type that collapse into a single upgraded unit.
    pub upgrade_threshold: usize,
}

impl GameConfig {
    /// Premium charged for buying an unlocked square out from under its
    /// owner: one and a half times the purchase price.
    pub fn buyout_premium(&self, price: Money) -> Money {
        price.saturating_mul(3) / 2
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            starting_balance: 2_000,
            lap_bonus: 200,
            jail_fine: 150,
            jail_roll_attempts: 3,
            doubles_limit: 3,
            group_monopoly_multiplier: 2,
            target_completed_groups: 3,
            alliance_turns: 8,
            festival_boost_turns: 3,
            log_capacity: 64,
            upgrade_threshold: 3,
        }
    }
}
