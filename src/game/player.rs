use serde::{Deserialize, Serialize};

use super::board::{Board, Group};
use super::cards::CharacterCard;
use super::{GameConfig, Money, SquareId};

/// Per-participant mutable ledger. Created on room join; mutated only
/// through the turn state machine; flagged bankrupt (never removed from the
/// roster vector) when eliminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerAccount {
    pub name: Box<str>,
    pub balance: Money,
    pub position: SquareId,
    pub owned: Vec<SquareId>,
    pub jailed: bool,
    pub jail_attempts_left: u8,
    pub doubles_streak: u8,
    /// Held get-out-of-jail tokens.
    pub jail_passes: u8,
    /// At most one held character card.
    pub character: Option<CharacterCard>,
    /// Active alliance partner, if any.
    pub ally: Option<Box<str>>,
    /// Derived: recomputed on every acquisition or loss.
    pub completed_groups: Vec<Group>,
    pub bankrupt: bool,
    /// One-shot flag: the next lap bonus is doubled.
    pub double_lap_bonus: bool,
    /// One-shot flag: the next toll owed is waived.
    pub toll_waiver: bool,
    /// One-shot flag: an extra roll is granted on the next roll.
    pub bonus_roll: bool,
}

impl PlayerAccount {
    pub fn new(name: Box<str>, config: &GameConfig) -> Self {
        Self {
            name,
            balance: config.starting_balance,
            position: Board::START,
            owned: Vec::new(),
            jailed: false,
            jail_attempts_left: 0,
            doubles_streak: 0,
            jail_passes: 0,
            character: None,
            ally: None,
            completed_groups: Vec::new(),
            bankrupt: false,
            double_lap_bonus: false,
            toll_waiver: false,
            bonus_roll: false,
        }
    }

    pub fn can_afford(&self, amount: Money) -> bool {
        self.balance >= amount
    }

    pub fn credit(&mut self, amount: Money) {
        self.balance = self.balance.saturating_add(amount);
    }

    /// Deducts `amount` if covered. The caller routes shortfalls through
    /// debt resolution; a false return must never be ignored.
    #[must_use]
    pub fn try_debit(&mut self, amount: Money) -> bool {
        match self.balance.checked_sub(amount) {
            Some(rest) => {
                self.balance = rest;
                true
            }
            None => false,
        }
    }

    pub fn owns(&self, square: SquareId) -> bool {
        self.owned.contains(&square)
    }

    pub fn grant_ownership(&mut self, square: SquareId, board: &Board) {
        if !self.owned.contains(&square) {
            self.owned.push(square);
        }
        self.recompute_completed_groups(board);
    }

    pub fn revoke_ownership(&mut self, square: SquareId, board: &Board) {
        self.owned.retain(|&id| id != square);
        self.recompute_completed_groups(board);
    }

    pub fn recompute_completed_groups(&mut self, board: &Board) {
        self.completed_groups = board.completed_groups(&self.name);
    }

    pub fn enter_jail(&mut self, jail_index: SquareId, config: &GameConfig) {
        self.position = jail_index;
        self.jailed = true;
        self.jail_attempts_left = config.jail_roll_attempts;
        self.doubles_streak = 0;
    }

    pub fn leave_jail(&mut self) {
        self.jailed = false;
        self.jail_attempts_left = 0;
    }

    pub fn take_character(&mut self) -> Option<CharacterCard> {
        self.character.take()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn account() -> PlayerAccount {
        PlayerAccount::new("ada".into(), &GameConfig::default())
    }

    #[test]
    fn starts_at_start_with_configured_balance() {
        let config = GameConfig::default();
        let player = account();
        assert_eq!(player.position, Board::START);
        assert_eq!(player.balance, config.starting_balance);
        assert!(!player.jailed && !player.bankrupt);
    }

    #[test]
    fn debit_refuses_overdraft() {
        let mut player = account();
        assert!(player.try_debit(player.balance));
        assert!(!player.try_debit(1));
        assert_eq!(player.balance, 0);
    }

    #[test]
    fn jail_entry_resets_streak_and_attempts() {
        let config = GameConfig::default();
        let mut player = account();
        player.doubles_streak = 2;
        player.enter_jail(8, &config);
        assert!(player.jailed);
        assert_eq!(player.position, 8);
        assert_eq!(player.jail_attempts_left, config.jail_roll_attempts);
        assert_eq!(player.doubles_streak, 0);
    }

    #[test]
    fn ownership_recomputes_groups() {
        let mut board = Board::standard();
        let mut player = account();
        board.assign_owner(6, "ada");
        board.assign_owner(7, "ada");
        player.grant_ownership(6, &board);
        player.grant_ownership(7, &board);
        assert_eq!(player.completed_groups, vec![Group::Market]);
        board.reset_square(7);
        player.revoke_ownership(7, &board);
        assert!(player.completed_groups.is_empty());
    }
}
