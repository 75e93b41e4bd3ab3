use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::board::{Board, BuildResult, BuildingKind};
use super::cards::{
    ActivationWindow, CharacterCard, CharacterEffect, Deck, DeckKind, EventEffect,
};
use super::landing::{self, LandingOutcome};
use super::messages::*;
use super::player::PlayerAccount;
use super::{GameConfig, Money, SquareId};

/// Hard cap on the roster size of one room.
pub const MAX_PLAYERS: usize = 8;

/// One active alliance between two players.
#[derive(Debug, Clone)]
struct Alliance {
    a: Box<str>,
    b: Box<str>,
    remaining_turns: u32,
}

/// The per-room rules engine and turn sequencer. Exactly one intent is
/// accepted and fully resolved (including nested card effects and landing
/// recursion) before the next; every returned batch of emissions describes
/// a fully settled step.
#[derive(Debug)]
pub struct GameSession {
    config: GameConfig,
    board: Board,
    chance: Deck,
    fate: Deck,
    players: Vec<PlayerAccount>,
    current: usize,
    phase: Phase,
    dice: Option<(u8, u8)>,
    /// The current player has rolled at least once this turn.
    rolled: bool,
    /// An extra roll (double or character bonus) is waiting to be taken.
    extra_roll: bool,
    turn: u64,
    pending: Option<PendingDecision>,
    debt: Option<DebtState>,
    alliances: Vec<Alliance>,
    log: VecDeque<LogEntry>,
    rng: ChaCha8Rng,
    started: bool,
    ended: Option<GameEndReason>,
    /// Emission batch under construction for the intent being handled.
    events: Vec<RoomBroadcast>,
}

impl GameSession {
    pub fn new(config: GameConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let chance = Deck::chance(&mut rng);
        let fate = Deck::fate(&mut rng);
        Self {
            config,
            board: Board::standard(),
            chance,
            fate,
            players: Vec::new(),
            current: 0,
            phase: Phase::Initializing,
            dice: None,
            rolled: false,
            extra_roll: false,
            turn: 0,
            pending: None,
            debt: None,
            alliances: Vec::new(),
            log: VecDeque::new(),
            rng,
            started: false,
            ended: None,
            events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> Option<&GameEndReason> {
        self.ended.as_ref()
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn players(&self) -> &[PlayerAccount] {
        &self.players
    }

    pub fn current_player(&self) -> &str {
        self.players
            .get(self.current)
            .map(|p| &*p.name)
            .unwrap_or("")
    }

    /// The single queryable "is a decision pending" slot.
    pub fn pending(&self) -> Option<&PendingDecision> {
        self.pending.as_ref()
    }

    pub fn debt(&self) -> Option<&DebtState> {
        self.debt.as_ref()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            turn: self.turn,
            phase: self.phase,
            current_player: self.current_player().into(),
            dice: self.dice,
            squares: self.board.squares().to_vec(),
            players: self.players.clone(),
            pending: self.pending.clone(),
            debt: self.debt.clone(),
            log: self.log.iter().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Adds a player to the roster. Only valid before the game starts.
    pub fn add_player(&mut self, name: &str) -> Result<(), IntentError> {
        if self.started {
            return Err(IntentError::GameAlreadyStarted);
        }
        if self.players.len() >= MAX_PLAYERS {
            return Err(IntentError::RoomFull);
        }
        if self.players.iter().any(|p| &*p.name == name) {
            return Err(IntentError::NameTaken);
        }
        self.players
            .push(PlayerAccount::new(name.into(), &self.config));
        Ok(())
    }

    /// Starts the game: deals one character card per player, opens turn 1,
    /// and prompts the first roll.
    pub fn start(&mut self) -> Result<Vec<RoomBroadcast>, IntentError> {
        if self.started {
            return Err(IntentError::GameAlreadyStarted);
        }
        if self.players.len() < 2 {
            return Err(IntentError::NotEnoughPlayers);
        }

        self.started = true;
        self.turn = 1;
        self.current = 0;
        self.phase = Phase::WaitingForRoll;
        self.deal_characters();
        self.push_log("the game begins".into());
        self.prompt(self.current_player().into(), ActionPrompt::Roll);
        self.emit_snapshot();
        Ok(std::mem::take(&mut self.events))
    }

    /// Restores accounts, board and decks to initial values without
    /// discarding the roster, for a rematch.
    pub fn reset(&mut self) -> Vec<RoomBroadcast> {
        let names: Vec<Box<str>> = self.players.iter().map(|p| p.name.clone()).collect();
        self.board = Board::standard();
        self.chance = Deck::chance(&mut self.rng);
        self.fate = Deck::fate(&mut self.rng);
        self.players = names
            .into_iter()
            .map(|name| PlayerAccount::new(name, &self.config))
            .collect();
        self.current = 0;
        self.dice = None;
        self.rolled = false;
        self.extra_roll = false;
        self.pending = None;
        self.debt = None;
        self.alliances.clear();
        self.log.clear();
        self.ended = None;

        if self.started {
            self.turn = 1;
            self.phase = Phase::WaitingForRoll;
            self.deal_characters();
            self.push_log("rematch: the game begins".into());
            self.prompt(self.current_player().into(), ActionPrompt::Roll);
            self.emit_snapshot();
        } else {
            self.turn = 0;
            self.phase = Phase::Initializing;
        }
        std::mem::take(&mut self.events)
    }

    /// Forcibly ends a running game with no winner.
    pub fn end_early(&mut self) -> Result<Vec<RoomBroadcast>, IntentError> {
        if !self.started {
            return Err(IntentError::NotStarted);
        }
        if self.phase == Phase::GameOver {
            return Err(IntentError::WrongPhase);
        }
        self.end_game(None, GameEndReason::EndedEarly);
        self.emit_snapshot();
        Ok(std::mem::take(&mut self.events))
    }

    /// Removes a player. Before the start this shrinks the roster; during
    /// play it is a forfeit, liquidating all assets back to the bank.
    pub fn remove_player(&mut self, name: &str) -> Vec<RoomBroadcast> {
        let Some(idx) = self.find_player(name) else {
            return Vec::new();
        };

        if !self.started {
            self.players.remove(idx);
            if self.current >= self.players.len() {
                self.current = 0;
            }
            self.emit(RoomBroadcast::Left {
                player: name.into(),
            });
            return std::mem::take(&mut self.events);
        }

        // After the game is over there is nothing to liquidate.
        if self.ended.is_some() {
            self.emit(RoomBroadcast::Left {
                player: name.into(),
            });
            return std::mem::take(&mut self.events);
        }

        // Forfeit during play.
        let was_current = idx == self.current;
        let leaver_in_pending = self.pending.as_ref().map_or(false, |p| {
            &*p.player == name
                || matches!(&p.kind, DecisionKind::Alliance { proposer } if &**proposer == name)
        });
        if leaver_in_pending {
            self.pending = None;
            // Only an alliance offer can be pending on a non-current
            // player; hand the turn back to the proposer.
            if !was_current {
                self.restore_turn_phase();
            }
        }
        if self.debt.as_ref().map_or(false, |d| &*d.debtor == name) {
            self.debt = None;
        }
        if !self.players[idx].bankrupt {
            self.push_log(format!("{name} forfeits").into());
            self.liquidate_to(idx, Creditor::Bank);
        }
        self.emit(RoomBroadcast::Left {
            player: name.into(),
        });
        if self.ended.is_none() {
            self.win_check();
        }
        if self.ended.is_none() && was_current {
            self.advance_turn();
        }
        self.emit_snapshot();
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Intent entry point

    /// Validates and fully resolves one intent, returning the emissions of
    /// the settled step. Rejections leave the session untouched.
    pub fn handle(
        &mut self,
        player: &str,
        intent: PlayerIntent,
    ) -> Result<Vec<RoomBroadcast>, IntentError> {
        if !self.started {
            return Err(IntentError::NotStarted);
        }
        if self.phase == Phase::GameOver {
            return Err(IntentError::WrongPhase);
        }
        let idx = self
            .find_player(player)
            .ok_or_else(|| IntentError::UnknownPlayer {
                player: player.into(),
            })?;
        if self.players[idx].bankrupt {
            return Err(IntentError::OutOfTurn);
        }

        tracing::debug!(player, ?intent, phase = ?self.phase, "handling intent");

        match intent {
            PlayerIntent::RollDice => self.roll_dice(idx)?,
            PlayerIntent::PurchaseDecision { square, accept } => {
                self.purchase_decision(idx, square, accept)?
            }
            PlayerIntent::BuildDecision { square, building } => {
                self.build_decision(idx, square, building)?
            }
            PlayerIntent::JailDecision { method } => self.jail_decision(idx, method)?,
            PlayerIntent::EndTurn => self.end_turn(idx)?,
            PlayerIntent::UseCharacterCard => self.use_character_card(idx)?,
            PlayerIntent::ProposeAlliance { target } => self.propose_alliance(idx, &target)?,
            PlayerIntent::AllianceResponse { proposer, accept } => {
                self.alliance_response(idx, &proposer, accept)?
            }
            PlayerIntent::SpecialMoveChoice { destination } => {
                self.special_move_choice(idx, destination)?
            }
            PlayerIntent::FestivalChoice { square } => self.festival_choice(idx, square)?,
            PlayerIntent::DebtResolutionAction {
                method,
                square,
                building,
            } => self.debt_resolution_action(idx, method, square, building)?,
        }

        self.emit_snapshot();
        Ok(std::mem::take(&mut self.events))
    }

    // ------------------------------------------------------------------
    // Rolling and movement

    fn roll_dice(&mut self, idx: usize) -> Result<(), IntentError> {
        self.ensure_current(idx)?;
        self.ensure_unblocked()?;
        if self.phase != Phase::WaitingForRoll {
            return Err(IntentError::WrongPhase);
        }

        let d1 = self.rng.gen_range(1..=6);
        let d2 = self.rng.gen_range(1..=6);
        self.apply_roll(idx, d1, d2);
        Ok(())
    }

    /// Resolves one validated roll: doubles bookkeeping, movement, and the
    /// landing action.
    fn apply_roll(&mut self, idx: usize, d1: u8, d2: u8) {
        let is_double = d1 == d2;
        self.dice = Some((d1, d2));
        self.rolled = true;
        self.extra_roll = false;
        self.emit(RoomBroadcast::DiceRolled {
            player: self.players[idx].name.clone(),
            values: [d1, d2],
            total: d1 + d2,
            is_double,
        });

        if self.players[idx].bonus_roll {
            self.players[idx].bonus_roll = false;
            self.extra_roll = true;
        }

        if is_double {
            self.players[idx].doubles_streak += 1;
            if self.players[idx].doubles_streak >= self.config.doubles_limit {
                // Third straight double: straight to jail, no landing action.
                let name = self.players[idx].name.clone();
                self.push_log(format!("{name} rolled three straight doubles").into());
                self.send_to_jail(idx);
                self.extra_roll = false;
                self.phase = Phase::TurnEnding;
                return;
            }
            self.extra_roll = true;
        } else {
            self.players[idx].doubles_streak = 0;
        }

        self.travel(idx, (d1 + d2) as usize);
    }

    /// Moves the token forward by `steps`, crediting the lap bonus on wrap,
    /// then resolves the landing.
    fn travel(&mut self, idx: usize, steps: usize) {
        let (to, wrapped) = self.board.advance(self.players[idx].position, steps);
        self.players[idx].position = to;
        if wrapped {
            self.pay_lap_bonus(idx);
        }
        self.emit(RoomBroadcast::PlayerMoved {
            player: self.players[idx].name.clone(),
            square: to,
            passed_start: wrapped,
        });
        self.resolve_landing(idx, to);
    }

    fn pay_lap_bonus(&mut self, idx: usize) {
        let mut bonus = self.config.lap_bonus;
        if self.players[idx].double_lap_bonus {
            self.players[idx].double_lap_bonus = false;
            bonus *= 2;
        }
        self.players[idx].credit(bonus);
        let name = self.players[idx].name.clone();
        self.push_log(format!("{name} passes Start and collects {bonus}").into());
    }

    fn resolve_landing(&mut self, idx: usize, square: SquareId) {
        let actor = self.players[idx].name.clone();
        let outcome = landing::resolve(&self.board, &self.players, &self.config, &actor, square);
        self.apply_outcome(idx, square, outcome);
    }

    fn apply_outcome(&mut self, idx: usize, square: SquareId, outcome: LandingOutcome) {
        let name = self.players[idx].name.clone();
        match outcome {
            LandingOutcome::Nothing => {
                let title = self.square_name(square);
                self.push_log(format!("{name} rests at {title}").into());
                self.notice(name, format!("nothing to settle at {title}").into());
                self.finish_action(idx);
            }
            LandingOutcome::OfferPurchase { square, price } => {
                self.open_decision(
                    name.clone(),
                    DecisionKind::Purchase { square, price },
                    ActionPrompt::Purchase { square, price },
                );
            }
            LandingOutcome::OfferBuild { square } => {
                let options = self.build_options(square);
                self.open_decision(
                    name.clone(),
                    DecisionKind::Build { square },
                    ActionPrompt::Build { square, options },
                );
            }
            LandingOutcome::TollDue {
                square,
                owner,
                amount,
                buyout,
            } => {
                if self.players[idx].toll_waiver {
                    self.players[idx].toll_waiver = false;
                    self.push_log(format!("{name}'s toll waiver absorbs {amount}").into());
                    self.notice(name, format!("your toll waiver absorbed {amount}").into());
                    self.finish_action(idx);
                    return;
                }
                match buyout {
                    Some(premium) => {
                        self.open_decision(
                            name.clone(),
                            DecisionKind::Toll {
                                square,
                                owner,
                                amount,
                                buyout: premium,
                            },
                            ActionPrompt::Toll {
                                square,
                                amount,
                                buyout: Some(premium),
                            },
                        );
                    }
                    None => {
                        self.charge(idx, Creditor::Player { name: owner }, amount);
                    }
                }
            }
            LandingOutcome::TaxDue { amount } => {
                self.charge(idx, Creditor::Bank, amount);
            }
            LandingOutcome::Draw { deck } => {
                let card = match deck {
                    DeckKind::Chance => self.chance.draw(),
                    DeckKind::Fate => self.fate.draw(),
                };
                self.push_log(format!("{name} draws from {deck}: {}", card.text).into());
                self.apply_event(idx, card.effect);
            }
            LandingOutcome::GoToJail => {
                self.push_log(format!("{name} is sent to jail").into());
                self.send_to_jail(idx);
                self.extra_roll = false;
                self.phase = Phase::TurnEnding;
            }
            LandingOutcome::OfferWorldTour => {
                self.open_decision(
                    name.clone(),
                    DecisionKind::WorldTour,
                    ActionPrompt::WorldTour,
                );
            }
            LandingOutcome::OfferFestival => {
                self.open_decision(name.clone(), DecisionKind::Festival, ActionPrompt::Festival);
            }
        }
    }

    fn apply_event(&mut self, idx: usize, effect: EventEffect) {
        let name = self.players[idx].name.clone();
        match effect {
            EventEffect::Receive { amount } => {
                self.players[idx].credit(amount);
                self.finish_action(idx);
            }
            EventEffect::Pay { amount } => {
                self.charge(idx, Creditor::Bank, amount);
            }
            EventEffect::MoveTo { square } => {
                let len = self.board.len();
                let steps = (square + len - self.players[idx].position) % len;
                if steps == 0 {
                    self.finish_action(idx);
                } else {
                    self.travel(idx, steps);
                }
            }
            EventEffect::GoToJail => {
                self.push_log(format!("{name} is sent to jail").into());
                self.send_to_jail(idx);
                self.extra_roll = false;
                self.phase = Phase::TurnEnding;
            }
            EventEffect::JailPass => {
                self.players[idx].jail_passes += 1;
                self.push_log(format!("{name} pockets a jail pass").into());
                self.finish_action(idx);
            }
        }
    }

    /// Settles the current landing action: grants the extra roll or moves
    /// to the end-of-turn wait.
    fn finish_action(&mut self, idx: usize) {
        if self.ended.is_some() || self.debt.is_some() {
            return;
        }
        if self.extra_roll && !self.players[idx].jailed {
            self.phase = Phase::WaitingForRoll;
            self.prompt(self.players[idx].name.clone(), ActionPrompt::Roll);
        } else {
            self.phase = Phase::TurnEnding;
        }
    }

    // ------------------------------------------------------------------
    // Decisions

    fn open_decision(&mut self, player: Box<str>, kind: DecisionKind, prompt: ActionPrompt) {
        self.pending = Some(PendingDecision {
            player: player.clone(),
            kind,
        });
        self.phase = Phase::TurnDecision;
        self.prompt(player, prompt);
    }

    fn purchase_decision(
        &mut self,
        idx: usize,
        square: SquareId,
        accept: bool,
    ) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        let decision = match &self.pending {
            None => return Err(IntentError::WrongPhase),
            Some(p) if p.player != name => return Err(IntentError::OutOfTurn),
            Some(p) => p.kind.clone(),
        };

        match decision {
            DecisionKind::Purchase {
                square: offered,
                price,
            } if offered == square => {
                if accept {
                    // An unaffordable acceptance is rejected with no state
                    // change; the prompt stays open.
                    if !self.players[idx].can_afford(price) {
                        return Err(IntentError::InsufficientFunds {
                            deficit: price - self.players[idx].balance,
                        });
                    }
                    self.pending = None;
                    let paid = self.players[idx].try_debit(price);
                    debug_assert!(paid);
                    self.board.assign_owner(square, &name);
                    self.players[idx].grant_ownership(square, &self.board);
                    self.emit_square_changed(square);
                    let title = self.square_name(square);
                    self.push_log(format!("{name} buys {title} for {price}").into());
                    if !self.win_check() {
                        self.finish_action(idx);
                    }
                } else {
                    self.pending = None;
                    let title = self.square_name(square);
                    self.push_log(format!("{name} declines to buy {title}").into());
                    self.finish_action(idx);
                }
                Ok(())
            }
            DecisionKind::Toll {
                square: offered,
                owner,
                amount,
                buyout,
            } if offered == square => {
                if accept {
                    let total = amount + buyout;
                    if !self.players[idx].can_afford(total) {
                        return Err(IntentError::InsufficientFunds {
                            deficit: total - self.players[idx].balance,
                        });
                    }
                    self.pending = None;
                    let paid = self.players[idx].try_debit(total);
                    debug_assert!(paid);
                    self.pay_player(&owner, total);
                    let transferred = self.board.transfer_owner(square, &name);
                    debug_assert!(transferred, "buyout offered on a locked square");
                    if let Some(owner_idx) = self.find_player(&owner) {
                        self.players[owner_idx].revoke_ownership(square, &self.board);
                    }
                    self.players[idx].grant_ownership(square, &self.board);
                    self.emit_square_changed(square);
                    let title = self.square_name(square);
                    self.push_log(
                        format!("{name} buys {title} out from {owner} for {total}").into(),
                    );
                    if !self.win_check() {
                        self.finish_action(idx);
                    }
                } else {
                    self.pending = None;
                    self.charge(idx, Creditor::Player { name: owner }, amount);
                }
                Ok(())
            }
            _ => Err(IntentError::InvalidSquare { square }),
        }
    }

    fn build_decision(
        &mut self,
        idx: usize,
        square: SquareId,
        building: Option<BuildingKind>,
    ) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        let offered = match &self.pending {
            None => return Err(IntentError::WrongPhase),
            Some(p) if p.player != name => return Err(IntentError::OutOfTurn),
            Some(p) => match p.kind {
                DecisionKind::Build { square } => square,
                _ => return Err(IntentError::InvalidSquare { square }),
            },
        };
        if offered != square {
            return Err(IntentError::InvalidSquare { square });
        }

        let Some(kind) = building else {
            self.pending = None;
            self.push_log(format!("{name} declines to build").into());
            self.finish_action(idx);
            return Ok(());
        };

        let sq = self
            .board
            .square(square)
            .ok_or(IntentError::InvalidSquare { square })?;
        if !sq.build_eligible() || sq.has_upgraded(kind) {
            return Err(IntentError::NotBuildEligible);
        }
        let cost = kind.cost(sq.price);
        if !self.players[idx].can_afford(cost) {
            return Err(IntentError::InsufficientFunds {
                deficit: cost - self.players[idx].balance,
            });
        }

        self.pending = None;
        let paid = self.players[idx].try_debit(cost);
        debug_assert!(paid);
        let result = self
            .board
            .add_building(square, kind, self.config.upgrade_threshold);
        let title = self.square_name(square);
        match result {
            BuildResult::Installed => {
                self.push_log(format!("{name} builds a {kind} on {title}").into());
            }
            BuildResult::Upgraded => {
                self.push_log(
                    format!("{name} upgrades {title}; the square is now locked").into(),
                );
            }
        }
        self.emit_square_changed(square);
        self.finish_action(idx);
        Ok(())
    }

    fn special_move_choice(
        &mut self,
        idx: usize,
        destination: SquareId,
    ) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        match &self.pending {
            Some(p) if p.player == name && p.kind == DecisionKind::WorldTour => {}
            Some(p) if p.player != name => return Err(IntentError::OutOfTurn),
            _ => return Err(IntentError::WrongPhase),
        }
        if destination >= self.board.len() || destination == self.players[idx].position {
            return Err(IntentError::InvalidSquare {
                square: destination,
            });
        }

        self.pending = None;
        // Direct travel: no lap bonus on a special move.
        self.players[idx].position = destination;
        self.emit(RoomBroadcast::PlayerMoved {
            player: name.clone(),
            square: destination,
            passed_start: false,
        });
        let title = self.square_name(destination);
        self.push_log(format!("{name} tours the board to {title}").into());
        self.resolve_landing(idx, destination);
        Ok(())
    }

    fn festival_choice(&mut self, idx: usize, square: SquareId) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        match &self.pending {
            Some(p) if p.player == name && p.kind == DecisionKind::Festival => {}
            Some(p) if p.player != name => return Err(IntentError::OutOfTurn),
            _ => return Err(IntentError::WrongPhase),
        }
        if !self.players[idx].owns(square) {
            return Err(IntentError::NotOwner);
        }

        self.pending = None;
        let boost = self.config.festival_boost_turns;
        if let Some(sq) = self.board.square_mut(square) {
            sq.boosted_turns = boost;
        }
        let title = self.square_name(square);
        self.push_log(format!("{name} hosts a festival at {title}").into());
        self.finish_action(idx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jail

    fn jail_decision(&mut self, idx: usize, method: JailMethod) -> Result<(), IntentError> {
        self.ensure_current(idx)?;
        if self.phase != Phase::JailDecision {
            return Err(IntentError::WrongPhase);
        }
        if !self.players[idx].jailed {
            return Err(IntentError::NotJailed);
        }
        let name = self.players[idx].name.clone();

        match method {
            JailMethod::PayFine => {
                let fine = self.config.jail_fine;
                if !self.players[idx].can_afford(fine) {
                    return Err(IntentError::InsufficientFunds {
                        deficit: fine - self.players[idx].balance,
                    });
                }
                let paid = self.players[idx].try_debit(fine);
                debug_assert!(paid);
                self.players[idx].leave_jail();
                self.push_log(format!("{name} pays the {fine} fine and walks free").into());
                self.phase = Phase::WaitingForRoll;
                self.prompt(name, ActionPrompt::Roll);
            }
            JailMethod::UseToken => {
                if self.players[idx].jail_passes == 0 {
                    return Err(IntentError::NoJailPass);
                }
                self.players[idx].jail_passes -= 1;
                self.players[idx].leave_jail();
                self.push_log(format!("{name} uses a jail pass").into());
                self.phase = Phase::WaitingForRoll;
                self.prompt(name, ActionPrompt::Roll);
            }
            JailMethod::RollForDouble => {
                let d1 = self.rng.gen_range(1..=6);
                let d2 = self.rng.gen_range(1..=6);
                self.jail_roll(idx, d1, d2);
            }
        }
        Ok(())
    }

    /// Resolves one validated escape attempt.
    fn jail_roll(&mut self, idx: usize, d1: u8, d2: u8) {
        let name = self.players[idx].name.clone();
        self.dice = Some((d1, d2));
        self.rolled = true;
        self.emit(RoomBroadcast::DiceRolled {
            player: name.clone(),
            values: [d1, d2],
            total: d1 + d2,
            is_double: d1 == d2,
        });

        if d1 == d2 {
            self.players[idx].leave_jail();
            self.players[idx].doubles_streak = 0;
            self.push_log(format!("{name} rolls a double and escapes jail").into());
            self.travel(idx, (d1 + d2) as usize);
            return;
        }

        self.players[idx].jail_attempts_left =
            self.players[idx].jail_attempts_left.saturating_sub(1);
        if self.players[idx].jail_attempts_left > 0 {
            self.push_log(format!("{name} fails to escape jail").into());
            self.phase = Phase::TurnEnding;
            return;
        }

        // Out of attempts: a held token, else the fine, forces release.
        if self.players[idx].jail_passes > 0 {
            self.players[idx].jail_passes -= 1;
            self.players[idx].leave_jail();
            self.push_log(format!("{name} surrenders a jail pass and is released").into());
            self.travel(idx, (d1 + d2) as usize);
        } else if self.players[idx].can_afford(self.config.jail_fine) {
            let fine = self.config.jail_fine;
            let paid = self.players[idx].try_debit(fine);
            debug_assert!(paid);
            self.players[idx].leave_jail();
            self.push_log(format!("{name} is forced to pay the {fine} fine").into());
            self.travel(idx, (d1 + d2) as usize);
        } else {
            self.push_log(format!("{name} remains in jail").into());
            self.phase = Phase::TurnEnding;
        }
    }

    fn send_to_jail(&mut self, idx: usize) {
        let jail = self.board.jail_index();
        self.players[idx].enter_jail(jail, &self.config);
        self.emit(RoomBroadcast::PlayerMoved {
            player: self.players[idx].name.clone(),
            square: jail,
            passed_start: false,
        });
    }

    // ------------------------------------------------------------------
    // Character cards

    fn use_character_card(&mut self, idx: usize) -> Result<(), IntentError> {
        self.ensure_current(idx)?;
        let name = self.players[idx].name.clone();
        let card = self.players[idx]
            .character
            .clone()
            .ok_or(IntentError::NoCharacterCard)?;

        let window_open = match card.window {
            ActivationWindow::BeforeRoll => {
                self.phase == Phase::WaitingForRoll
                    && !self.rolled
                    && self.pending.is_none()
                    && self.debt.is_none()
            }
            ActivationWindow::WhileJailed => {
                self.phase == Phase::JailDecision && self.players[idx].jailed
            }
        };
        if !window_open {
            return Err(IntentError::WindowClosed);
        }

        self.players[idx].take_character();
        self.push_log(format!("{name} plays {}", card.name).into());
        match card.effect {
            CharacterEffect::DoubleLapBonus => self.players[idx].double_lap_bonus = true,
            CharacterEffect::TollWaiver => self.players[idx].toll_waiver = true,
            CharacterEffect::BonusRoll => self.players[idx].bonus_roll = true,
            CharacterEffect::JailBreak => {
                self.players[idx].leave_jail();
                self.phase = Phase::WaitingForRoll;
                self.prompt(name, ActionPrompt::Roll);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alliances

    fn propose_alliance(&mut self, idx: usize, target: &str) -> Result<(), IntentError> {
        self.ensure_current(idx)?;
        self.ensure_unblocked()?;
        if !matches!(self.phase, Phase::WaitingForRoll | Phase::TurnEnding) {
            return Err(IntentError::WrongPhase);
        }
        let name = self.players[idx].name.clone();
        let target_idx = self
            .find_player(target)
            .ok_or_else(|| IntentError::InvalidTarget {
                player: target.into(),
            })?;
        if target_idx == idx || self.players[target_idx].bankrupt {
            return Err(IntentError::InvalidTarget {
                player: target.into(),
            });
        }
        if self.players[idx].ally.is_some() || self.players[target_idx].ally.is_some() {
            return Err(IntentError::AlreadyAllied);
        }

        // The decision window's designated responder is the target.
        self.open_decision(
            target.into(),
            DecisionKind::Alliance {
                proposer: name.clone(),
            },
            ActionPrompt::AllianceOffer { proposer: name },
        );
        Ok(())
    }

    fn alliance_response(
        &mut self,
        idx: usize,
        proposer: &str,
        accept: bool,
    ) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        match &self.pending {
            Some(p)
                if p.player == name
                    && p.kind
                        == (DecisionKind::Alliance {
                            proposer: proposer.into(),
                        }) => {}
            Some(p) if p.player != name => return Err(IntentError::OutOfTurn),
            _ => return Err(IntentError::WrongPhase),
        }

        self.pending = None;
        if accept {
            let turns = self.config.alliance_turns;
            if let Some(p_idx) = self.find_player(proposer) {
                self.players[p_idx].ally = Some(name.clone());
                self.players[idx].ally = Some(proposer.into());
                self.alliances.push(Alliance {
                    a: proposer.into(),
                    b: name.clone(),
                    remaining_turns: turns,
                });
                self.push_log(
                    format!("{proposer} and {name} form an alliance for {turns} turns").into(),
                );
            }
        } else {
            self.push_log(format!("{name} declines {proposer}'s alliance").into());
        }

        // The proposer's turn resumes where it left off; a granted extra
        // roll survives the interruption.
        self.restore_turn_phase();
        Ok(())
    }

    fn dissolve_alliance_of(&mut self, name: &str) {
        self.alliances
            .retain(|al| &*al.a != name && &*al.b != name);
        if let Some(idx) = self.find_player(name) {
            if let Some(partner) = self.players[idx].ally.take() {
                if let Some(p_idx) = self.find_player(&partner) {
                    self.players[p_idx].ally = None;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Payments, debt, bankruptcy

    /// Requests a payment from `idx`. A shortfall enters debt resolution
    /// when liquidation can cover it, and terminal bankruptcy otherwise.
    fn charge(&mut self, idx: usize, creditor: Creditor, amount: Money) {
        let name = self.players[idx].name.clone();
        if amount == 0 {
            self.finish_action(idx);
            return;
        }

        if self.players[idx].try_debit(amount) {
            if let Creditor::Player { name: ref to } = creditor {
                self.pay_player(to, amount);
            }
            self.push_log(format!("{name} pays {amount} to {creditor}").into());
            self.finish_action(idx);
            return;
        }

        let reachable = self.players[idx].balance + self.liquidation_value(idx);
        if reachable < amount {
            self.push_log(format!("{name} cannot cover {amount} owed to {creditor}").into());
            self.bankrupt(idx, creditor);
            return;
        }

        // Debt resolution blocks any further dice rolls this turn.
        self.extra_roll = false;
        self.debt = Some(DebtState {
            debtor: name.clone(),
            creditor: creditor.clone(),
            amount,
        });
        self.phase = Phase::DebtSettlement;
        self.push_log(format!("{name} owes {amount} to {creditor} and must liquidate").into());
        self.prompt(name, ActionPrompt::Debt { amount, creditor });
    }

    /// Cash still raisable by selling base buildings (half cost) and
    /// mortgaging unmortgaged, unlocked squares (full price).
    fn liquidation_value(&self, idx: usize) -> Money {
        let mut total = 0;
        for &id in &self.players[idx].owned {
            let Some(sq) = self.board.square(id) else {
                continue;
            };
            if !sq.mortgaged && !sq.locked {
                total += sq.price;
            }
            for b in sq.buildings.iter().filter(|b| !b.upgraded) {
                total += b.kind.cost(sq.price) / 2;
            }
        }
        total
    }

    fn debt_resolution_action(
        &mut self,
        idx: usize,
        method: DebtMethod,
        square: SquareId,
        building: Option<BuildingKind>,
    ) -> Result<(), IntentError> {
        let name = self.players[idx].name.clone();
        let debt = match &self.debt {
            None => return Err(IntentError::NotInDebt),
            Some(d) if d.debtor != name => return Err(IntentError::OutOfTurn),
            Some(d) => d.clone(),
        };
        if !self.players[idx].owns(square) {
            return Err(IntentError::NotOwner);
        }

        match method {
            DebtMethod::SellBuilding => {
                let kind = building.ok_or(IntentError::NotBuildEligible)?;
                let price = self
                    .board
                    .square(square)
                    .map(|s| s.price)
                    .ok_or(IntentError::InvalidSquare { square })?;
                if !self.board.sell_building(square, kind) {
                    return Err(IntentError::NotBuildEligible);
                }
                let refund = kind.cost(price) / 2;
                self.players[idx].credit(refund);
                let title = self.square_name(square);
                self.push_log(format!("{name} sells a {kind} at {title} for {refund}").into());
                self.emit_square_changed(square);
            }
            DebtMethod::Mortgage => {
                if !self.board.mortgage(square) {
                    return Err(IntentError::InvalidSquare { square });
                }
                let value = self
                    .board
                    .square(square)
                    .map(|s| s.price)
                    .unwrap_or_default();
                self.players[idx].credit(value);
                let title = self.square_name(square);
                self.push_log(format!("{name} mortgages {title} for {value}").into());
                self.emit_square_changed(square);
            }
        }

        // Re-check affordability after every liquidation step.
        if self.players[idx].balance >= debt.amount {
            let paid = self.players[idx].try_debit(debt.amount);
            debug_assert!(paid);
            if let Creditor::Player { name: ref to } = debt.creditor {
                self.pay_player(to, debt.amount);
            }
            self.debt = None;
            self.push_log(
                format!("{name} settles the {} owed to {}", debt.amount, debt.creditor).into(),
            );
            self.finish_action(idx);
        } else {
            let remaining = debt.amount - self.players[idx].balance;
            self.prompt(
                name,
                ActionPrompt::Debt {
                    amount: debt.amount,
                    creditor: debt.creditor.clone(),
                },
            );
            tracing::debug!(debtor = %debt.debtor, remaining, "debt still open");
        }
        Ok(())
    }

    /// Terminal bankruptcy: everything the debtor has goes to the creditor,
    /// the debtor leaves the rotation, and the win condition is checked.
    fn bankrupt(&mut self, idx: usize, creditor: Creditor) {
        let name = self.players[idx].name.clone();
        self.liquidate_to(idx, creditor);
        self.debt = None;
        if self
            .pending
            .as_ref()
            .map_or(false, |p| p.player == name)
        {
            self.pending = None;
        }
        if !self.win_check() && idx == self.current {
            self.advance_turn();
        }
    }

    /// Transfers the remaining balance and every owned square to the
    /// creditor, then flags the player bankrupt. Locked squares never change
    /// owner, so they (and everything transferred to the bank) reset.
    fn liquidate_to(&mut self, idx: usize, creditor: Creditor) {
        let name = self.players[idx].name.clone();
        let balance = std::mem::take(&mut self.players[idx].balance);
        let owned = std::mem::take(&mut self.players[idx].owned);

        let creditor_idx = match &creditor {
            Creditor::Player { name: to } => self.find_player(to),
            Creditor::Bank => None,
        };

        if let Some(c_idx) = creditor_idx {
            self.players[c_idx].credit(balance);
        }

        for id in owned {
            let locked = self.board.square(id).map_or(false, |s| s.locked);
            match creditor_idx {
                Some(c_idx) if !locked => {
                    let to = self.players[c_idx].name.clone();
                    self.board.transfer_owner(id, &to);
                    self.players[c_idx].grant_ownership(id, &self.board);
                }
                _ => self.board.reset_square(id),
            }
            self.emit_square_changed(id);
        }
        if let Some(c_idx) = creditor_idx {
            self.players[c_idx].recompute_completed_groups(&self.board);
        }

        self.dissolve_alliance_of(&name);
        self.players[idx].bankrupt = true;
        self.players[idx].completed_groups.clear();
        self.push_log(format!("{name} is bankrupt").into());
    }

    fn pay_player(&mut self, to: &str, amount: Money) {
        if let Some(idx) = self.find_player(to) {
            if !self.players[idx].bankrupt {
                self.players[idx].credit(amount);
            }
        }
    }

    // ------------------------------------------------------------------
    // Turn rotation and win conditions

    fn end_turn(&mut self, idx: usize) -> Result<(), IntentError> {
        self.ensure_current(idx)?;
        self.ensure_unblocked()?;
        let may_end = match self.phase {
            Phase::TurnEnding => true,
            // Declining a granted extra roll.
            Phase::WaitingForRoll => self.rolled,
            // Declining jail actions and sitting the turn out.
            Phase::JailDecision => true,
            _ => false,
        };
        if !may_end {
            return Err(IntentError::WrongPhase);
        }
        self.advance_turn();
        Ok(())
    }

    /// Returns the turn to where the current player left off before a
    /// decision window interrupted it: back to the roll while one is still
    /// owed, otherwise to the end-of-turn wait.
    fn restore_turn_phase(&mut self) {
        if self.extra_roll || !self.rolled {
            self.phase = Phase::WaitingForRoll;
            let name = self.players[self.current].name.clone();
            self.prompt(name, ActionPrompt::Roll);
        } else {
            self.phase = Phase::TurnEnding;
        }
    }

    fn advance_turn(&mut self) {
        if let Some(p) = self.players.get_mut(self.current) {
            p.doubles_streak = 0;
        }
        self.dice = None;
        self.rolled = false;
        self.extra_roll = false;
        self.tick_alliances();
        self.tick_boosts();
        self.turn += 1;

        // Rotate to the next non-bankrupt player.
        for _ in 0..self.players.len() {
            self.current = (self.current + 1) % self.players.len();
            if !self.players[self.current].bankrupt {
                break;
            }
        }

        let name = self.players[self.current].name.clone();
        if self.players[self.current].jailed {
            self.phase = Phase::JailDecision;
            self.prompt(
                name,
                ActionPrompt::Jail {
                    attempts_left: self.players[self.current].jail_attempts_left,
                    fine: self.config.jail_fine,
                },
            );
        } else {
            self.phase = Phase::WaitingForRoll;
            self.prompt(name, ActionPrompt::Roll);
        }
    }

    fn tick_alliances(&mut self) {
        let mut expired = Vec::new();
        for alliance in &mut self.alliances {
            alliance.remaining_turns = alliance.remaining_turns.saturating_sub(1);
            if alliance.remaining_turns == 0 {
                expired.push((alliance.a.clone(), alliance.b.clone()));
            }
        }
        self.alliances.retain(|al| al.remaining_turns > 0);
        for (a, b) in expired {
            for name in [&a, &b] {
                if let Some(idx) = self.find_player(name) {
                    self.players[idx].ally = None;
                }
            }
            self.push_log(format!("the alliance between {a} and {b} expires").into());
        }
    }

    fn tick_boosts(&mut self) {
        for id in 0..self.board.len() {
            if let Some(sq) = self.board.square_mut(id) {
                sq.boosted_turns = sq.boosted_turns.saturating_sub(1);
            }
        }
    }

    /// Evaluates the win conditions. Returns true if the game just ended.
    fn win_check(&mut self) -> bool {
        if self.ended.is_some() {
            return true;
        }
        let alive: Vec<usize> = (0..self.players.len())
            .filter(|&i| !self.players[i].bankrupt)
            .collect();

        if alive.len() == 1 {
            self.end_game(
                Some(self.players[alive[0]].name.clone()),
                GameEndReason::LastPlayerStanding,
            );
            return true;
        }
        for i in alive {
            let groups = self.players[i].completed_groups.len();
            if groups >= self.config.target_completed_groups {
                self.end_game(
                    Some(self.players[i].name.clone()),
                    GameEndReason::MonopolyTarget { groups },
                );
                return true;
            }
        }
        false
    }

    fn end_game(&mut self, winner: Option<Box<str>>, reason: GameEndReason) {
        tracing::info!(?winner, %reason, "game over");
        self.ended = Some(reason.clone());
        self.phase = Phase::GameOver;
        self.pending = None;
        self.debt = None;
        self.emit(RoomBroadcast::GameEnded { winner, reason });
    }

    // ------------------------------------------------------------------
    // Small helpers

    fn ensure_current(&self, idx: usize) -> Result<(), IntentError> {
        if idx == self.current {
            Ok(())
        } else {
            Err(IntentError::OutOfTurn)
        }
    }

    fn ensure_unblocked(&self) -> Result<(), IntentError> {
        if let Some(p) = &self.pending {
            return Err(IntentError::DecisionPending {
                player: p.player.clone(),
            });
        }
        if self.debt.is_some() {
            return Err(IntentError::WrongPhase);
        }
        Ok(())
    }

    fn find_player(&self, name: &str) -> Option<usize> {
        self.players.iter().position(|p| &*p.name == name)
    }

    fn deal_characters(&mut self) {
        let mut set = CharacterCard::standard_set();
        set.shuffle(&mut self.rng);
        let mut cycle = set.into_iter().cycle();
        for player in &mut self.players {
            player.character = cycle.next();
        }
    }

    fn build_options(&self, square: SquareId) -> Vec<BuildOption> {
        let Some(sq) = self.board.square(square) else {
            return Vec::new();
        };
        [BuildingKind::Villa, BuildingKind::Hotel]
            .into_iter()
            .filter(|&kind| !sq.has_upgraded(kind))
            .map(|kind| BuildOption {
                building: kind,
                cost: kind.cost(sq.price),
            })
            .collect()
    }

    fn square_name(&self, id: SquareId) -> Box<str> {
        self.board
            .square(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "nowhere".into())
    }

    fn emit(&mut self, event: RoomBroadcast) {
        self.events.push(event);
    }

    fn emit_snapshot(&mut self) {
        let snapshot = self.snapshot();
        self.emit(RoomBroadcast::Snapshot { snapshot });
    }

    fn emit_square_changed(&mut self, id: SquareId) {
        if let Some(sq) = self.board.square(id) {
            let event = RoomBroadcast::SquareChanged {
                square: id,
                owner: sq.owner.clone(),
                buildings: sq.buildings.clone(),
                mortgaged: sq.mortgaged,
            };
            self.emit(event);
        }
    }

    fn prompt(&mut self, target: Box<str>, prompt: ActionPrompt) {
        self.emit(RoomBroadcast::Private {
            target,
            message: PrivateMessage::Prompt { prompt },
        });
    }

    fn notice(&mut self, target: Box<str>, text: Box<str>) {
        self.emit(RoomBroadcast::Private {
            target,
            message: PrivateMessage::Notice { text },
        });
    }

    fn push_log(&mut self, text: Box<str>) {
        if self.log.len() >= self.config.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            turn: self.turn,
            text,
        });
    }
}
