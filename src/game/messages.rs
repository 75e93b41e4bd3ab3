use std::fmt;

use serde::{Deserialize, Serialize};

use super::board::{Building, BuildingKind, Square};
use super::player::PlayerAccount;
use super::{Money, SquareId};

/// Inbound intents the engine accepts. Apart from alliance responses, every
/// intent must come from the current player in a phase that permits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PlayerIntent {
    RollDice,
    /// Answers both purchase prompts and toll buy-out prompts.
    PurchaseDecision { square: SquareId, accept: bool },
    /// `building: None` declines the build offer.
    BuildDecision {
        square: SquareId,
        building: Option<BuildingKind>,
    },
    JailDecision { method: JailMethod },
    EndTurn,
    UseCharacterCard,
    ProposeAlliance { target: Box<str> },
    AllianceResponse { proposer: Box<str>, accept: bool },
    SpecialMoveChoice { destination: SquareId },
    FestivalChoice { square: SquareId },
    DebtResolutionAction {
        method: DebtMethod,
        square: SquareId,
        building: Option<BuildingKind>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JailMethod {
    PayFine,
    UseToken,
    RollForDouble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtMethod {
    SellBuilding,
    Mortgage,
}

/// An intent tagged with the name of the player who sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedIntent {
    pub player_name: Box<str>,
    #[serde(flatten)]
    pub intent: PlayerIntent,
}

/// The other side of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creditor {
    Bank,
    Player { name: Box<str> },
}

impl fmt::Display for Creditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Creditor::Bank => write!(f, "the bank"),
            Creditor::Player { name } => write!(f, "{name}"),
        }
    }
}

/// Turn phase of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Roster assembly; the game has not started.
    Initializing,
    WaitingForRoll,
    /// Jailed player's turn start: choose a release method or end the turn.
    JailDecision,
    /// Blocked on the pending decision's designated player.
    TurnDecision,
    /// Blocked on the debtor's liquidation actions.
    DebtSettlement,
    /// Action settled; waiting for the explicit end-turn.
    TurnEnding,
    GameOver,
}

/// The single pending-decision slot: who must respond, and to what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub player: Box<str>,
    #[serde(flatten)]
    pub kind: DecisionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum DecisionKind {
    Purchase {
        square: SquareId,
        price: Money,
    },
    Build {
        square: SquareId,
    },
    /// Pay the toll, or take the square over at the premium. Only offered
    /// while the square is unlocked.
    Toll {
        square: SquareId,
        owner: Box<str>,
        amount: Money,
        buyout: Money,
    },
    WorldTour,
    Festival,
    Alliance {
        proposer: Box<str>,
    },
}

/// An unsettled obligation being worked off through liquidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtState {
    pub debtor: Box<str>,
    pub creditor: Creditor,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub turn: u64,
    pub text: Box<str>,
}

/// Serializable view of a settled room state: the persisted-state boundary
/// and the payload broadcast after every settled step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub turn: u64,
    pub phase: Phase,
    pub current_player: Box<str>,
    /// Last dice values of the turn in progress.
    pub dice: Option<(u8, u8)>,
    pub squares: Vec<Square>,
    pub players: Vec<PlayerAccount>,
    pub pending: Option<PendingDecision>,
    pub debt: Option<DebtState>,
    pub log: Vec<LogEntry>,
}

/// A decision or action requested from one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "prompt")]
pub enum ActionPrompt {
    Roll,
    Purchase {
        square: SquareId,
        price: Money,
    },
    Build {
        square: SquareId,
        options: Vec<BuildOption>,
    },
    Toll {
        square: SquareId,
        amount: Money,
        buyout: Option<Money>,
    },
    Jail {
        attempts_left: u8,
        fine: Money,
    },
    WorldTour,
    Festival,
    AllianceOffer {
        proposer: Box<str>,
    },
    Debt {
        amount: Money,
        creditor: Creditor,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BuildOption {
    pub building: BuildingKind,
    pub cost: Money,
}

/// Messages meant only for the eyes of one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "message")]
pub enum PrivateMessage {
    Prompt {
        #[serde(flatten)]
        prompt: ActionPrompt,
    },
    Notice {
        text: Box<str>,
    },
    Rejected {
        #[serde(flatten)]
        reason: IntentError,
    },
}

/// Authoritative emissions from a room, broadcast to every participant;
/// `Private` is filtered down to its target by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RoomBroadcast {
    Snapshot {
        snapshot: RoomSnapshot,
    },
    DiceRolled {
        player: Box<str>,
        values: [u8; 2],
        total: u8,
        is_double: bool,
    },
    PlayerMoved {
        player: Box<str>,
        square: SquareId,
        passed_start: bool,
    },
    SquareChanged {
        square: SquareId,
        owner: Option<Box<str>>,
        buildings: Vec<Building>,
        mortgaged: bool,
    },
    GameEnded {
        winner: Option<Box<str>>,
        #[serde(flatten)]
        reason: GameEndReason,
    },
    Joined {
        player: Box<str>,
    },
    Left {
        player: Box<str>,
    },
    Chat {
        player: Box<str>,
        message: Box<str>,
    },
    Private {
        target: Box<str>,
        #[serde(flatten)]
        message: PrivateMessage,
    },
}

/// Reason the game ended.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GameEndReason {
    #[error("only one solvent player remains")]
    LastPlayerStanding,
    #[error("a player completed {groups} ownership groups")]
    MonopolyTarget { groups: usize },
    #[error("the game was ended by the host")]
    EndedEarly,
}

/// Why an intent was rejected. Rejections are unicast to the sender and
/// never mutate state.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "error")]
pub enum IntentError {
    #[error("the room has not started a game")]
    NotStarted,
    #[error("a game has already started")]
    GameAlreadyStarted,
    #[error("at least two players are needed to start")]
    NotEnoughPlayers,
    #[error("message sent out of turn")]
    OutOfTurn,
    #[error("action not permitted in the current phase")]
    WrongPhase,
    #[error("a decision is pending from {player}")]
    DecisionPending { player: Box<str> },
    #[error("unknown player {player}")]
    UnknownPlayer { player: Box<str> },
    #[error("square {square} is not a valid target")]
    InvalidSquare { square: SquareId },
    #[error("player {player} is not a valid target")]
    InvalidTarget { player: Box<str> },
    #[error("square is not owned by the sender")]
    NotOwner,
    #[error("square cannot hold that building")]
    NotBuildEligible,
    #[error("lacking {deficit}")]
    InsufficientFunds { deficit: Money },
    #[error("no character card held")]
    NoCharacterCard,
    #[error("character card cannot be used now")]
    WindowClosed,
    #[error("player is not in jail")]
    NotJailed,
    #[error("no jail pass held")]
    NoJailPass,
    #[error("no debt is being settled")]
    NotInDebt,
    #[error("player is already in an alliance")]
    AlreadyAllied,
    #[error("the room is full")]
    RoomFull,
    #[error("name is already in use")]
    NameTaken,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intents_round_trip_as_tagged_json() {
        let intents = vec![
            PlayerIntent::RollDice,
            PlayerIntent::PurchaseDecision {
                square: 7,
                accept: true,
            },
            PlayerIntent::BuildDecision {
                square: 7,
                building: Some(BuildingKind::Villa),
            },
            PlayerIntent::JailDecision {
                method: JailMethod::RollForDouble,
            },
            PlayerIntent::DebtResolutionAction {
                method: DebtMethod::Mortgage,
                square: 12,
                building: None,
            },
        ];
        for intent in intents {
            let json = serde_json::to_string(&intent).unwrap();
            let back: PlayerIntent = serde_json::from_str(&json).unwrap();
            assert_eq!(
                serde_json::to_string(&back).unwrap(),
                json,
                "unstable encoding for {json}"
            );
        }
    }

    #[test]
    fn roll_dice_wire_form() {
        let tagged = TaggedIntent {
            player_name: "ada".into(),
            intent: PlayerIntent::RollDice,
        };
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["action"], "roll_dice");
        assert_eq!(json["player_name"], "ada");
    }

    #[test]
    fn rejections_carry_their_reason() {
        let broadcast = RoomBroadcast::Private {
            target: "ada".into(),
            message: PrivateMessage::Rejected {
                reason: IntentError::InsufficientFunds { deficit: 40 },
            },
        };
        let json = serde_json::to_value(&broadcast).unwrap();
        assert_eq!(json["event"], "private");
        assert_eq!(json["error"], "insufficient_funds");
        assert_eq!(json["deficit"], 40);
    }
}
