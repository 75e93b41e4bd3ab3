use clap::Parser;
use tracing_subscriber::EnvFilter;

use game::board::{Board, BuildingKind};
use game::messages::{
    DebtMethod, DecisionKind, JailMethod, Phase, PlayerIntent, RoomBroadcast, RoomSnapshot,
};
use game::GameConfig;
use room::{ClientRequest, Handshake, NewConnection, RoomCommand, RoomSession};

mod cli;
mod game;
mod room;

const BOT_NAMES: [&str; 8] = [
    "ada", "babbage", "curie", "darwin", "euler", "faraday", "gauss", "hopper",
];

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    match cli.intent {
        cli::Intent::Simulate {
            players,
            seed,
            max_turns,
        } => simulate(players.clamp(2, BOT_NAMES.len()), seed, max_turns).await,
        cli::Intent::Board => {
            let board = Board::standard();
            println!("{}", serde_json::to_string_pretty(board.squares()).unwrap());
        }
    }
}

/// Seats `players` bots in one room and lets them play to completion. The
/// observer connection prints everything the room broadcasts.
async fn simulate(players: usize, seed: Option<u64>, max_turns: u64) {
    let seed = seed.unwrap_or_else(rand::random);
    tracing::info!(players, seed, "starting simulation");

    let room = RoomSession::open(GameConfig::default(), seed);
    let mut observer = room
        .connect_player(Handshake {
            player_name: "observer".into(),
            spectating: true,
            host: true,
        })
        .expect("empty room accepts the observer");

    for name in &BOT_NAMES[..players] {
        let connection = room
            .connect_player(Handshake {
                player_name: (*name).into(),
                spectating: false,
                host: false,
            })
            .expect("room accepts bots up to the player cap");
        tokio::spawn(run_bot((*name).into(), connection));
    }

    observer
        .interface
        .send(ClientRequest::Command {
            command: RoomCommand::StartGame,
        })
        .await;

    let mut ended_early = false;
    while let Some(event) = observer.interface.recv().await {
        println!("{}", serde_json::to_string(&event).unwrap());
        match &event {
            RoomBroadcast::GameEnded { .. } => break,
            RoomBroadcast::Snapshot { snapshot }
                if snapshot.turn > max_turns && !ended_early =>
            {
                ended_early = true;
                observer
                    .interface
                    .send(ClientRequest::Command {
                        command: RoomCommand::EndGame,
                    })
                    .await;
            }
            _ => {}
        }
    }
}

/// A bot: reacts to each settled snapshot with the next obvious intent.
async fn run_bot(name: Box<str>, mut connection: NewConnection) {
    loop {
        let Some(event) = connection.interface.recv().await else {
            break;
        };
        let RoomBroadcast::Snapshot { snapshot } = event else {
            continue;
        };
        if snapshot.phase == Phase::GameOver {
            break;
        }
        if let Some(intent) = bot_intent(&name, &snapshot) {
            if !connection
                .interface
                .send(ClientRequest::Intent { intent })
                .await
            {
                break;
            }
        }
    }
    connection.interface.close().await;
}

/// Picks the bot's move for a snapshot, or nothing if it is not the bot's
/// turn to act.
fn bot_intent(name: &str, snapshot: &RoomSnapshot) -> Option<PlayerIntent> {
    let me = snapshot.players.iter().find(|p| &*p.name == name)?;

    if let Some(debt) = &snapshot.debt {
        if &*debt.debtor != name {
            return None;
        }
        // Mortgage before tearing buildings down; locked squares cannot
        // be mortgaged.
        for (id, square) in snapshot.squares.iter().enumerate() {
            if square.owner.as_deref() == Some(name) && !square.mortgaged && !square.locked {
                return Some(PlayerIntent::DebtResolutionAction {
                    method: DebtMethod::Mortgage,
                    square: id,
                    building: None,
                });
            }
        }
        for (id, square) in snapshot.squares.iter().enumerate() {
            if square.owner.as_deref() != Some(name) {
                continue;
            }
            if let Some(unit) = square.buildings.iter().find(|b| !b.upgraded) {
                return Some(PlayerIntent::DebtResolutionAction {
                    method: DebtMethod::SellBuilding,
                    square: id,
                    building: Some(unit.kind),
                });
            }
        }
        return None;
    }

    if let Some(pending) = &snapshot.pending {
        if &*pending.player != name {
            return None;
        }
        return Some(match &pending.kind {
            DecisionKind::Purchase { square, price } => PlayerIntent::PurchaseDecision {
                square: *square,
                accept: me.balance >= *price,
            },
            // Always pay the toll rather than buying the square out.
            DecisionKind::Toll { square, .. } => PlayerIntent::PurchaseDecision {
                square: *square,
                accept: false,
            },
            DecisionKind::Build { square } => {
                let sq = &snapshot.squares[*square];
                let pick = [BuildingKind::Villa, BuildingKind::Hotel]
                    .into_iter()
                    .find(|&kind| !sq.has_upgraded(kind) && me.balance >= kind.cost(sq.price));
                PlayerIntent::BuildDecision {
                    square: *square,
                    building: pick,
                }
            }
            DecisionKind::WorldTour => PlayerIntent::SpecialMoveChoice {
                destination: (me.position + 1) % snapshot.squares.len(),
            },
            DecisionKind::Festival => PlayerIntent::FestivalChoice {
                square: *me.owned.first()?,
            },
            DecisionKind::Alliance { proposer } => PlayerIntent::AllianceResponse {
                proposer: proposer.clone(),
                accept: true,
            },
        });
    }

    if &*snapshot.current_player != name {
        return None;
    }
    match snapshot.phase {
        Phase::WaitingForRoll => Some(PlayerIntent::RollDice),
        Phase::JailDecision => Some(PlayerIntent::JailDecision {
            method: JailMethod::RollForDouble,
        }),
        Phase::TurnEnding => Some(PlayerIntent::EndTurn),
        _ => None,
    }
}
