//! Room lifecycle and transport plumbing. A [`RoomSession`] owns one
//! [`GameSession`] behind a mutex and fans its emissions out over a
//! broadcast channel; a [`RoomRegistry`] owns every live room, creating
//! rooms on first join and reaping them once the last connection leaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::game::messages::{
    IntentError, PlayerIntent, PrivateMessage, RoomBroadcast, RoomSnapshot,
};
use crate::game::session::GameSession;
use crate::game::GameConfig;

/// The object used to introduce a player to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub player_name: Box<str>,
    /// Spectators watch the broadcast stream but hold no account.
    pub spectating: bool,
    /// Flag that permits room commands (start, reset, end).
    pub host: bool,
}

/// Requests a connected client may send to its room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum ClientRequest {
    Intent {
        #[serde(flatten)]
        intent: PlayerIntent,
    },
    Chat {
        message: Box<str>,
    },
    Command {
        command: RoomCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomCommand {
    StartGame,
    ResetGame,
    EndGame,
}

/// A request tagged with the sender, as seen by the room loop.
#[derive(Debug, Clone)]
struct TaggedRequest {
    player_name: Box<str>,
    kind: ClientRequest,
}

/// Why a room refused a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionReject {
    #[error("name is already in use")]
    NameTaken,
    #[error("the room is full")]
    RoomFull,
    /// A game is running; joining as a spectator should work.
    #[error("a game is in progress")]
    GameInProgress,
}

/// Tracks who is connected to a room, players and spectators alike.
#[derive(Debug, Clone, Default)]
struct Roster {
    connections: HashMap<Box<str>, Handshake>,
}

impl Roster {
    fn connect(&mut self, handshake: Handshake) -> Result<(), ConnectionReject> {
        if self.connections.contains_key(&handshake.player_name) {
            return Err(ConnectionReject::NameTaken);
        }
        self.connections
            .insert(handshake.player_name.clone(), handshake);
        Ok(())
    }

    fn disconnect(&mut self, name: &str) -> bool {
        self.connections.remove(name).is_some()
    }

    fn is_host(&self, name: &str) -> bool {
        self.connections.get(name).map_or(false, |h| h.host)
    }

    fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

/// A new connection to a room: the join-time snapshot plus the channel
/// pair used to talk to it.
#[derive(Debug)]
pub struct NewConnection {
    pub handshake: Handshake,
    /// State of the room at the moment of joining.
    pub snapshot: RoomSnapshot,
    pub interface: Interface,
}

/// The channel pair between one client and its room.
///
/// To disconnect, drop (or [`close`](Interface::close)) the sending half and
/// keep draining the receiver until it closes; that gives the room time to
/// process the forfeit before the client goes away.
#[derive(Debug)]
#[must_use]
pub struct Interface {
    sender: mpsc::Sender<ClientRequest>,
    recv: mpsc::Receiver<RoomBroadcast>,
}

impl Interface {
    pub async fn send(&self, request: ClientRequest) -> bool {
        self.sender.send(request).await.is_ok()
    }

    pub async fn recv(&mut self) -> Option<RoomBroadcast> {
        self.recv.recv().await
    }

    pub fn sender(&self) -> &mpsc::Sender<ClientRequest> {
        &self.sender
    }

    /// Closes the sending half and drains the receiver until the room has
    /// finished processing the disconnect.
    pub async fn close(mut self) {
        drop(self.sender);
        while self.recv.recv().await.is_some() {}
    }
}

/// Copyable handle to a running room.
#[derive(Debug, Clone)]
pub struct RoomSession {
    game: Arc<Mutex<GameSession>>,
    roster: Arc<Mutex<Roster>>,
    broadcaster: broadcast::Sender<RoomBroadcast>,
    request_sender: mpsc::Sender<TaggedRequest>,
    /// Notified whenever the last connection leaves.
    vacancy: Arc<Notify>,
}

impl RoomSession {
    /// Opens an empty room and spawns its request loop.
    pub fn open(config: GameConfig, seed: u64) -> Self {
        let (broadcaster, _) = broadcast::channel(64);
        let game = Arc::new(Mutex::new(GameSession::new(config, seed)));
        let roster = Arc::new(Mutex::new(Roster::default()));
        let request_sender =
            Self::listen_for_requests(broadcaster.clone(), roster.clone(), game.clone());

        Self {
            game,
            roster,
            broadcaster,
            request_sender,
            vacancy: Arc::new(Notify::new()),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.roster.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.lock().unwrap().is_empty()
    }

    /// Connects a player or spectator, spawning the two tasks that move
    /// messages between the client and the room.
    pub fn connect_player(&self, handshake: Handshake) -> Result<NewConnection, ConnectionReject> {
        let mut roster = self.roster.lock().unwrap();
        let mut game = self.game.lock().unwrap();

        if roster.connections.contains_key(&handshake.player_name) {
            return Err(ConnectionReject::NameTaken);
        }
        if !handshake.spectating {
            game.add_player(&handshake.player_name)
                .map_err(|err| match err {
                    IntentError::NameTaken => ConnectionReject::NameTaken,
                    IntentError::RoomFull => ConnectionReject::RoomFull,
                    _ => ConnectionReject::GameInProgress,
                })?;
        }
        roster.connect(handshake.clone())?;

        tracing::info!(
            player = %handshake.player_name,
            spectating = handshake.spectating,
            "connected to room"
        );
        self.broadcaster
            .send(RoomBroadcast::Joined {
                player: handshake.player_name.clone(),
            })
            .ok();

        let snapshot = game.snapshot();
        drop(game);
        drop(roster);

        let shutdown = Arc::new(Notify::new());
        let sender = self.player_to_room(handshake.clone(), shutdown.clone());
        let recv = self.room_to_player(handshake.clone(), shutdown.clone());

        // Task triggered when either half of the connection closes.
        let name = handshake.player_name.clone();
        let spectating = handshake.spectating;
        let roster = self.roster.clone();
        let game = self.game.clone();
        let broadcaster = self.broadcaster.clone();
        let vacancy = self.vacancy.clone();
        tokio::spawn(async move {
            shutdown.notified().await;

            roster.lock().unwrap().disconnect(&name);
            if spectating {
                broadcaster.send(RoomBroadcast::Left { player: name }).ok();
            } else {
                // Leaving mid-game is a forfeit.
                let events = game.lock().unwrap().remove_player(&name);
                for event in events {
                    broadcaster.send(event).ok();
                }
            }
            if roster.lock().unwrap().is_empty() {
                // notify_one stores a permit in case the reaper is busy.
                vacancy.notify_one();
            }
        });

        Ok(NewConnection {
            handshake,
            snapshot,
            interface: Interface { sender, recv },
        })
    }

    /// Forwards requests from one client into the room loop.
    fn player_to_room(
        &self,
        handshake: Handshake,
        shutdown: Arc<Notify>,
    ) -> mpsc::Sender<ClientRequest> {
        let room_sender = self.request_sender.clone();
        let (client_send, mut client_recv) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    request = client_recv.recv() => request,
                    _ = shutdown.notified() => break,
                };
                let Some(request) = request else { break };
                let tagged = TaggedRequest {
                    player_name: handshake.player_name.clone(),
                    kind: request,
                };
                if room_sender.send(tagged).await.is_err() {
                    break;
                }
            }
            shutdown.notify_waiters();
        });

        client_send
    }

    /// Forwards room broadcasts to one client, filtering private messages
    /// down to their target.
    fn room_to_player(
        &self,
        handshake: Handshake,
        shutdown: Arc<Notify>,
    ) -> mpsc::Receiver<RoomBroadcast> {
        let mut broadcast_recv = self.broadcaster.subscribe();
        let (player_send, client_recv) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = broadcast_recv.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                player = %handshake.player_name,
                                skipped,
                                "slow consumer dropped broadcasts"
                            );
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.notified() => break,
                };

                if let RoomBroadcast::Private { target, .. } = &event {
                    if target != &handshake.player_name {
                        continue;
                    }
                }
                if player_send.send(event).await.is_err() {
                    break;
                }
            }
            shutdown.notify_waiters();
        });

        client_recv
    }

    /// The room loop: applies one request at a time against the game and
    /// fans the resulting emissions out to everyone.
    fn listen_for_requests(
        broadcaster: broadcast::Sender<RoomBroadcast>,
        roster: Arc<Mutex<Roster>>,
        game: Arc<Mutex<GameSession>>,
    ) -> mpsc::Sender<TaggedRequest> {
        let (sender, mut receiver) = mpsc::channel::<TaggedRequest>(16);

        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let name = request.player_name;
                match request.kind {
                    ClientRequest::Intent { intent } => {
                        let result = game.lock().unwrap().handle(&name, intent);
                        Self::relay(&broadcaster, name, result);
                    }
                    ClientRequest::Chat { message } => {
                        broadcaster
                            .send(RoomBroadcast::Chat {
                                player: name,
                                message,
                            })
                            .ok();
                    }
                    ClientRequest::Command { command } => {
                        if !roster.lock().unwrap().is_host(&name) {
                            broadcaster
                                .send(RoomBroadcast::Private {
                                    target: name,
                                    message: PrivateMessage::Rejected {
                                        reason: IntentError::OutOfTurn,
                                    },
                                })
                                .ok();
                            continue;
                        }
                        let result = match command {
                            RoomCommand::StartGame => game.lock().unwrap().start(),
                            RoomCommand::ResetGame => Ok(game.lock().unwrap().reset()),
                            RoomCommand::EndGame => game.lock().unwrap().end_early(),
                        };
                        Self::relay(&broadcaster, name, result);
                    }
                }
            }
        });

        sender
    }

    fn relay(
        broadcaster: &broadcast::Sender<RoomBroadcast>,
        sender_name: Box<str>,
        result: Result<Vec<RoomBroadcast>, IntentError>,
    ) {
        match result {
            Ok(events) => {
                for event in events {
                    broadcaster.send(event).ok();
                }
            }
            Err(reason) => {
                tracing::debug!(player = %sender_name, %reason, "request rejected");
                broadcaster
                    .send(RoomBroadcast::Private {
                        target: sender_name,
                        message: PrivateMessage::Rejected { reason },
                    })
                    .ok();
            }
        }
    }
}

/// Owns every live room. Rooms are created when the first player joins a
/// room id and removed once the last connection leaves.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<Box<str>, RoomSession>>>,
    config: GameConfig,
}

impl RoomRegistry {
    pub fn new(config: GameConfig) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    pub fn room(&self, id: &str) -> Option<RoomSession> {
        self.rooms.lock().unwrap().get(id).cloned()
    }

    /// Joins `handshake` to the room named `id`, opening the room if it does
    /// not exist yet.
    pub fn join(&self, id: &str, handshake: Handshake) -> Result<NewConnection, ConnectionReject> {
        let room = {
            let mut rooms = self.rooms.lock().unwrap();
            match rooms.get(id) {
                Some(room) => room.clone(),
                None => {
                    let room = RoomSession::open(self.config.clone(), rand::random());
                    tracing::info!(room = id, "opened room");
                    rooms.insert(id.into(), room.clone());
                    self.reap_when_empty(id.into(), room.clone());
                    room
                }
            }
        };
        room.connect_player(handshake)
    }

    /// Spawns the task that removes a room from the registry once its last
    /// connection has left.
    fn reap_when_empty(&self, id: Box<str>, room: RoomSession) {
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            loop {
                room.vacancy.notified().await;
                let mut rooms = rooms.lock().unwrap();
                // A join may have raced the vacancy notification.
                if room.is_empty() {
                    rooms.remove(&id);
                    tracing::info!(room = %id, "room closed");
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::game::messages::Phase;

    fn handshake(name: &str, host: bool) -> Handshake {
        Handshake {
            player_name: name.into(),
            spectating: false,
            host,
        }
    }

    async fn wait_for<F>(interface: &mut Interface, mut pred: F) -> RoomBroadcast
    where
        F: FnMut(&RoomBroadcast) -> bool,
    {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), interface.recv())
                .await
                .expect("timed out waiting for a broadcast")
                .expect("room closed unexpectedly");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn full_round_trip_through_a_room() {
        let room = RoomSession::open(GameConfig::default(), 3);
        let mut ada = room.connect_player(handshake("ada", true)).unwrap();
        let mut babbage = room
            .connect_player(handshake("babbage", false))
            .unwrap();
        assert_eq!(room.connection_count(), 2);

        assert!(
            ada.interface
                .send(ClientRequest::Command {
                    command: RoomCommand::StartGame,
                })
                .await
        );

        // Both sides observe the opening snapshot.
        let event = wait_for(&mut ada.interface, |e| {
            matches!(e, RoomBroadcast::Snapshot { .. })
        })
        .await;
        let RoomBroadcast::Snapshot { snapshot } = event else {
            unreachable!()
        };
        assert_eq!(snapshot.phase, Phase::WaitingForRoll);
        wait_for(&mut babbage.interface, |e| {
            matches!(e, RoomBroadcast::Snapshot { .. })
        })
        .await;

        // The current player rolls and everyone sees the dice.
        let current = snapshot.current_player.clone();
        let roller = if &*current == "ada" {
            &ada.interface
        } else {
            &babbage.interface
        };
        assert!(
            roller
                .send(ClientRequest::Intent {
                    intent: PlayerIntent::RollDice,
                })
                .await
        );
        wait_for(&mut babbage.interface, |e| {
            matches!(e, RoomBroadcast::DiceRolled { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn non_host_commands_are_rejected_privately() {
        let room = RoomSession::open(GameConfig::default(), 3);
        let _ada = room.connect_player(handshake("ada", true)).unwrap();
        let mut babbage = room
            .connect_player(handshake("babbage", false))
            .unwrap();

        babbage
            .interface
            .send(ClientRequest::Command {
                command: RoomCommand::StartGame,
            })
            .await;

        let event = wait_for(&mut babbage.interface, |e| {
            matches!(e, RoomBroadcast::Private { .. })
        })
        .await;
        let RoomBroadcast::Private { target, message } = event else {
            unreachable!()
        };
        assert_eq!(&*target, "babbage");
        assert!(matches!(message, PrivateMessage::Rejected { .. }));
    }

    #[tokio::test]
    async fn private_broadcasts_reach_only_their_target() {
        let room = RoomSession::open(GameConfig::default(), 3);
        let mut ada = room.connect_player(handshake("ada", true)).unwrap();
        let mut babbage = room
            .connect_player(handshake("babbage", false))
            .unwrap();

        ada.interface
            .send(ClientRequest::Command {
                command: RoomCommand::StartGame,
            })
            .await;

        // Someone gets a roll prompt; the other player must not see it.
        let snapshot = wait_for(&mut ada.interface, |e| {
            matches!(e, RoomBroadcast::Snapshot { .. })
        })
        .await;
        let RoomBroadcast::Snapshot { snapshot } = snapshot else {
            unreachable!()
        };
        let (mut target, mut other) = if &*snapshot.current_player == "ada" {
            (ada, babbage)
        } else {
            (babbage, ada)
        };

        wait_for(&mut target.interface, |e| {
            matches!(e, RoomBroadcast::Private { .. })
        })
        .await;

        // Flush the other side with a chat marker: if a private event had
        // been queued for it, it would arrive before the chat.
        target
            .interface
            .send(ClientRequest::Chat {
                message: "marker".into(),
            })
            .await;
        let leaked = loop {
            let event = wait_for(&mut other.interface, |e| {
                matches!(e, RoomBroadcast::Private { .. } | RoomBroadcast::Chat { .. })
            })
            .await;
            match event {
                RoomBroadcast::Private { .. } => break true,
                RoomBroadcast::Chat { .. } => break false,
                _ => continue,
            }
        };
        assert!(!leaked);
    }

    #[tokio::test]
    async fn registry_creates_on_first_join_and_reaps_on_last_leave() {
        let registry = RoomRegistry::new(GameConfig::default());
        assert_eq!(registry.room_count(), 0);

        let ada = registry.join("harbor", handshake("ada", true)).unwrap();
        assert_eq!(registry.room_count(), 1);
        let babbage = registry
            .join("harbor", handshake("babbage", false))
            .unwrap();
        assert_eq!(registry.room_count(), 1);

        // Distinct ids get distinct rooms.
        let curie = registry.join("uptown", handshake("curie", true)).unwrap();
        assert_eq!(registry.room_count(), 2);

        ada.interface.close().await;
        babbage.interface.close().await;
        // The reaper runs on its own task; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(registry.room_count(), 1);
        assert!(registry.room("harbor").is_none());
        assert!(registry.room("uptown").is_some());

        curie.interface.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let room = RoomSession::open(GameConfig::default(), 3);
        let _ada = room.connect_player(handshake("ada", true)).unwrap();
        let err = room.connect_player(handshake("ada", false)).unwrap_err();
        assert!(matches!(err, ConnectionReject::NameTaken));
    }
}
