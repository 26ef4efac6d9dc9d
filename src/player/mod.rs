//! Per-guild players.
//!
//! A [`Player`] is a cheap handle to an actor task. The task owns the state machine, the
//! queue and the node binding, and handles commands and node events one at a time, so
//! nothing about a guild's session is ever touched from two places at once.
//!
//! ```text
//! Idle -> AwaitingVoiceServer -> Connecting -> Playing <-> Paused
//!                                    |            \        /
//!                                    +---------> Stopped <-
//! (any) -> Destroyed
//! ```

pub mod queue;
mod session;

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::event::EventBus;
use crate::model::filters::Filters;
use crate::model::voice::VoiceServerUpdate;
use crate::model::{Snowflake, TrackHandle};
use crate::node::Node;
use crate::registry::SessionRegistry;

pub use self::queue::{LoopMode, Queue};
use self::session::{Command, Session};

const COMMAND_CAPACITY: usize = 32;

pub const MIN_VOLUME: u16 = 0;
pub const MAX_VOLUME: u16 = 1000;
pub const DEFAULT_VOLUME: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    Idle,
    AwaitingVoiceServer,
    Connecting,
    Playing,
    Paused,
    Stopped,
    Destroyed,
}

impl PlayerState {
    /// States in which the node holds a live voice session for the guild.
    pub fn is_connected(self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Paused | PlayerState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayOptions {
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    /// Leave the current track alone if there is one.
    pub no_replace: bool,
    /// Load the track paused.
    pub paused: bool,
}

impl PlayOptions {
    pub fn start(mut self, ms: u64) -> Self {
        self.start_ms = Some(ms);
        self
    }

    pub fn end(mut self, ms: u64) -> Self {
        self.end_ms = Some(ms);
        self
    }

    pub fn no_replace(mut self) -> Self {
        self.no_replace = true;
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }
}

/// Read-only view of a player, refreshed by the actor after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub guild_id: Snowflake,
    pub node_id: String,
    pub state: PlayerState,
    pub channel_id: Option<Snowflake>,
    pub current_track: Option<TrackHandle>,
    pub position_ms: u64,
    /// When `position_ms` was last reported.
    pub position_at: Instant,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub queue_len: usize,
    pub ping_ms: i64,
    /// Whether the bound node's control socket is up. Position stops advancing while it is not.
    pub node_connected: bool,
}

impl PlayerInfo {
    /// `position_ms` advanced by the time spent playing since it was reported.
    pub fn position_now(&self) -> u64 {
        extrapolate(
            self.state == PlayerState::Playing && self.node_connected,
            self.position_ms,
            self.position_at,
            self.current_track.as_ref(),
        )
    }
}

fn extrapolate(advancing: bool, position_ms: u64, since: Instant, track: Option<&TrackHandle>) -> u64 {
    if !advancing {
        return position_ms;
    }
    let position = position_ms.saturating_add(since.elapsed().as_millis() as u64);
    match track {
        Some(track) if !track.is_stream && track.duration_ms > 0 => position.min(track.duration_ms),
        _ => position,
    }
}

/// Everything needed to rebuild a session elsewhere. Serializable, so a bot can persist
/// it across restarts and hand it to [`Player::restore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub queue: Vec<TrackHandle>,
    pub current_track: Option<TrackHandle>,
    pub position_ms: u64,
    pub volume: u16,
    pub filters: Filters,
    pub loop_mode: LoopMode,
    pub paused: bool,
}

struct Shared {
    guild_id: Snowflake,
    commands: mpsc::Sender<Command>,
    info: watch::Receiver<PlayerInfo>,
    cancel: CancellationToken,
    migration: Mutex<()>,
    registry: Weak<SessionRegistry>,
}

#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.shared.guild_id)
            .field("state", &self.state())
            .finish()
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

impl Player {
    pub(crate) async fn spawn(
        guild_id: Snowflake,
        node: Arc<Node>,
        bus: EventBus,
        gateway: Option<mpsc::Sender<String>>,
        registry: Weak<SessionRegistry>,
    ) -> Player {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancellationToken::new();
        let events = node.subscribe(&guild_id).await;
        let (session, info) = Session::new(guild_id.clone(), node, events, bus, gateway, cancel.clone());
        tokio::spawn(session.run(commands_rx));

        Player {
            shared: Arc::new(Shared {
                guild_id,
                commands,
                info,
                cancel,
                migration: Mutex::new(()),
                registry,
            }),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.shared.guild_id
    }

    pub fn info(&self) -> PlayerInfo {
        self.shared.info.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PlayerInfo> {
        self.shared.info.clone()
    }

    pub fn state(&self) -> PlayerState {
        self.shared.info.borrow().state
    }

    pub fn node_id(&self) -> String {
        self.shared.info.borrow().node_id.clone()
    }

    pub(crate) fn same_as(&self, other: &Player) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.shared
            .commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::PlayerDestroyed)?;
        response.await.map_err(|_| ClientError::PlayerDestroyed)?
    }

    /// Like `request`, but waits for any migration in flight to finish first.
    async fn command<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let _migration = self.shared.migration.lock().await;
        self.request(build).await
    }

    /// Marks the player as joining `channel_id`. If the client was built with a gateway
    /// sender, the voice state update is sent through it; otherwise the bot sends it itself.
    pub async fn join(&self, channel_id: impl Into<Snowflake>) -> Result<()> {
        let channel_id = channel_id.into();
        self.command(|reply| Command::Join { channel_id, reply }).await
    }

    pub(crate) async fn voice_state(&self, session_id: String, channel_id: Option<Snowflake>) -> Result<()> {
        self.command(|reply| Command::VoiceState {
            session_id,
            channel_id,
            reply,
        })
        .await
    }

    pub(crate) async fn voice_server(&self, update: VoiceServerUpdate) -> Result<()> {
        self.command(|reply| Command::VoiceServer { update, reply }).await
    }

    /// Plays `track`, or queues it until the voice connection is up. Returns the track that
    /// was started, or `None` when `no_replace` left the current one playing.
    pub async fn play(&self, track: TrackHandle, options: PlayOptions) -> Result<Option<TrackHandle>> {
        self.command(|reply| Command::Play {
            track: Some(track),
            options,
            reply,
        })
        .await
    }

    /// Plays the head of the queue. `None` if the queue is empty.
    pub async fn play_next(&self) -> Result<Option<TrackHandle>> {
        self.command(|reply| Command::Play {
            track: None,
            options: PlayOptions::default(),
            reply,
        })
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await
    }

    /// No-op when the player is already in the requested state.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.command(|reply| Command::Pause { paused, reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(|reply| Command::Stop { reply }).await
    }

    /// Moves to the next queued track, ignoring [`LoopMode::Track`].
    pub async fn skip(&self) -> Result<Option<TrackHandle>> {
        self.command(|reply| Command::Skip { reply }).await
    }

    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.command(|reply| Command::Seek { position_ms, reply }).await
    }

    /// Clamps to `0..=1000` and returns the volume actually applied.
    pub async fn set_volume(&self, volume: i32) -> Result<u16> {
        self.command(|reply| Command::Volume { volume, reply }).await
    }

    /// Replaces the whole filter chain.
    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        self.command(|reply| Command::Filters {
            filters,
            merge: false,
            reply,
        })
        .await
    }

    /// Applies only what `filters` sets, keeping the rest. See [`Filters::merge`].
    pub async fn update_filters(&self, filters: Filters) -> Result<()> {
        self.command(|reply| Command::Filters {
            filters,
            merge: true,
            reply,
        })
        .await
    }

    pub async fn filters(&self) -> Result<Filters> {
        self.command(|reply| Command::GetFilters { reply }).await
    }

    pub async fn enqueue(&self, tracks: impl IntoIterator<Item = TrackHandle>) -> Result<usize> {
        let tracks: Vec<TrackHandle> = tracks.into_iter().collect();
        self.command(|reply| Command::Enqueue { tracks, reply }).await
    }

    pub async fn queue(&self) -> Result<Vec<TrackHandle>> {
        self.command(|reply| Command::GetQueue { reply }).await
    }

    pub async fn shuffle(&self) -> Result<()> {
        self.command(|reply| Command::Shuffle { reply }).await
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        self.command(|reply| Command::ClearQueue { reply }).await
    }

    pub async fn remove(&self, index: usize) -> Result<Option<TrackHandle>> {
        self.command(|reply| Command::Remove { index, reply }).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.command(|reply| Command::LoopMode { mode, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.command(|reply| Command::Snapshot { reply }).await
    }

    /// Loads queue, loop mode, volume and filters from `snapshot` and resumes its current
    /// track at the saved position (queued until connected, if need be).
    pub async fn restore(&self, snapshot: SessionSnapshot) -> Result<()> {
        self.command(|reply| Command::Restore { snapshot, reply }).await
    }

    /// Tears the session down and removes the player from its registry. Cancels any
    /// migration in flight. Every later command fails with
    /// [`PlayerDestroyed`](ClientError::PlayerDestroyed).
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.shutdown().await;
        if let Some(registry) = self.shared.registry.upgrade() {
            registry.forget(self).await;
        }
        result
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.shared.cancel.cancel();
        match self.request(|reply| Command::Disconnect { reply }).await {
            Err(ClientError::PlayerDestroyed) => Ok(()),
            other => other,
        }
    }

    /// Held for the whole of a migration so two never overlap.
    pub(crate) async fn lock_migration(&self) -> MutexGuard<'_, ()> {
        self.shared.migration.lock().await
    }

    pub(crate) async fn rebind(&self, node: Arc<Node>, deadline: Instant) -> Result<()> {
        self.request(|reply| Command::Rebind {
            node,
            deadline,
            reply,
        })
        .await
    }

    pub(crate) async fn fail_migration(&self) -> Result<()> {
        self.request(|reply| Command::FailMigration { reply }).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;

    pub(crate) async fn wait_for_state(player: &Player, state: PlayerState) {
        let mut info = player.watch();
        tokio::time::timeout(Duration::from_secs(2), info.wait_for(|i| i.state == state))
            .await
            .unwrap_or_else(|_| panic!("player never reached {:?}, is {:?}", state, player.state()))
            .unwrap();
    }
}
