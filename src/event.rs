use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::client::Context;
use crate::model::{
    IncomingFrame, NodeStats, ServerEvent, Snowflake, TrackError, TrackEndReason, TrackHandle,
    TrackRef,
};
use crate::player::PlayerState;

/// What a node reports, decoded and in the order the node sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Stats(NodeStats),
    PlayerUpdate {
        guild_id: Snowflake,
        position_ms: u64,
        connected: bool,
        ping_ms: i64,
    },
    TrackStart {
        guild_id: Snowflake,
        track: TrackHandle,
    },
    TrackEnd {
        guild_id: Snowflake,
        track: TrackHandle,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: Snowflake,
        track: TrackHandle,
        error: TrackError,
    },
    TrackStuck {
        guild_id: Snowflake,
        track: TrackHandle,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: Snowflake,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

impl NodeEvent {
    /// `None` for node-wide events.
    pub fn guild_id(&self) -> Option<&str> {
        match self {
            NodeEvent::Stats(_) => None,
            NodeEvent::PlayerUpdate { guild_id, .. }
            | NodeEvent::TrackStart { guild_id, .. }
            | NodeEvent::TrackEnd { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. }
            | NodeEvent::TrackStuck { guild_id, .. }
            | NodeEvent::WebSocketClosed { guild_id, .. } => Some(guild_id),
        }
    }
}

fn handle(track: TrackRef) -> TrackHandle {
    match track {
        TrackRef::Encoded(encoded) => TrackHandle::from_encoded(encoded),
        TrackRef::Full(track) => track,
    }
}

impl From<IncomingFrame> for NodeEvent {
    fn from(frame: IncomingFrame) -> Self {
        match frame {
            IncomingFrame::Stats(stats) => NodeEvent::Stats(stats),
            IncomingFrame::PlayerUpdate(update) => NodeEvent::PlayerUpdate {
                guild_id: update.guild_id,
                position_ms: update.state.position,
                connected: update.state.connected,
                ping_ms: update.state.ping,
            },
            IncomingFrame::Event(event) => match event {
                ServerEvent::TrackStart { guild_id, track } => NodeEvent::TrackStart {
                    guild_id,
                    track: handle(track),
                },
                ServerEvent::TrackEnd {
                    guild_id,
                    track,
                    reason,
                } => NodeEvent::TrackEnd {
                    guild_id,
                    track: handle(track),
                    reason,
                },
                ServerEvent::TrackException {
                    guild_id,
                    track,
                    exception,
                } => NodeEvent::TrackException {
                    guild_id,
                    track: handle(track),
                    error: exception,
                },
                ServerEvent::TrackStuck {
                    guild_id,
                    track,
                    threshold_ms,
                } => NodeEvent::TrackStuck {
                    guild_id,
                    track: handle(track),
                    threshold_ms,
                },
                ServerEvent::WebSocketClosed {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                } => NodeEvent::WebSocketClosed {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                },
            },
        }
    }
}

/// What players report back to the bot.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged {
        guild_id: Snowflake,
        old: PlayerState,
        new: PlayerState,
    },
    TrackStart {
        guild_id: Snowflake,
        track: TrackHandle,
    },
    TrackEnd {
        guild_id: Snowflake,
        track: TrackHandle,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: Snowflake,
        track: TrackHandle,
        error: TrackError,
    },
    TrackStuck {
        guild_id: Snowflake,
        track: TrackHandle,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: Snowflake,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    /// The last track ended and nothing was queued after it.
    QueueEnd { guild_id: Snowflake },
    Migrated {
        guild_id: Snowflake,
        from: String,
        to: String,
    },
    /// Failover ran out of time; the player is `Stopped` but keeps its queue.
    MigrationTimeout { guild_id: Snowflake },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            PlayerEvent::StateChanged { guild_id, .. }
            | PlayerEvent::TrackStart { guild_id, .. }
            | PlayerEvent::TrackEnd { guild_id, .. }
            | PlayerEvent::TrackException { guild_id, .. }
            | PlayerEvent::TrackStuck { guild_id, .. }
            | PlayerEvent::WebSocketClosed { guild_id, .. }
            | PlayerEvent::QueueEnd { guild_id }
            | PlayerEvent::Migrated { guild_id, .. }
            | PlayerEvent::MigrationTimeout { guild_id } => guild_id,
        }
    }
}

/// Callback-style alternative to [`Client::subscribe`](crate::client::Client::subscribe).
/// Every method defaults to doing nothing.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_state_change(&self, ctx: Context, guild_id: Snowflake, old: PlayerState, new: PlayerState) {
        let _ = (ctx, guild_id, old, new);
    }

    async fn on_track_start(&self, ctx: Context, guild_id: Snowflake, track: TrackHandle) {
        let _ = (ctx, guild_id, track);
    }

    async fn on_track_end(
        &self,
        ctx: Context,
        guild_id: Snowflake,
        track: TrackHandle,
        reason: TrackEndReason,
    ) {
        let _ = (ctx, guild_id, track, reason);
    }

    async fn on_track_exception(
        &self,
        ctx: Context,
        guild_id: Snowflake,
        track: TrackHandle,
        error: TrackError,
    ) {
        let _ = (ctx, guild_id, track, error);
    }

    async fn on_track_stuck(&self, ctx: Context, guild_id: Snowflake, track: TrackHandle, threshold_ms: u64) {
        let _ = (ctx, guild_id, track, threshold_ms);
    }

    async fn on_websocket_closed(
        &self,
        ctx: Context,
        guild_id: Snowflake,
        code: u16,
        reason: String,
        by_remote: bool,
    ) {
        let _ = (ctx, guild_id, code, reason, by_remote);
    }

    async fn on_queue_end(&self, ctx: Context, guild_id: Snowflake) {
        let _ = (ctx, guild_id);
    }

    async fn on_migrated(&self, ctx: Context, guild_id: Snowflake, from: String, to: String) {
        let _ = (ctx, guild_id, from, to);
    }

    async fn on_migration_timeout(&self, ctx: Context, guild_id: Snowflake) {
        let _ = (ctx, guild_id);
    }
}

/// Feeds a subscription into a handler until the subscription closes.
pub(crate) async fn drive(
    handler: Arc<dyn EventHandler>,
    ctx: Context,
    mut events: mpsc::Receiver<PlayerEvent>,
) {
    while let Some(event) = events.recv().await {
        let ctx = ctx.clone();
        match event {
            PlayerEvent::StateChanged { guild_id, old, new } => {
                handler.on_state_change(ctx, guild_id, old, new).await
            }
            PlayerEvent::TrackStart { guild_id, track } => {
                handler.on_track_start(ctx, guild_id, track).await
            }
            PlayerEvent::TrackEnd {
                guild_id,
                track,
                reason,
            } => handler.on_track_end(ctx, guild_id, track, reason).await,
            PlayerEvent::TrackException {
                guild_id,
                track,
                error,
            } => handler.on_track_exception(ctx, guild_id, track, error).await,
            PlayerEvent::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => handler.on_track_stuck(ctx, guild_id, track, threshold_ms).await,
            PlayerEvent::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            } => {
                handler
                    .on_websocket_closed(ctx, guild_id, code, reason, by_remote)
                    .await
            }
            PlayerEvent::QueueEnd { guild_id } => handler.on_queue_end(ctx, guild_id).await,
            PlayerEvent::Migrated { guild_id, from, to } => {
                handler.on_migrated(ctx, guild_id, from, to).await
            }
            PlayerEvent::MigrationTimeout { guild_id } => {
                handler.on_migration_timeout(ctx, guild_id).await
            }
        }
    }
}

/// Fan-out of player events to every subscriber.
///
/// Each subscriber has its own bounded queue. A full queue makes the emitting player wait
/// rather than lose a lifecycle event.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<PlayerEvent>>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, capacity: usize) -> mpsc::Receiver<PlayerEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) async fn emit(&self, event: PlayerEvent) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut closed = false;
        for subscriber in subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            debug!("pruning closed event subscribers");
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| !tx.is_closed());
        }
    }

    /// Drops every subscriber; their receivers see the end of the stream.
    pub(crate) fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
