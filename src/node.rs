//! A single Lavalink node.
//!
//! The node owns its [`Transport`] and a router task. The transport's receive loop hands every
//! decoded frame to the router, which updates stats, copies the event to raw taps
//! ([`Node::events`]) and forwards guild events to the player subscribed for that guild.
//!
//! Each subscribed guild has its own relay task between the router and the player, so a
//! player that stops reading only holds up its own guild.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::Stream;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use crate::config::{NodeConfig, ReconnectPolicy};
use crate::error::{ClientError, Result};
use crate::event::NodeEvent;
use crate::http::Http;
use crate::model::{IncomingFrame, LoadResult, NodeStats, Op, Snowflake, TrackHandle};
use crate::transport::{ConnectionState, Transport};

const INBOUND_CAPACITY: usize = 256;
const PLAYER_EVENT_CAPACITY: usize = 64;
const TAP_CAPACITY: usize = 256;

pub struct Node {
    config: NodeConfig,
    transport: Transport,
    http: Http,
    stats: watch::Sender<Option<NodeStats>>,
    players: Mutex<HashMap<Snowflake, mpsc::UnboundedSender<NodeEvent>>>,
    taps: broadcast::Sender<NodeEvent>,
    frames: Mutex<Option<mpsc::Receiver<IncomingFrame>>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        user_id: &str,
        client_name: &str,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let (inbound, frames) = mpsc::channel(INBOUND_CAPACITY);
        let transport = Transport::new(
            config.identifier.clone(),
            config.websocket_url()?,
            &config.password,
            user_id,
            client_name,
            policy,
            inbound,
        )?;
        let http = Http::new(&config.password, config.rest_url()?)?;
        let (stats, _) = watch::channel(None);
        let (taps, _) = broadcast::channel(TAP_CAPACITY);

        Ok(Arc::new(Self {
            config,
            transport,
            http,
            stats,
            players: Mutex::new(HashMap::new()),
            taps,
            frames: Mutex::new(Some(frames)),
        }))
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    /// Latest stats frame, `None` until the node sends one.
    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<Option<NodeStats>> {
        self.stats.subscribe()
    }

    /// Opens the control socket. See [`Transport::connect`].
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.start_router().await;
        self.transport.connect().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn start_router(self: &Arc<Self>) {
        if let Some(frames) = self.frames.lock().await.take() {
            tokio::spawn(route(Arc::downgrade(self), frames));
        }
    }

    /// Sends `op` for `guild_id`. Fails fast with
    /// [`NodeUnavailable`](ClientError::NodeUnavailable) when the node is down for good.
    pub async fn submit(&self, guild_id: &str, op: &Op) -> Result<()> {
        if !self.state().accepts_commands() {
            return Err(ClientError::NodeUnavailable(self.identifier().to_string()));
        }
        self.transport.send(op.to_frame(guild_id)?).await
    }

    /// Every event this node emits from now on. The stream keeps going across reconnects and
    /// ends only when the node is dropped. A consumer that falls behind skips what it missed.
    pub fn events(&self) -> impl Stream<Item = NodeEvent> + Send + 'static {
        futures::stream::unfold(self.taps.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("node event tap lagged, skipped {} events", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Routes this guild's events to the returned receiver, replacing any earlier subscriber.
    pub(crate) async fn subscribe(&self, guild_id: &str) -> mpsc::Receiver<NodeEvent> {
        let (relay, relayed) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(PLAYER_EVENT_CAPACITY);
        tokio::spawn(relay_events(relayed, tx));
        self.players.lock().await.insert(guild_id.to_string(), relay);
        rx
    }

    pub(crate) async fn unsubscribe(&self, guild_id: &str) {
        self.players.lock().await.remove(guild_id);
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.http.load_tracks(identifier).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackHandle> {
        self.http.decode_track(encoded).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackHandle>> {
        self.http.decode_tracks(encoded).await
    }

    async fn dispatch(&self, event: NodeEvent) {
        if let NodeEvent::Stats(stats) = &event {
            self.stats.send_replace(Some(stats.clone()));
        }
        let _ = self.taps.send(event.clone());

        let Some(guild_id) = event.guild_id().map(str::to_string) else {
            return;
        };
        let mut players = self.players.lock().await;
        match players.get(&guild_id) {
            Some(relay) => {
                if relay.send(event).is_err() {
                    players.remove(&guild_id);
                }
            }
            None => debug!(
                "node {}: no player for guild {}, discarding event",
                self.identifier(),
                guild_id
            ),
        }
    }
}

/// Moves one guild's events into its player's bounded queue, in order. Ends when either side
/// goes away.
async fn relay_events(mut relayed: mpsc::UnboundedReceiver<NodeEvent>, tx: mpsc::Sender<NodeEvent>) {
    while let Some(event) = relayed.recv().await {
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn route(node: Weak<Node>, mut frames: mpsc::Receiver<IncomingFrame>) {
    while let Some(frame) = frames.recv().await {
        let Some(node) = node.upgrade() else { break };
        node.dispatch(NodeEvent::from(frame)).await;
    }
}
