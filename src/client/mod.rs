use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Balance, NodeConfig, ReconnectPolicy};
use crate::error::{ClientError, Result};
use crate::event::{self, EventBus, EventHandler, PlayerEvent};
use crate::model::voice::{VoiceServerUpdate, VoiceStateUpdate};
use crate::model::{LoadResult, Snowflake, TrackHandle};
use crate::node::Node;
use crate::player::Player;
use crate::pool::NodePool;
use crate::registry::SessionRegistry;

const DEFAULT_CLIENT_NAME: &str = concat!("lavamase/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Handed to every [`EventHandler`] callback.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
}

impl Context {
    pub async fn player(&self, guild_id: &str) -> Option<Player> {
        self.client.get_player(guild_id).await
    }
}

pub struct ClientBuilder {
    user_id: Snowflake,
    client_name: String,
    nodes: Vec<NodeConfig>,
    reconnect: ReconnectPolicy,
    balance: Balance,
    migration_timeout: Duration,
    event_buffer: usize,
    handler: Option<Arc<dyn EventHandler>>,
    gateway: Option<mpsc::Sender<String>>,
}

impl ClientBuilder {
    pub fn new(user_id: impl Into<Snowflake>) -> Self {
        Self {
            user_id: user_id.into(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            nodes: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            balance: Balance::default(),
            migration_timeout: DEFAULT_MIGRATION_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            handler: None,
            gateway: None,
        }
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = NodeConfig>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Backoff for every node's control socket. Failover only starts once a node has spent
    /// `max_retries`; with `max_retries: None` a dead node keeps its players forever.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    /// How long failover may take per player before giving up. Defaults to 10 seconds.
    pub fn migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }

    /// Capacity of each event subscription. A subscriber that falls this far behind makes
    /// players wait for it.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Where players send raw voice state updates (gateway op 4) when they join or leave.
    /// Without it, the bot is expected to send those itself.
    pub fn gateway(mut self, gateway_tx: mpsc::Sender<String>) -> Self {
        self.gateway = Some(gateway_tx);
        self
    }

    pub fn build(self) -> Result<Client> {
        if self.nodes.is_empty() {
            return Err(ClientError::Config("no nodes configured".into()));
        }
        // Fails harmlessly when the application already installed a provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let nodes = self
            .nodes
            .into_iter()
            .map(|config| Node::new(config, &self.user_id, &self.client_name, self.reconnect))
            .collect::<Result<Vec<_>>>()?;
        let pool = Arc::new(NodePool::new(nodes, self.balance)?);

        Ok(Client {
            inner: Arc::new(ClientInner {
                user_id: self.user_id,
                pool,
                registry: Arc::new(SessionRegistry::new()),
                bus: EventBus::default(),
                gateway: self.gateway,
                handler: self.handler,
                event_buffer: self.event_buffer,
                migration_timeout: self.migration_timeout,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct ClientInner {
    user_id: Snowflake,
    pool: Arc<NodePool>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    gateway: Option<mpsc::Sender<String>>,
    handler: Option<Arc<dyn EventHandler>>,
    event_buffer: usize,
    migration_timeout: Duration,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Entry point: owns the node pool and every guild's player.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(user_id: impl Into<Snowflake>) -> ClientBuilder {
        ClientBuilder::new(user_id)
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Connects every node. Succeeds if at least one node is up; the others keep retrying
    /// in the background.
    pub async fn connect(&self) -> Result<()> {
        let nodes = self.inner.pool.nodes();
        let results = join_all(nodes.iter().map(|node| node.connect())).await;

        let mut connected = 0;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!("node {} connected", node.identifier());
                    connected += 1;
                }
                Err(e) => warn!("node {} did not connect, retrying: {}", node.identifier(), e),
            }
        }

        self.start_background();
        if connected == 0 {
            return Err(ClientError::NoAvailableNode);
        }
        Ok(())
    }

    fn start_background(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self
            .inner
            .pool
            .spawn_failover(&self.inner.registry, self.inner.migration_timeout);

        if let Some(handler) = &self.inner.handler {
            let events = self.inner.bus.subscribe(self.inner.event_buffer);
            let ctx = Context {
                client: self.clone(),
            };
            tasks.push(tokio::spawn(event::drive(Arc::clone(handler), ctx, events)));
        }

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        self.inner.pool.nodes()
    }

    pub fn node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.inner.pool.get(identifier)
    }

    pub async fn get_player(&self, guild_id: &str) -> Option<Player> {
        self.inner.registry.get(guild_id).await
    }

    pub async fn players(&self) -> Vec<Player> {
        self.inner.registry.players().await
    }

    /// Returns the guild's player, creating it on the best node if needed. `hint` names a
    /// node identifier or region to prefer when that node is connected.
    pub async fn create_player(&self, guild_id: &str, hint: Option<&str>) -> Result<Player> {
        let inner = &self.inner;
        inner
            .registry
            .get_or_create(guild_id, move || async move {
                let node = inner.pool.select(hint, None)?;
                debug!("guild {} assigned to node {}", guild_id, node.identifier());
                Ok(Player::spawn(
                    guild_id.to_string(),
                    node,
                    inner.bus.clone(),
                    inner.gateway.clone(),
                    Arc::downgrade(&inner.registry),
                )
                .await)
            })
            .await
    }

    /// Tears down the guild's session. `false` if it had none.
    pub async fn destroy_player(&self, guild_id: &str) -> Result<bool> {
        self.inner.registry.destroy(guild_id).await
    }

    /// Feed the gateway's `VOICE_SERVER_UPDATE` here.
    pub async fn voice_server_update(&self, update: VoiceServerUpdate) -> Result<()> {
        let player = self.create_player(&update.guild_id, None).await?;
        player.voice_server(update).await
    }

    /// Feed the gateway's `VOICE_STATE_UPDATE` here. Updates about other users are ignored;
    /// the bot leaving voice destroys the guild's player.
    pub async fn voice_state_update(&self, update: VoiceStateUpdate) -> Result<()> {
        if update
            .user_id
            .as_deref()
            .is_some_and(|user_id| user_id != self.inner.user_id)
        {
            return Ok(());
        }
        if update.channel_id.is_none() {
            self.destroy_player(&update.guild_id).await?;
            return Ok(());
        }

        let player = self.create_player(&update.guild_id, None).await?;
        player.voice_state(update.session_id, update.channel_id).await
    }

    /// Every player event from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<PlayerEvent> {
        self.inner.bus.subscribe(self.inner.event_buffer)
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.inner.pool.select(None, None)?.load_tracks(identifier).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackHandle> {
        self.inner.pool.select(None, None)?.decode_track(encoded).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackHandle>> {
        self.inner.pool.select(None, None)?.decode_tracks(encoded).await
    }

    /// Destroys every player, closes every node and ends all event subscriptions.
    pub async fn shutdown(&self) {
        self.inner.registry.destroy_all().await;
        join_all(self.inner.pool.nodes().iter().map(|node| node.close())).await;
        self.inner.bus.close();

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner.started.store(false, Ordering::SeqCst);
        info!("client shut down");
    }
}
