use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    extrapolate, LoopMode, PlayOptions, PlayerInfo, PlayerState, Queue, Reply, SessionSnapshot,
    DEFAULT_VOLUME, MAX_VOLUME, MIN_VOLUME,
};
use crate::error::{ClientError, Result};
use crate::event::{EventBus, NodeEvent, PlayerEvent};
use crate::model::filters::Filters;
use crate::model::voice::{VoiceCredentials, VoiceServerUpdate};
use crate::model::{Op, Snowflake, TrackEndReason, TrackHandle};
use crate::node::Node;
use crate::transport::ConnectionState;

/// How long teardown waits on the node or the gateway before giving up on a frame.
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

pub(super) enum Command {
    Join {
        channel_id: Snowflake,
        reply: Reply<()>,
    },
    VoiceState {
        session_id: String,
        channel_id: Option<Snowflake>,
        reply: Reply<()>,
    },
    VoiceServer {
        update: VoiceServerUpdate,
        reply: Reply<()>,
    },
    Play {
        track: Option<TrackHandle>,
        options: PlayOptions,
        reply: Reply<Option<TrackHandle>>,
    },
    Pause {
        paused: bool,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    Skip {
        reply: Reply<Option<TrackHandle>>,
    },
    Seek {
        position_ms: u64,
        reply: Reply<()>,
    },
    Volume {
        volume: i32,
        reply: Reply<u16>,
    },
    Filters {
        filters: Filters,
        merge: bool,
        reply: Reply<()>,
    },
    GetFilters {
        reply: Reply<Filters>,
    },
    Enqueue {
        tracks: Vec<TrackHandle>,
        reply: Reply<usize>,
    },
    GetQueue {
        reply: Reply<Vec<TrackHandle>>,
    },
    Shuffle {
        reply: Reply<()>,
    },
    ClearQueue {
        reply: Reply<usize>,
    },
    Remove {
        index: usize,
        reply: Reply<Option<TrackHandle>>,
    },
    LoopMode {
        mode: LoopMode,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Restore {
        snapshot: SessionSnapshot,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Rebind {
        node: Arc<Node>,
        deadline: Instant,
        reply: Reply<()>,
    },
    FailMigration {
        reply: Reply<()>,
    },
}

/// A `play` waiting for the voice connection.
struct Pending {
    track: TrackHandle,
    options: PlayOptions,
}

/// The actor behind a [`Player`](super::Player).
pub(super) struct Session {
    guild_id: Snowflake,
    node: Arc<Node>,
    events: mpsc::Receiver<NodeEvent>,
    bus: EventBus,
    gateway: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    info: watch::Sender<PlayerInfo>,
    node_state: watch::Receiver<ConnectionState>,
    /// Bound node's socket is up. Position is frozen while it is not.
    node_up: bool,

    state: PlayerState,
    channel_id: Option<Snowflake>,
    session_id: Option<String>,
    server: Option<VoiceServerUpdate>,
    /// Credentials most recently handed to the bound node.
    sent_voice: Option<VoiceCredentials>,
    current: Option<TrackHandle>,
    pending: Option<Pending>,
    position_ms: u64,
    position_at: Instant,
    ping_ms: i64,
    volume: u16,
    filters: Filters,
    queue: Queue,
    /// `REPLACED` track ends still owed by the node for tracks this session replaced.
    replacing: u32,
}

impl Session {
    pub(super) fn new(
        guild_id: Snowflake,
        node: Arc<Node>,
        events: mpsc::Receiver<NodeEvent>,
        bus: EventBus,
        gateway: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<PlayerInfo>) {
        let now = Instant::now();
        let node_state = node.watch_state();
        let node_up = *node_state.borrow() == ConnectionState::Connected;
        let (info, info_rx) = watch::channel(PlayerInfo {
            guild_id: guild_id.clone(),
            node_id: node.identifier().to_string(),
            state: PlayerState::Idle,
            channel_id: None,
            current_track: None,
            position_ms: 0,
            position_at: now,
            volume: DEFAULT_VOLUME,
            loop_mode: LoopMode::Off,
            queue_len: 0,
            ping_ms: -1,
            node_connected: node_up,
        });

        let session = Self {
            guild_id,
            node,
            events,
            bus,
            gateway,
            cancel,
            info,
            node_state,
            node_up,
            state: PlayerState::Idle,
            channel_id: None,
            session_id: None,
            server: None,
            sent_voice: None,
            current: None,
            pending: None,
            position_ms: 0,
            position_at: now,
            ping_ms: -1,
            volume: DEFAULT_VOLUME,
            filters: Filters::default(),
            queue: Queue::new(),
            replacing: 0,
        };
        (session, info_rx)
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("player {} started on node {}", self.guild_id, self.node.identifier());
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    let cancel = self.cancel.clone();
                    let finished = cancellable(&cancel, self.handle(command)).await;
                    self.publish();
                    match finished {
                        Some(false) => {}
                        Some(true) => break,
                        None => {
                            self.teardown().await;
                            break;
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    let cancel = self.cancel.clone();
                    let handled = cancellable(&cancel, self.on_event(event)).await;
                    self.publish();
                    if handled.is_none() {
                        self.teardown().await;
                        break;
                    }
                }
                Ok(()) = self.node_state.changed() => {
                    let up = *self.node_state.borrow_and_update() == ConnectionState::Connected;
                    self.set_node_up(up);
                    self.publish();
                }
            }
        }
        debug!("player {} stopped", self.guild_id);
    }

    /// Returns `true` once the session is gone.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Join { channel_id, reply } => {
                let _ = reply.send(self.join(channel_id).await);
            }
            Command::VoiceState {
                session_id,
                channel_id,
                reply,
            } => {
                let _ = reply.send(self.voice_state(session_id, channel_id).await);
            }
            Command::VoiceServer { update, reply } => {
                let _ = reply.send(self.voice_server(update).await);
            }
            Command::Play {
                track,
                options,
                reply,
            } => {
                let _ = reply.send(self.play(track, options).await);
            }
            Command::Pause { paused, reply } => {
                let _ = reply.send(self.set_paused(paused).await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Command::Skip { reply } => {
                let _ = reply.send(self.skip().await);
            }
            Command::Seek { position_ms, reply } => {
                let _ = reply.send(self.seek(position_ms).await);
            }
            Command::Volume { volume, reply } => {
                let _ = reply.send(self.set_volume(volume).await);
            }
            Command::Filters {
                filters,
                merge,
                reply,
            } => {
                let _ = reply.send(self.set_filters(filters, merge).await);
            }
            Command::GetFilters { reply } => {
                let _ = reply.send(Ok(self.filters.clone()));
            }
            Command::Enqueue { tracks, reply } => {
                let _ = reply.send(self.enqueue(tracks));
            }
            Command::GetQueue { reply } => {
                let _ = reply.send(Ok(self.queue.to_vec()));
            }
            Command::Shuffle { reply } => {
                self.queue.shuffle();
                let _ = reply.send(Ok(()));
            }
            Command::ClearQueue { reply } => {
                let _ = reply.send(Ok(self.queue.clear()));
            }
            Command::Remove { index, reply } => {
                let _ = reply.send(Ok(self.queue.remove(index)));
            }
            Command::LoopMode { mode, reply } => {
                self.queue.set_loop_mode(mode);
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Restore { snapshot, reply } => {
                let _ = reply.send(self.restore(snapshot).await);
            }
            Command::Disconnect { reply } => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
                return true;
            }
            Command::Rebind {
                node,
                deadline,
                reply,
            } => {
                let _ = reply.send(self.rebind(node, deadline).await);
            }
            Command::FailMigration { reply } => {
                self.fail_migration().await;
                let _ = reply.send(Ok(()));
            }
        }
        false
    }

    fn publish(&self) {
        self.info.send_replace(PlayerInfo {
            guild_id: self.guild_id.clone(),
            node_id: self.node.identifier().to_string(),
            state: self.state,
            channel_id: self.channel_id.clone(),
            current_track: self.current.clone(),
            position_ms: self.position_ms,
            position_at: self.position_at,
            volume: self.volume,
            loop_mode: self.queue.loop_mode(),
            queue_len: self.queue.len(),
            ping_ms: self.ping_ms,
            node_connected: self.node_up,
        });
    }

    async fn transition(&mut self, new: PlayerState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!("player {}: {:?} -> {:?}", self.guild_id, old, new);
        self.publish();
        self.bus
            .emit(PlayerEvent::StateChanged {
                guild_id: self.guild_id.clone(),
                old,
                new,
            })
            .await;
    }

    async fn submit(&self, op: Op) -> Result<()> {
        self.node.submit(&self.guild_id, &op).await
    }

    fn position_now(&self) -> u64 {
        extrapolate(
            self.state == PlayerState::Playing && self.node_up,
            self.position_ms,
            self.position_at,
            self.current.as_ref(),
        )
    }

    /// Pins the position while the node is away and resumes extrapolating once it is back.
    fn set_node_up(&mut self, up: bool) {
        if up == self.node_up {
            return;
        }
        if up {
            self.position_at = Instant::now();
        } else {
            let position = self.position_now();
            self.set_position(position);
        }
        self.node_up = up;
    }

    fn set_position(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
        self.position_at = Instant::now();
    }

    fn credentials(&self) -> Option<VoiceCredentials> {
        let session_id = self.session_id.as_ref()?;
        let server = self.server.as_ref()?;
        Some(VoiceCredentials {
            guild_id: self.guild_id.clone(),
            session_id: session_id.clone(),
            token: server.token.clone(),
            endpoint: server.endpoint.clone(),
        })
    }

    async fn send_voice_state(&self, channel_id: Option<&str>) -> Result<()> {
        let Some(gateway) = &self.gateway else {
            return Ok(());
        };
        let payload = json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": channel_id,
                "self_mute": false,
                "self_deaf": false
            }
        });
        gateway
            .send(payload.to_string())
            .await
            .map_err(|e| ClientError::Transport(format!("gateway channel closed: {}", e)))
    }

    async fn join(&mut self, channel_id: Snowflake) -> Result<()> {
        self.send_voice_state(Some(&channel_id)).await?;
        self.channel_id = Some(channel_id);
        if self.state == PlayerState::Idle {
            self.transition(PlayerState::AwaitingVoiceServer).await;
        }
        Ok(())
    }

    async fn voice_state(&mut self, session_id: String, channel_id: Option<Snowflake>) -> Result<()> {
        self.session_id = Some(session_id);
        if channel_id.is_some() {
            self.channel_id = channel_id;
        }
        if self.state == PlayerState::Idle {
            self.transition(PlayerState::AwaitingVoiceServer).await;
        }
        self.connect_voice().await
    }

    async fn voice_server(&mut self, update: VoiceServerUpdate) -> Result<()> {
        self.server = Some(update);
        if self.state == PlayerState::Idle {
            self.transition(PlayerState::AwaitingVoiceServer).await;
        }
        self.connect_voice().await
    }

    /// Hands complete credentials to the node unless it already has these exact ones.
    async fn connect_voice(&mut self) -> Result<()> {
        let Some(credentials) = self.credentials() else {
            return Ok(());
        };
        if self.sent_voice.as_ref() == Some(&credentials) {
            return Ok(());
        }

        self.submit(Op::VoiceUpdate {
            session_id: credentials.session_id.clone(),
            event: credentials.server_update(),
        })
        .await?;
        self.sent_voice = Some(credentials);

        if matches!(self.state, PlayerState::Idle | PlayerState::AwaitingVoiceServer) {
            self.transition(PlayerState::Connecting).await;
        }
        Ok(())
    }

    async fn on_connected(&mut self) {
        match self.pending.take() {
            Some(Pending { track, options }) => {
                if let Err(e) = self.start(track, options).await {
                    warn!("player {}: queued play failed: {}", self.guild_id, e);
                    self.transition(PlayerState::Stopped).await;
                }
            }
            None => self.transition(PlayerState::Stopped).await,
        }
        if !self.filters.is_empty() {
            if let Err(e) = self.submit(Op::Filters(self.filters.clone())).await {
                warn!("player {}: could not apply filters: {}", self.guild_id, e);
            }
        }
    }

    async fn start(&mut self, track: TrackHandle, options: PlayOptions) -> Result<()> {
        self.submit(Op::Play {
            track: track.encoded.clone(),
            start_time: options.start_ms,
            end_time: options.end_ms,
            volume: Some(self.volume),
            no_replace: options.no_replace,
            pause: options.paused,
        })
        .await?;

        if self.current.is_some() {
            self.replacing += 1;
        }
        self.current = Some(track);
        self.set_position(options.start_ms.unwrap_or(0));
        let state = if options.paused {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        };
        self.transition(state).await;
        Ok(())
    }

    async fn play(&mut self, track: Option<TrackHandle>, options: PlayOptions) -> Result<Option<TrackHandle>> {
        match track {
            Some(track) => self.play_track(track, options).await,
            None => {
                let Some(head) = self.queue.pop_front() else {
                    return Ok(None);
                };
                let played = self.play_track(head.clone(), options).await;
                if played.is_err() {
                    self.queue.push_front(head);
                }
                played
            }
        }
    }

    async fn play_track(&mut self, track: TrackHandle, options: PlayOptions) -> Result<Option<TrackHandle>> {
        if track.encoded.trim().is_empty() {
            return Err(ClientError::InvalidTrack);
        }

        match self.state {
            PlayerState::Playing | PlayerState::Paused | PlayerState::Stopped => {
                if options.no_replace && self.current.is_some() {
                    return Ok(None);
                }
                self.start(track.clone(), options).await?;
            }
            PlayerState::Idle | PlayerState::AwaitingVoiceServer | PlayerState::Connecting => {
                if options.no_replace && self.pending.is_some() {
                    return Ok(None);
                }
                self.pending = Some(Pending {
                    track: track.clone(),
                    options,
                });
            }
            PlayerState::Destroyed => return Err(ClientError::PlayerDestroyed),
        }
        Ok(Some(track))
    }

    async fn set_paused(&mut self, paused: bool) -> Result<()> {
        match (self.state, paused) {
            (PlayerState::Playing, true) => {
                self.submit(Op::Pause { pause: true }).await?;
                let position = self.position_now();
                self.set_position(position);
                self.transition(PlayerState::Paused).await;
            }
            (PlayerState::Paused, false) => {
                self.submit(Op::Pause { pause: false }).await?;
                self.position_at = Instant::now();
                self.transition(PlayerState::Playing).await;
            }
            (PlayerState::Idle | PlayerState::AwaitingVoiceServer | PlayerState::Connecting, _) => {
                if let Some(pending) = &mut self.pending {
                    pending.options.paused = paused;
                }
            }
            (PlayerState::Destroyed, _) => return Err(ClientError::PlayerDestroyed),
            _ => {}
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        match self.state {
            PlayerState::Playing | PlayerState::Paused => {
                self.submit(Op::Stop).await?;
                self.current = None;
                self.set_position(0);
                self.transition(PlayerState::Stopped).await;
            }
            PlayerState::Idle | PlayerState::AwaitingVoiceServer | PlayerState::Connecting => {
                self.pending = None;
            }
            PlayerState::Stopped => {}
            PlayerState::Destroyed => return Err(ClientError::PlayerDestroyed),
        }
        Ok(())
    }

    async fn skip(&mut self) -> Result<Option<TrackHandle>> {
        if !self.state.is_connected() {
            let next = self.queue.pop_front();
            self.pending = next.clone().map(|track| Pending {
                track,
                options: PlayOptions::default(),
            });
            return Ok(next);
        }

        match self.queue.next(self.current.clone(), true) {
            Some(next) => {
                self.start(next.clone(), PlayOptions::default()).await?;
                Ok(Some(next))
            }
            None => {
                self.stop().await?;
                Ok(None)
            }
        }
    }

    async fn seek(&mut self, position_ms: u64) -> Result<()> {
        let seekable = self
            .current
            .as_ref()
            .is_some_and(|track| track.is_seekable && !track.is_stream);
        if !seekable || !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(ClientError::NotSeekable);
        }
        self.submit(Op::Seek { position: position_ms }).await?;
        self.set_position(position_ms);
        Ok(())
    }

    async fn set_volume(&mut self, volume: i32) -> Result<u16> {
        let volume = volume.clamp(i32::from(MIN_VOLUME), i32::from(MAX_VOLUME)) as u16;
        if self.state.is_connected() {
            self.submit(Op::Volume { volume }).await?;
        }
        self.volume = volume;
        Ok(volume)
    }

    async fn set_filters(&mut self, filters: Filters, merge: bool) -> Result<()> {
        let next = if merge {
            let mut merged = self.filters.clone();
            merged.merge(&filters);
            merged
        } else {
            filters
        };
        if self.state.is_connected() {
            self.submit(Op::Filters(next.clone())).await?;
        }
        self.filters = next;
        Ok(())
    }

    fn enqueue(&mut self, tracks: Vec<TrackHandle>) -> Result<usize> {
        if tracks.iter().any(|track| track.encoded.trim().is_empty()) {
            return Err(ClientError::InvalidTrack);
        }
        self.queue.extend(tracks);
        Ok(self.queue.len())
    }

    fn snapshot(&self) -> SessionSnapshot {
        let (current_track, paused) = match (&self.current, &self.pending) {
            (Some(track), _) => (Some(track.clone()), self.state == PlayerState::Paused),
            (None, Some(pending)) => (Some(pending.track.clone()), pending.options.paused),
            (None, None) => (None, false),
        };
        let position_ms = match (&self.current, &self.pending) {
            (Some(_), _) => self.position_now(),
            (None, Some(pending)) => pending.options.start_ms.unwrap_or(0),
            (None, None) => 0,
        };

        SessionSnapshot {
            queue: self.queue.to_vec(),
            current_track,
            position_ms,
            volume: self.volume,
            filters: self.filters.clone(),
            loop_mode: self.queue.loop_mode(),
            paused,
        }
    }

    async fn restore(&mut self, snapshot: SessionSnapshot) -> Result<()> {
        self.queue.replace(snapshot.queue);
        self.queue.set_loop_mode(snapshot.loop_mode);
        self.set_volume(i32::from(snapshot.volume)).await?;
        self.set_filters(snapshot.filters, false).await?;

        if let Some(track) = snapshot.current_track {
            let mut options = PlayOptions::default();
            if snapshot.position_ms > 0 {
                options = options.start(snapshot.position_ms);
            }
            if snapshot.paused {
                options = options.paused();
            }
            self.play(Some(track), options).await?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        if self.state == PlayerState::Destroyed {
            return;
        }
        match tokio::time::timeout(TEARDOWN_GRACE, self.submit(Op::Destroy)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("player {}: destroy not delivered: {}", self.guild_id, e),
            Err(_) => debug!("player {}: destroy not queued in time", self.guild_id),
        }
        self.node.unsubscribe(&self.guild_id).await;
        if self.channel_id.take().is_some() {
            match tokio::time::timeout(TEARDOWN_GRACE, self.send_voice_state(None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("player {}: could not leave voice: {}", self.guild_id, e),
                Err(_) => debug!("player {}: gateway did not take the leave in time", self.guild_id),
            }
        }
        self.current = None;
        self.pending = None;
        self.sent_voice = None;
        self.transition(PlayerState::Destroyed).await;
    }

    /// Moves the session to `node`, replaying voice credentials and the current track.
    async fn rebind(&mut self, node: Arc<Node>, deadline: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::PlayerDestroyed);
        }
        let from = self.node.identifier().to_string();
        let to = node.identifier().to_string();
        let position = self.position_now();
        let paused = self.state == PlayerState::Paused;
        let resume = match self.state {
            PlayerState::Playing | PlayerState::Paused => self.current.clone(),
            _ => None,
        };

        if !Arc::ptr_eq(&self.node, &node) {
            self.node.unsubscribe(&self.guild_id).await;
            self.events = node.subscribe(&self.guild_id).await;
            self.node_state = node.watch_state();
            self.node = node;
        }
        let up = *self.node_state.borrow_and_update() == ConnectionState::Connected;
        self.set_node_up(up);
        self.sent_voice = None;
        self.replacing = 0;
        self.publish();

        if let Some(credentials) = self.credentials() {
            self.submit(Op::VoiceUpdate {
                session_id: credentials.session_id.clone(),
                event: credentials.server_update(),
            })
            .await?;
            self.sent_voice = Some(credentials);
        }

        match resume {
            Some(track) => {
                self.submit(Op::Play {
                    track: track.encoded.clone(),
                    start_time: Some(position),
                    end_time: None,
                    volume: Some(self.volume),
                    no_replace: false,
                    pause: paused,
                })
                .await?;
                if !self.filters.is_empty() {
                    self.submit(Op::Filters(self.filters.clone())).await?;
                }
                self.set_position(position);
                self.await_connected(deadline).await?;
            }
            None if self.state.is_connected() => {
                if self.volume != DEFAULT_VOLUME {
                    self.submit(Op::Volume { volume: self.volume }).await?;
                }
                if !self.filters.is_empty() {
                    self.submit(Op::Filters(self.filters.clone())).await?;
                }
            }
            None => {}
        }

        info!("player {} migrated from {} to {}", self.guild_id, from, to);
        self.bus
            .emit(PlayerEvent::Migrated {
                guild_id: self.guild_id.clone(),
                from,
                to,
            })
            .await;
        Ok(())
    }

    /// Feeds node events through until the node reports the voice connection as up.
    async fn await_connected(&mut self, deadline: Instant) -> Result<()> {
        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::PlayerDestroyed),
                event = tokio::time::timeout_at(deadline, self.events.recv()) => event,
            };
            match event {
                Err(_) => return Err(ClientError::MigrationTimeout(self.guild_id.clone())),
                Ok(None) => {
                    return Err(ClientError::NodeUnavailable(self.node.identifier().to_string()))
                }
                Ok(Some(event)) => {
                    let connected = matches!(event, NodeEvent::PlayerUpdate { connected: true, .. });
                    self.on_event(event).await;
                    self.publish();
                    if connected {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// The interrupted track goes back to the head of the queue.
    async fn fail_migration(&mut self) {
        warn!("player {}: migration timed out, stopping", self.guild_id);
        if let Some(track) = self.current.take() {
            if let Err(e) = self.submit(Op::Stop).await {
                debug!("player {}: stop not delivered: {}", self.guild_id, e);
            }
            self.queue.push_front(track);
        }
        if let Some(pending) = self.pending.take() {
            self.queue.push_front(pending.track);
        }
        self.set_position(0);
        self.transition(PlayerState::Stopped).await;
        self.bus
            .emit(PlayerEvent::MigrationTimeout {
                guild_id: self.guild_id.clone(),
            })
            .await;
    }

    async fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Stats(_) => {}
            NodeEvent::PlayerUpdate {
                position_ms,
                connected,
                ping_ms,
                ..
            } => {
                self.set_position(position_ms);
                self.ping_ms = ping_ms;
                if connected && self.state == PlayerState::Connecting {
                    self.on_connected().await;
                }
            }
            NodeEvent::TrackStart { guild_id, track } => {
                let track = match &self.current {
                    Some(current) if current.encoded == track.encoded => current.clone(),
                    _ => track,
                };
                self.bus.emit(PlayerEvent::TrackStart { guild_id, track }).await;
            }
            NodeEvent::TrackEnd {
                guild_id,
                track,
                reason,
            } => {
                let is_current = self
                    .current
                    .as_ref()
                    .is_some_and(|current| current.encoded == track.encoded);
                let track_id = track.encoded.clone();
                self.bus
                    .emit(PlayerEvent::TrackEnd {
                        guild_id,
                        track,
                        reason,
                    })
                    .await;
                let expected = reason == TrackEndReason::Replaced && self.replacing > 0;
                if reason == TrackEndReason::Replaced {
                    self.replacing = self.replacing.saturating_sub(1);
                }
                if !is_current || expected {
                    return;
                }
                if reason.advances_queue() {
                    self.advance().await;
                } else {
                    info!("player {}: track {} ended by the node ({:?})", self.guild_id, track_id, reason);
                    self.current = None;
                    self.set_position(0);
                    self.transition(PlayerState::Stopped).await;
                }
            }
            NodeEvent::TrackException {
                guild_id,
                track,
                error,
            } => {
                warn!(
                    "player {}: track {} failed: {}",
                    self.guild_id,
                    track.encoded,
                    error.message.as_deref().unwrap_or("unknown error")
                );
                self.bus
                    .emit(PlayerEvent::TrackException {
                        guild_id,
                        track,
                        error,
                    })
                    .await;
            }
            NodeEvent::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => {
                self.bus
                    .emit(PlayerEvent::TrackStuck {
                        guild_id,
                        track,
                        threshold_ms,
                    })
                    .await;
            }
            NodeEvent::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            } => {
                info!("player {}: voice socket closed ({}): {}", self.guild_id, code, reason);
                self.bus
                    .emit(PlayerEvent::WebSocketClosed {
                        guild_id,
                        code,
                        reason,
                        by_remote,
                    })
                    .await;
            }
        }
    }

    async fn advance(&mut self) {
        let finished = self.current.take();
        match self.queue.next(finished, false) {
            Some(next) => {
                if let Err(e) = self.start(next, PlayOptions::default()).await {
                    warn!("player {}: could not start next track: {}", self.guild_id, e);
                    self.transition(PlayerState::Stopped).await;
                }
            }
            None => {
                self.set_position(0);
                self.transition(PlayerState::Stopped).await;
                self.bus
                    .emit(PlayerEvent::QueueEnd {
                        guild_id: self.guild_id.clone(),
                    })
                    .await;
            }
        }
    }
}

/// Runs `work` unless `cancel` fires first. `None` means it was cut short.
async fn cancellable<T>(cancel: &CancellationToken, work: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = work => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use serde_json::Value;

    use super::super::testing::wait_for_state;
    use super::super::Player;
    use super::*;
    use crate::node::testing::{mock_node, Remote};

    const GUILD: &str = "42";

    fn track(encoded: &str) -> TrackHandle {
        TrackHandle::from_encoded(encoded)
    }

    fn server_update() -> VoiceServerUpdate {
        VoiceServerUpdate {
            guild_id: GUILD.into(),
            token: "tok".into(),
            endpoint: "eu.discord.media".into(),
        }
    }

    async fn spawn(remote: &Remote, gateway: Option<mpsc::Sender<String>>) -> (Player, mpsc::Receiver<PlayerEvent>) {
        let bus = EventBus::default();
        let events = bus.subscribe(64);
        let player = Player::spawn(GUILD.into(), remote.node.clone(), bus, gateway, Weak::new()).await;
        (player, events)
    }

    async fn connected(remote: &mut Remote) -> (Player, mpsc::Receiver<PlayerEvent>) {
        let (player, events) = spawn(remote, None).await;
        player.voice_state("sess".into(), Some("7".into())).await.unwrap();
        player.voice_server(server_update()).await.unwrap();
        let voice = remote.frame_with_op("voiceUpdate").await;
        assert_eq!(voice["sessionId"], "sess");
        assert_eq!(voice["event"]["token"], "tok");

        remote.player_update(GUILD, 0, true).await;
        wait_for_state(&player, PlayerState::Stopped).await;
        (player, events)
    }

    fn drain(events: &mut mpsc::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn next_matching(
        events: &mut mpsc::Receiver<PlayerEvent>,
        matches: impl Fn(&PlayerEvent) -> bool,
    ) -> PlayerEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event bus closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not emitted within 2s")
    }

    #[tokio::test]
    async fn queued_play_starts_once_voice_connects() {
        let mut remote = mock_node("a").await;
        let (player, _events) = spawn(&remote, None).await;

        player.voice_server(server_update()).await.unwrap();
        assert_eq!(player.state(), PlayerState::AwaitingVoiceServer);
        player.voice_state("sess".into(), Some("7".into())).await.unwrap();
        assert_eq!(player.state(), PlayerState::Connecting);
        remote.frame_with_op("voiceUpdate").await;

        assert_eq!(player.play(track("A"), PlayOptions::default()).await.unwrap(), Some(track("A")));
        assert!(remote.no_frame());

        remote.player_update(GUILD, 0, true).await;
        wait_for_state(&player, PlayerState::Playing).await;
        let play = remote.frame_with_op("play").await;
        assert_eq!(play["track"], "A");
        assert_eq!(play["volume"], 100);
        assert_eq!(player.info().current_track, Some(track("A")));
    }

    #[tokio::test]
    async fn repeated_voice_state_does_not_resend_credentials() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;

        player.voice_state("sess".into(), Some("7".into())).await.unwrap();
        assert!(remote.no_frame());

        player.voice_state("sess2".into(), Some("7".into())).await.unwrap();
        assert_eq!(remote.frame_with_op("voiceUpdate").await["sessionId"], "sess2");
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        remote.frame_with_op("play").await;
        drain(&mut events);

        player.pause().await.unwrap();
        player.pause().await.unwrap();
        assert_eq!(remote.frame().await["pause"], true);
        assert!(remote.no_frame());
        assert_eq!(player.state(), PlayerState::Paused);

        let changes: Vec<PlayerEvent> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::StateChanged { .. }))
            .collect();
        assert_eq!(
            changes,
            vec![PlayerEvent::StateChanged {
                guild_id: GUILD.into(),
                old: PlayerState::Playing,
                new: PlayerState::Paused,
            }]
        );

        player.resume().await.unwrap();
        player.resume().await.unwrap();
        assert_eq!(remote.frame().await["pause"], false);
        assert!(remote.no_frame());
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn volume_is_clamped() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;

        assert_eq!(player.set_volume(-5).await.unwrap(), 0);
        assert_eq!(remote.frame().await["volume"], 0);
        assert_eq!(player.set_volume(5000).await.unwrap(), 1000);
        assert_eq!(remote.frame().await["volume"], 1000);
        assert_eq!(player.info().volume, 1000);

        player.play(track("A"), PlayOptions::default()).await.unwrap();
        assert_eq!(remote.frame_with_op("play").await["volume"], 1000);
    }

    #[tokio::test]
    async fn no_replace_leaves_current_track() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        remote.frame_with_op("play").await;

        let started = player.play(track("B"), PlayOptions::default().no_replace()).await.unwrap();
        assert_eq!(started, None);
        assert!(remote.no_frame());
        assert_eq!(player.info().current_track, Some(track("A")));
    }

    #[tokio::test]
    async fn track_end_reason_decides_whether_queue_advances() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        player.enqueue([track("B"), track("C")]).await.unwrap();
        remote.frame_with_op("play").await;

        remote.track_end(GUILD, "A", "FINISHED").await;
        assert_eq!(remote.frame_with_op("play").await["track"], "B");

        remote.track_end(GUILD, "B", "LOAD_FAILED").await;
        assert_eq!(remote.frame_with_op("play").await["track"], "C");

        remote.track_end(GUILD, "C", "CLEANUP").await;
        next_matching(&mut events, |e| matches!(e, PlayerEvent::QueueEnd { .. })).await;
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(player.info().current_track, None);
    }

    #[tokio::test]
    async fn replaced_track_does_not_advance() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;
        player.enqueue([track("Q")]).await.unwrap();
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        player.play(track("B"), PlayOptions::default()).await.unwrap();
        remote.frame_with_op("play").await;
        remote.frame_with_op("play").await;

        remote.track_end(GUILD, "A", "REPLACED").await;
        next_matching(&mut events, |e| matches!(e, PlayerEvent::TrackEnd { .. })).await;
        assert_eq!(player.info().current_track, Some(track("B")));
        assert_eq!(player.queue().await.unwrap(), vec![track("Q")]);
    }

    #[tokio::test]
    async fn track_stopped_by_the_node_leaves_the_player_stopped() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;
        player.enqueue([track("Q")]).await.unwrap();
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        remote.frame_with_op("play").await;

        remote.track_end(GUILD, "A", "STOPPED").await;
        next_matching(&mut events, |e| matches!(e, PlayerEvent::TrackEnd { .. })).await;
        wait_for_state(&player, PlayerState::Stopped).await;
        assert_eq!(player.info().current_track, None);
        assert_eq!(player.queue().await.unwrap(), vec![track("Q")]);
        assert!(remote.no_frame());
    }

    #[tokio::test]
    async fn replacement_from_elsewhere_stops_but_our_own_does_not() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;

        player.play(track("A"), PlayOptions::default()).await.unwrap();
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        remote.track_end(GUILD, "A", "REPLACED").await;
        next_matching(&mut events, |e| matches!(e, PlayerEvent::TrackEnd { .. })).await;
        assert_eq!(player.state(), PlayerState::Playing);
        assert_eq!(player.info().current_track, Some(track("A")));

        remote.track_end(GUILD, "A", "REPLACED").await;
        next_matching(&mut events, |e| matches!(e, PlayerEvent::TrackEnd { .. })).await;
        wait_for_state(&player, PlayerState::Stopped).await;
        assert_eq!(player.info().current_track, None);
    }

    #[tokio::test]
    async fn failed_play_next_keeps_the_queue_head() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        player.enqueue([track("A"), track("B")]).await.unwrap();

        remote.set_state(ConnectionState::Failed);
        assert!(matches!(player.play_next().await, Err(ClientError::NodeUnavailable(_))));
        assert_eq!(player.queue().await.unwrap(), vec![track("A"), track("B")]);
    }

    #[tokio::test]
    async fn disconnect_cuts_short_a_command_stuck_on_the_node() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        remote.set_state(ConnectionState::Reconnecting);

        // Nobody drains the outbound queue, so the frames past its capacity block.
        for volume in 0..70 {
            let player = player.clone();
            tokio::spawn(async move {
                let _ = player.set_volume(volume).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(3), player.disconnect())
            .await
            .expect("disconnect hung")
            .unwrap();
        assert_eq!(player.state(), PlayerState::Destroyed);
        assert!(matches!(player.pause().await, Err(ClientError::PlayerDestroyed)));
    }

    #[tokio::test]
    async fn seek_needs_a_seekable_current_track() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        assert!(matches!(player.seek(1000).await, Err(ClientError::NotSeekable)));

        let mut live = track("LIVE");
        live.is_stream = true;
        live.is_seekable = false;
        player.play(live, PlayOptions::default()).await.unwrap();
        assert!(matches!(player.seek(1000).await, Err(ClientError::NotSeekable)));

        player.play(track("A"), PlayOptions::default()).await.unwrap();
        player.seek(30_000).await.unwrap();
        assert_eq!(remote.frame_with_op("seek").await["position"], 30_000);
    }

    #[tokio::test]
    async fn empty_tracks_are_rejected() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        assert!(matches!(
            player.play(track(""), PlayOptions::default()).await,
            Err(ClientError::InvalidTrack)
        ));
        assert!(matches!(player.enqueue([track("  ")]).await, Err(ClientError::InvalidTrack)));
        assert_eq!(player.play_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn skip_moves_to_next_even_when_looping_track() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        player.set_loop_mode(LoopMode::Track).await.unwrap();
        player.enqueue([track("B")]).await.unwrap();
        player.play(track("A"), PlayOptions::default()).await.unwrap();
        remote.frame_with_op("play").await;

        assert_eq!(player.skip().await.unwrap(), Some(track("B")));
        assert_eq!(remote.frame_with_op("play").await["track"], "B");

        assert_eq!(player.skip().await.unwrap(), None);
        remote.frame_with_op("stop").await;
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[tokio::test]
    async fn filters_merge_and_reach_the_node() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;

        let mut filters = Filters::default();
        filters.timescale.speed = Some(1.25);
        player.set_filters(filters).await.unwrap();
        let mut more = Filters::default();
        more.volume = Some(0.5);
        player.update_filters(more).await.unwrap();

        remote.frame_with_op("filters").await;
        let frame: Value = remote.frame_with_op("filters").await;
        assert_eq!(frame["timescale"]["speed"], 1.25);
        assert_eq!(frame["volume"], 0.5);
        assert_eq!(player.filters().await.unwrap().timescale.speed, Some(1.25));
    }

    #[tokio::test]
    async fn join_and_disconnect_drive_the_gateway() {
        let mut remote = mock_node("a").await;
        let (gateway, mut outgoing) = mpsc::channel(4);
        let (player, _events) = spawn(&remote, Some(gateway)).await;

        player.join("7").await.unwrap();
        assert_eq!(player.state(), PlayerState::AwaitingVoiceServer);
        let join: Value = serde_json::from_str(&outgoing.recv().await.unwrap()).unwrap();
        assert_eq!(join["op"], 4);
        assert_eq!(join["d"]["guild_id"], GUILD);
        assert_eq!(join["d"]["channel_id"], "7");

        player.disconnect().await.unwrap();
        remote.frame_with_op("destroy").await;
        let leave: Value = serde_json::from_str(&outgoing.recv().await.unwrap()).unwrap();
        assert_eq!(leave["d"]["channel_id"], Value::Null);
        assert_eq!(player.state(), PlayerState::Destroyed);
    }

    #[tokio::test]
    async fn commands_after_disconnect_fail() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        player.disconnect().await.unwrap();
        remote.frame_with_op("destroy").await;

        assert!(matches!(player.pause().await, Err(ClientError::PlayerDestroyed)));
        assert!(matches!(player.queue().await, Err(ClientError::PlayerDestroyed)));
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_restores_into_a_fresh_player() {
        let mut remote = mock_node("a").await;
        let (player, _events) = connected(&mut remote).await;
        player.set_loop_mode(LoopMode::Queue).await.unwrap();
        player.enqueue([track("B"), track("C")]).await.unwrap();
        player.play(track("A"), PlayOptions::default().paused().start(12_000)).await.unwrap();
        let snapshot = player.snapshot().await.unwrap();
        assert_eq!(snapshot.current_track, Some(track("A")));
        assert_eq!(snapshot.position_ms, 12_000);
        assert!(snapshot.paused);
        player.disconnect().await.unwrap();

        let json = serde_json::to_string(&snapshot).unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();

        let mut other = mock_node("b").await;
        let (restored, _events) = spawn(&other, None).await;
        restored.restore(snapshot.clone()).await.unwrap();
        assert_eq!(restored.snapshot().await.unwrap(), snapshot);

        restored.voice_state("sess".into(), None).await.unwrap();
        restored.voice_server(server_update()).await.unwrap();
        other.player_update(GUILD, 0, true).await;
        wait_for_state(&restored, PlayerState::Paused).await;
        let play = other.frame_with_op("play").await;
        assert_eq!(play["track"], "A");
        assert_eq!(play["startTime"], 12_000);
        assert_eq!(play["pause"], true);
        assert_eq!(restored.info().loop_mode, LoopMode::Queue);
    }

    #[tokio::test]
    async fn rebind_without_a_track_completes_immediately() {
        let mut remote = mock_node("a").await;
        let (player, mut events) = connected(&mut remote).await;
        player.set_volume(50).await.unwrap();

        let mut other = mock_node("b").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        player.rebind(other.node.clone(), deadline).await.unwrap();

        assert_eq!(other.frame().await["op"], "voiceUpdate");
        assert_eq!(other.frame().await["volume"], 50);
        assert_eq!(player.node_id(), "b");
        next_matching(&mut events, |e| matches!(e, PlayerEvent::Migrated { .. })).await;

        remote.player_update(GUILD, 1, true).await;
        other.player_update(GUILD, 2, true).await;
        let mut info = player.watch();
        tokio::time::timeout(Duration::from_secs(2), info.wait_for(|i| i.position_ms == 2))
            .await
            .unwrap()
            .unwrap();
    }
}
