//! The configured nodes, load-balanced selection and failover.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Balance;
use crate::error::{ClientError, Result};
use crate::node::Node;
use crate::player::{Player, PlayerState};
use crate::registry::SessionRegistry;
use crate::transport::ConnectionState;

/// How long a migration waits before asking the pool for a replacement node again.
const RESELECT_INTERVAL: Duration = Duration::from_millis(250);
const MIB: f64 = 1024.0 * 1024.0;

pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    balance: Balance,
    cursor: AtomicUsize,
}

impl NodePool {
    pub fn new(nodes: Vec<Arc<Node>>, balance: Balance) -> Result<Self> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.identifier()) {
                return Err(ClientError::Config(format!(
                    "duplicate node identifier {}",
                    node.identifier()
                )));
            }
        }
        Ok(Self {
            nodes,
            balance,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|node| node.identifier() == identifier)
            .cloned()
    }

    pub fn balance(&self) -> Balance {
        self.balance
    }

    /// Picks a connected node. `hint` (an identifier or region) wins when it names a connected
    /// node; `exclude` is never picked.
    pub fn select(&self, hint: Option<&str>, exclude: Option<&str>) -> Result<Arc<Node>> {
        let candidates: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|node| node.state() == ConnectionState::Connected)
            .filter(|node| Some(node.identifier()) != exclude)
            .collect();
        if candidates.is_empty() {
            return Err(ClientError::NoAvailableNode);
        }

        if let Some(hint) = hint {
            if let Some(node) = candidates.iter().find(|node| node.config().matches_hint(hint)) {
                return Ok(Arc::clone(*node));
            }
            debug!("no connected node matches hint {}, balancing instead", hint);
        }

        let chosen = match self.balance {
            Balance::RoundRobin => None,
            Balance::LeastPlaying => least_playing(&candidates),
            Balance::Weighted {
                players,
                cpu,
                memory,
            } => lowest_score(&candidates, |stats| {
                players * f64::from(stats.playing_players)
                    + cpu * stats.cpu_load()
                    + memory * stats.memory_used() as f64 / MIB
            }),
        };
        let node = chosen.unwrap_or_else(|| self.round_robin(&candidates));
        Ok(Arc::clone(node))
    }

    fn round_robin<'a>(&self, candidates: &[&'a Arc<Node>]) -> &'a Arc<Node> {
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        candidates[turn % candidates.len()]
    }

    /// Watches every node. Players on a node that fails for good are migrated away; players
    /// left on a failed node after a timed-out migration move to the next node that connects.
    pub(crate) fn spawn_failover(
        self: &Arc<Self>,
        registry: &Arc<SessionRegistry>,
        timeout: Duration,
    ) -> Vec<JoinHandle<()>> {
        self.nodes
            .iter()
            .map(|node| {
                let mut state = node.watch_state();
                let failed = node.identifier().to_string();
                let pool = Arc::downgrade(self);
                let registry = Arc::downgrade(registry);
                tokio::spawn(async move {
                    while state.changed().await.is_ok() {
                        let now = *state.borrow_and_update();
                        if !matches!(now, ConnectionState::Failed | ConnectionState::Connected) {
                            continue;
                        }
                        let (Some(pool), Some(registry)) = (pool.upgrade(), registry.upgrade()) else {
                            break;
                        };
                        if now == ConnectionState::Failed {
                            pool.fail_over(&registry, &failed, timeout).await;
                        } else {
                            pool.rescue(&registry, timeout).await;
                        }
                    }
                })
            })
            .collect()
    }

    async fn fail_over(&self, registry: &SessionRegistry, failed: &str, timeout: Duration) {
        let players: Vec<Player> = registry
            .players()
            .await
            .into_iter()
            .filter(|player| player.node_id() == failed)
            .collect();
        if players.is_empty() {
            return;
        }

        warn!("node {} failed, migrating {} players", failed, players.len());
        let results = join_all(players.iter().map(|player| self.migrate(player, failed, timeout))).await;
        for (player, result) in players.iter().zip(results) {
            if let Err(e) = result {
                warn!("guild {}: {}", player.guild_id(), e);
            }
        }
    }

    /// Retries migration for players still bound to a failed node.
    async fn rescue(&self, registry: &SessionRegistry, timeout: Duration) {
        let stranded: Vec<(Player, String)> = registry
            .players()
            .await
            .into_iter()
            .filter(|player| player.state() != PlayerState::Destroyed)
            .filter_map(|player| {
                let node_id = player.node_id();
                let node = self.get(&node_id)?;
                (node.state() == ConnectionState::Failed).then_some((player, node_id))
            })
            .collect();
        if stranded.is_empty() {
            return;
        }

        info!("rebinding {} players left on failed nodes", stranded.len());
        let results = join_all(
            stranded
                .iter()
                .map(|(player, failed)| self.migrate(player, failed, timeout)),
        )
        .await;
        for ((player, _), result) in stranded.iter().zip(results) {
            if let Err(e) = result {
                warn!("guild {}: {}", player.guild_id(), e);
            }
        }
    }

    /// Moves `player` off `failed`, retrying node selection until `timeout` runs out. On
    /// timeout the player is stopped and [`MigrationTimeout`](ClientError::MigrationTimeout)
    /// is returned.
    pub(crate) async fn migrate(&self, player: &Player, failed: &str, timeout: Duration) -> Result<()> {
        let _migrating = player.lock_migration().await;
        if player.node_id() != failed {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if player.state() == PlayerState::Destroyed {
                return Err(ClientError::PlayerDestroyed);
            }
            match self.select(None, Some(failed)) {
                Ok(node) => {
                    let target = node.identifier().to_string();
                    match player.rebind(node, deadline).await {
                        Ok(()) => return Ok(()),
                        Err(ClientError::MigrationTimeout(_)) => break,
                        Err(ClientError::NodeUnavailable(_)) => {
                            debug!("guild {}: {} went away mid-migration", player.guild_id(), target)
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(ClientError::NoAvailableNode) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until((now + RESELECT_INTERVAL).min(deadline)).await;
        }

        info!("guild {}: no node took over in {:?}", player.guild_id(), timeout);
        player.fail_migration().await?;
        Err(ClientError::MigrationTimeout(player.guild_id().to_string()))
    }
}

/// Nodes with stats first: fewest playing players, then lowest CPU load. Ties keep
/// insertion order. `None` if no candidate has reported stats yet.
fn least_playing<'a>(candidates: &[&'a Arc<Node>]) -> Option<&'a Arc<Node>> {
    candidates
        .iter()
        .filter_map(|node| node.stats().map(|stats| (*node, stats)))
        .min_by(|(_, a), (_, b)| {
            a.playing_players
                .cmp(&b.playing_players)
                .then_with(|| a.cpu_load().total_cmp(&b.cpu_load()))
        })
        .map(|(node, _)| node)
}

fn lowest_score<'a>(
    candidates: &[&'a Arc<Node>],
    score: impl Fn(&crate::model::NodeStats) -> f64,
) -> Option<&'a Arc<Node>> {
    candidates
        .iter()
        .filter_map(|node| node.stats().map(|stats| (*node, score(&stats))))
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(CmpOrdering::Equal))
        .map(|(node, _)| node)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::event::{EventBus, PlayerEvent};
    use crate::model::voice::VoiceServerUpdate;
    use crate::model::TrackHandle;
    use crate::node::testing::{mock_node, Remote};
    use crate::player::testing::wait_for_state;
    use crate::model::filters::Filters;
    use crate::player::{LoopMode, PlayOptions};

    const GUILD: &str = "42";

    fn ids(pool: &NodePool, hint: Option<&str>, rounds: usize) -> Vec<String> {
        (0..rounds)
            .map(|_| pool.select(hint, None).unwrap().identifier().to_string())
            .collect()
    }

    fn pool_of(remotes: &[&Remote], balance: Balance) -> NodePool {
        NodePool::new(remotes.iter().map(|r| Arc::clone(&r.node)).collect(), balance).unwrap()
    }

    #[tokio::test]
    async fn least_playing_prefers_fewest_players_then_cpu() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(&[&a, &b], Balance::LeastPlaying);

        a.stats(3, 0.1).await;
        b.stats(1, 0.9).await;
        assert_eq!(ids(&pool, None, 2), ["b", "b"]);

        a.stats(2, 0.5).await;
        b.stats(2, 0.2).await;
        assert_eq!(ids(&pool, None, 1), ["b"]);

        b.stats(2, 0.5).await;
        assert_eq!(ids(&pool, None, 1), ["a"]);
    }

    #[tokio::test]
    async fn nodes_without_stats_rank_last() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(&[&a, &b], Balance::LeastPlaying);

        b.stats(10, 0.9).await;
        assert_eq!(ids(&pool, None, 2), ["b", "b"]);
    }

    #[tokio::test]
    async fn round_robin_when_nobody_reported_stats() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(&[&a, &b], Balance::LeastPlaying);
        assert_eq!(ids(&pool, None, 3), ["a", "b", "a"]);

        let explicit = pool_of(&[&a, &b], Balance::RoundRobin);
        a.stats(0, 0.0).await;
        assert_eq!(ids(&explicit, None, 2), ["a", "b"]);
    }

    #[tokio::test]
    async fn weighted_balance_scores_nodes() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(
            &[&a, &b],
            Balance::Weighted {
                players: 1.0,
                cpu: 100.0,
                memory: 0.0,
            },
        );

        a.stats(1, 0.9).await;
        b.stats(5, 0.1).await;
        assert_eq!(ids(&pool, None, 1), ["b"]);
    }

    #[tokio::test]
    async fn only_connected_nodes_are_candidates() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(&[&a, &b], Balance::LeastPlaying);

        a.set_state(ConnectionState::Reconnecting);
        assert_eq!(ids(&pool, None, 2), ["b", "b"]);
        assert!(matches!(pool.select(None, Some("b")), Err(ClientError::NoAvailableNode)));

        b.set_state(ConnectionState::Failed);
        assert!(matches!(pool.select(None, None), Err(ClientError::NoAvailableNode)));
    }

    #[tokio::test]
    async fn hints_pick_by_identifier_or_region() {
        let a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = pool_of(&[&a, &b], Balance::LeastPlaying);
        a.stats(0, 0.0).await;
        b.stats(9, 0.9).await;

        assert_eq!(ids(&pool, Some("b"), 1), ["b"]);
        assert_eq!(ids(&pool, Some("nowhere"), 1), ["a"]);

        b.set_state(ConnectionState::Failed);
        assert_eq!(ids(&pool, Some("b"), 1), ["a"]);
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_rejected() {
        let a = mock_node("a").await;
        let again = mock_node("a").await;
        let result = NodePool::new(vec![Arc::clone(&a.node), Arc::clone(&again.node)], Balance::default());
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        player: Player,
        events: mpsc::Receiver<PlayerEvent>,
    }

    /// A player on `remote` that is connected and playing `A` with `B` and `C` queued.
    async fn playing(remote: &mut Remote) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let bus = EventBus::default();
        let events = bus.subscribe(64);
        let node = Arc::clone(&remote.node);
        let weak = Arc::downgrade(&registry);
        let player = registry
            .get_or_create(GUILD, || async move { Ok(Player::spawn(GUILD.into(), node, bus, None, weak).await) })
            .await
            .unwrap();

        player.voice_state("sess".into(), Some("7".into())).await.unwrap();
        player
            .voice_server(VoiceServerUpdate {
                guild_id: GUILD.into(),
                token: "tok".into(),
                endpoint: "eu.discord.media".into(),
            })
            .await
            .unwrap();
        remote.player_update(GUILD, 0, true).await;
        wait_for_state(&player, PlayerState::Stopped).await;

        player.set_volume(80).await.unwrap();
        player
            .enqueue([TrackHandle::from_encoded("B"), TrackHandle::from_encoded("C")])
            .await
            .unwrap();
        player
            .play(TrackHandle::from_encoded("A"), PlayOptions::default())
            .await
            .unwrap();
        remote.frame_with_op("play").await;

        remote.player_update(GUILD, 45_000, true).await;
        let mut info = player.watch();
        tokio::time::timeout(Duration::from_secs(2), info.wait_for(|i| i.position_ms == 45_000))
            .await
            .unwrap()
            .unwrap();

        Fixture {
            registry,
            player,
            events,
        }
    }

    async fn next_matching(
        events: &mut mpsc::Receiver<PlayerEvent>,
        matches: impl Fn(&PlayerEvent) -> bool,
    ) -> PlayerEvent {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.expect("event bus closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not emitted in time")
    }

    #[tokio::test]
    async fn failed_node_hands_playback_to_a_survivor() {
        let mut a = mock_node("a").await;
        let mut b = mock_node("b").await;
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let mut fixture = playing(&mut a).await;
        let mut filters = Filters::default();
        filters.timescale.speed = Some(1.25);
        fixture.player.set_filters(filters).await.unwrap();
        fixture.player.set_loop_mode(LoopMode::Queue).await.unwrap();
        let before = fixture.player.snapshot().await.unwrap();
        let watchers = pool.spawn_failover(&fixture.registry, Duration::from_secs(2));

        a.set_state(ConnectionState::Failed);

        let voice = b.frame().await;
        assert_eq!(voice["op"], "voiceUpdate");
        assert_eq!(voice["sessionId"], "sess");
        let play = b.frame().await;
        assert_eq!(play["op"], "play");
        assert_eq!(play["track"], "A");
        assert_eq!(play["volume"], 80);
        assert_eq!(play["pause"], false);
        let start = play["startTime"].as_u64().unwrap();
        assert!((45_000..47_000).contains(&start), "resumed at {}", start);
        let applied = b.frame().await;
        assert_eq!(applied["op"], "filters");
        assert_eq!(applied["timescale"]["speed"], 1.25);

        let player = fixture.player.clone();
        let volume = tokio::spawn(async move { player.set_volume(90).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!volume.is_finished(), "command ran during migration");

        b.player_update(GUILD, start, true).await;
        assert_eq!(volume.await.unwrap().unwrap(), 90);
        let migrated = next_matching(&mut fixture.events, |e| matches!(e, PlayerEvent::Migrated { .. })).await;
        assert_eq!(
            migrated,
            PlayerEvent::Migrated {
                guild_id: GUILD.into(),
                from: "a".into(),
                to: "b".into(),
            }
        );

        let after = fixture.player.snapshot().await.unwrap();
        assert_eq!(fixture.player.node_id(), "b");
        assert_eq!(fixture.player.state(), PlayerState::Playing);
        assert_eq!(after.queue, before.queue);
        assert_eq!(after.current_track, before.current_track);
        assert_eq!(after.loop_mode, LoopMode::Queue);
        assert_eq!(after.filters, before.filters);
        assert_eq!(after.volume, 90);

        for watcher in watchers {
            watcher.abort();
        }
    }

    #[tokio::test]
    async fn migration_times_out_without_a_replacement() {
        let mut a = mock_node("a").await;
        let b = mock_node("b").await;
        b.set_state(ConnectionState::Failed);
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let mut fixture = playing(&mut a).await;

        a.set_state(ConnectionState::Failed);
        let result = pool.migrate(&fixture.player, "a", Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ClientError::MigrationTimeout(ref guild)) if guild == GUILD));

        next_matching(&mut fixture.events, |e| matches!(e, PlayerEvent::MigrationTimeout { .. })).await;
        assert_eq!(fixture.player.state(), PlayerState::Stopped);
        let queue: Vec<String> = fixture
            .player
            .queue()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.encoded)
            .collect();
        assert_eq!(queue, ["A", "B", "C"]);

        assert!(matches!(
            fixture.player.play_next().await,
            Err(ClientError::NodeUnavailable(_))
        ));
        assert_eq!(fixture.player.queue().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stranded_player_moves_to_the_next_node_that_connects() {
        let mut a = mock_node("a").await;
        let mut b = mock_node("b").await;
        b.set_state(ConnectionState::Failed);
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let mut fixture = playing(&mut a).await;
        let watchers = pool.spawn_failover(&fixture.registry, Duration::from_millis(300));

        a.set_state(ConnectionState::Failed);
        next_matching(&mut fixture.events, |e| matches!(e, PlayerEvent::MigrationTimeout { .. })).await;
        assert_eq!(fixture.player.node_id(), "a");

        b.set_state(ConnectionState::Connected);
        let migrated = next_matching(&mut fixture.events, |e| matches!(e, PlayerEvent::Migrated { .. })).await;
        assert!(matches!(migrated, PlayerEvent::Migrated { ref to, .. } if to == "b"));
        assert_eq!(b.frame().await["op"], "voiceUpdate");
        assert_eq!(b.frame().await["volume"], 80);

        assert_eq!(fixture.player.play_next().await.unwrap(), Some(TrackHandle::from_encoded("A")));
        assert_eq!(b.frame_with_op("play").await["track"], "A");
        let queue: Vec<String> = fixture
            .player
            .queue()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.encoded)
            .collect();
        assert_eq!(queue, ["B", "C"]);

        for watcher in watchers {
            watcher.abort();
        }
    }

    #[tokio::test]
    async fn resume_position_stops_advancing_while_the_node_is_down() {
        let mut a = mock_node("a").await;
        let mut b = mock_node("b").await;
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let fixture = playing(&mut a).await;

        a.set_state(ConnectionState::Reconnecting);
        tokio::time::sleep(Duration::from_millis(500)).await;
        a.set_state(ConnectionState::Failed);

        let player = fixture.player.clone();
        let pool_ref = Arc::clone(&pool);
        let migration =
            tokio::spawn(async move { pool_ref.migrate(&player, "a", Duration::from_secs(2)).await });

        b.frame_with_op("voiceUpdate").await;
        let start = b.frame_with_op("play").await["startTime"].as_u64().unwrap();
        assert!((45_000..45_300).contains(&start), "resumed at {}", start);

        b.player_update(GUILD, start, true).await;
        migration.await.unwrap().unwrap();
        assert_eq!(fixture.player.node_id(), "b");
    }

    #[tokio::test]
    async fn migration_times_out_when_replacement_never_connects() {
        let mut a = mock_node("a").await;
        let mut b = mock_node("b").await;
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let mut fixture = playing(&mut a).await;

        a.set_state(ConnectionState::Failed);
        let result = pool.migrate(&fixture.player, "a", Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ClientError::MigrationTimeout(_))));
        assert_eq!(b.frame_with_op("play").await["track"], "A");

        next_matching(&mut fixture.events, |e| matches!(e, PlayerEvent::MigrationTimeout { .. })).await;
        assert_eq!(fixture.player.state(), PlayerState::Stopped);
    }

    #[tokio::test]
    async fn destroyed_players_are_not_migrated() {
        let mut a = mock_node("a").await;
        let b = mock_node("b").await;
        let pool = Arc::new(pool_of(&[&a, &b], Balance::LeastPlaying));
        let fixture = playing(&mut a).await;
        fixture.player.disconnect().await.unwrap();

        a.set_state(ConnectionState::Failed);
        let result = pool.migrate(&fixture.player, "a", Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ClientError::PlayerDestroyed)));
    }
}
