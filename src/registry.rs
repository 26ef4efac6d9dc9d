//! Guild → player map.
//!
//! Each guild gets a slot guarded by its own async mutex, so creating, fetching and destroying
//! players for one guild is serialized without blocking any other guild.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::Snowflake;
use crate::player::{Player, PlayerState};

type Slot = Arc<Mutex<Option<Player>>>;

#[derive(Default)]
pub struct SessionRegistry {
    slots: DashMap<Snowflake, Slot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, guild_id: &str) -> Option<Slot> {
        self.slots.get(guild_id).map(|slot| Arc::clone(slot.value()))
    }

    fn is_current(&self, guild_id: &str, slot: &Slot) -> bool {
        self.slots
            .get(guild_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn release(&self, guild_id: &str, slot: &Slot) {
        self.slots.remove_if(guild_id, |_, current| Arc::ptr_eq(current, slot));
    }

    pub async fn get(&self, guild_id: &str) -> Option<Player> {
        let slot = self.slot(guild_id)?;
        let player = slot.lock().await.clone();
        player.filter(|player| player.state() != PlayerState::Destroyed)
    }

    /// Returns the guild's player, running `create` only if there is none. Concurrent calls for
    /// the same guild all get the same player.
    pub(crate) async fn get_or_create<F, Fut>(&self, guild_id: &str, create: F) -> Result<Player>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Player>>,
    {
        loop {
            let slot = Arc::clone(self.slots.entry(guild_id.to_string()).or_default().value());
            let mut player = slot.lock().await;
            // Destroyed and released while we waited for the lock.
            if !self.is_current(guild_id, &slot) {
                continue;
            }
            if let Some(existing) = player.as_ref() {
                if existing.state() != PlayerState::Destroyed {
                    return Ok(existing.clone());
                }
            }

            let created = match create().await {
                Ok(created) => created,
                Err(e) => {
                    if player.is_none() {
                        self.release(guild_id, &slot);
                    }
                    return Err(e);
                }
            };
            debug!("registered player for guild {}", guild_id);
            *player = Some(created.clone());
            return Ok(created);
        }
    }

    /// Shuts the guild's player down and drops it. `false` if there was none.
    pub async fn destroy(&self, guild_id: &str) -> Result<bool> {
        let Some(slot) = self.slot(guild_id) else {
            return Ok(false);
        };
        let mut player = slot.lock().await;
        let result = match player.take() {
            Some(existing) => existing.shutdown().await.map(|_| true),
            None => Ok(false),
        };
        self.release(guild_id, &slot);
        result
    }

    /// Drops `player` if it is still the one registered for its guild.
    pub(crate) async fn forget(&self, player: &Player) {
        let guild_id = player.guild_id();
        let Some(slot) = self.slot(guild_id) else {
            return;
        };
        let mut current = slot.lock().await;
        if current.as_ref().is_some_and(|current| current.same_as(player)) {
            current.take();
            self.release(guild_id, &slot);
        }
    }

    pub async fn players(&self) -> Vec<Player> {
        let slots: Vec<Slot> = self.slots.iter().map(|slot| Arc::clone(slot.value())).collect();
        let mut players = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(player) = slot.lock().await.clone() {
                players.push(player);
            }
        }
        players
    }

    pub(crate) async fn destroy_all(&self) {
        let guilds: Vec<Snowflake> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        for guild_id in guilds {
            if let Err(e) = self.destroy(&guild_id).await {
                debug!("destroying player for guild {}: {}", guild_id, e);
            }
        }
    }
}
