//! Async Lavalink client for Discord bots.
//!
//! A [`Client`](client::Client) keeps a pool of Lavalink nodes connected, balances new guild
//! sessions across them and moves sessions off nodes that die. Each guild gets a
//! [`Player`](player::Player) that turns the bot's voice gateway events into a node-side
//! audio session and exposes playback, queue and filter controls.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod model;
pub mod node;
pub mod player;
pub mod pool;
pub mod registry;
pub mod transport;

pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, Context};
    pub use crate::config::{Balance, NodeConfig, ReconnectPolicy};
    pub use crate::error::{ClientError, Result};
    pub use crate::event::{EventHandler, NodeEvent, PlayerEvent};
    pub use crate::model::filters::*;
    pub use crate::model::voice::*;
    pub use crate::model::*;
    pub use crate::player::{LoopMode, PlayOptions, Player, PlayerInfo, PlayerState, SessionSnapshot};
    pub use crate::transport::ConnectionState;
}
