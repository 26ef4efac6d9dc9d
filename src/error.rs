//! Error types used across the library.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// The error type returned by pretty much everything in the library.
///
/// Transport faults ([`WebSocket`](ClientError::WebSocket),
/// [`Transport`](ClientError::Transport)) are retried by the node's connection loop
/// on its own; you only see them from the first [`connect`](crate::client::Client::connect)
/// attempt. Everything else needs a decision from the caller and is returned as-is.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Not for bad status codes like 401 or 404 -- those show up as
    /// [`Api`](ClientError::Api). This is for DNS failures, TLS errors, timeouts, etc.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The string contains the status and body, like
    /// `"HTTP 401: Unauthorized"`.
    #[error("API error: {0}")]
    Api(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Bad node address, password that can't be a header value, duplicate identifier...
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The node exists but its connection is `Disconnected` or `Failed`.
    #[error("Node {0} is unavailable")]
    NodeUnavailable(String),

    #[error("No connected node is available")]
    NoAvailableNode,

    #[error("Track has an empty encoded identifier")]
    InvalidTrack,

    #[error("Current track is not seekable")]
    NotSeekable,

    #[error("Player has been destroyed")]
    PlayerDestroyed,

    /// Failover did not finish inside the migration budget. The player is left `Stopped`.
    #[error("Migration of guild {0} timed out")]
    MigrationTimeout(String),
}
