pub mod filters;
pub mod voice;

use serde::{Deserialize, Serialize};

use self::filters::Filters;
use self::voice::VoiceServerUpdate;

pub type Snowflake = String;

/// A playable track.
///
/// Only [`encoded`](TrackHandle::encoded) is ever sent back to a node; the rest is display
/// metadata and may be missing for tracks that were only seen inside node events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Track", into = "Track")]
pub struct TrackHandle {
    pub encoded: String,
    pub identifier: String,
    pub title: String,
    pub author: String,
    pub duration_ms: u64,
    pub source_name: String,
    pub uri: Option<String>,
    pub is_stream: bool,
    pub is_seekable: bool,
}

impl TrackHandle {
    /// A handle that knows nothing but its encoded identifier.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
            identifier: String::new(),
            title: String::new(),
            author: String::new(),
            duration_ms: 0,
            source_name: String::new(),
            uri: None,
            is_stream: false,
            is_seekable: true,
        }
    }
}

/// Track as the node serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    #[serde(alias = "track")]
    pub encoded: String,
    pub info: TrackInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(default)]
    pub identifier: String,
    #[serde(default = "default_true")]
    pub is_seekable: bool,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

fn default_true() -> bool {
    true
}

impl From<Track> for TrackHandle {
    fn from(track: Track) -> Self {
        let info = track.info;
        Self {
            encoded: track.encoded,
            identifier: info.identifier,
            title: info.title,
            author: info.author,
            duration_ms: info.length,
            source_name: info.source_name,
            uri: info.uri,
            is_stream: info.is_stream,
            is_seekable: info.is_seekable,
        }
    }
}

impl From<TrackHandle> for Track {
    fn from(handle: TrackHandle) -> Self {
        Self {
            encoded: handle.encoded,
            info: TrackInfo {
                identifier: handle.identifier,
                is_seekable: handle.is_seekable,
                author: handle.author,
                length: handle.duration_ms,
                is_stream: handle.is_stream,
                position: 0,
                title: handle.title,
                uri: handle.uri,
                source_name: handle.source_name,
            },
        }
    }
}

/// Tracks inside node events are either bare encoded strings or full objects,
/// depending on the node version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TrackRef {
    Encoded(String),
    Full(TrackHandle),
}

impl TrackRef {
    pub fn encoded(&self) -> &str {
        match self {
            TrackRef::Encoded(encoded) => encoded,
            TrackRef::Full(track) => &track.encoded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackError {
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    pub cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum LoadType {
    #[serde(rename = "TRACK_LOADED", alias = "TRACK", alias = "track")]
    Track,
    #[serde(rename = "PLAYLIST_LOADED", alias = "PLAYLIST", alias = "playlist")]
    Playlist,
    #[serde(rename = "SEARCH_RESULT", alias = "SEARCH", alias = "search")]
    Search,
    #[serde(rename = "NO_MATCHES", alias = "empty")]
    NoMatches,
    #[serde(rename = "LOAD_FAILED", alias = "error")]
    LoadFailed,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: LoadType,
    #[serde(default)]
    playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    tracks: Vec<TrackHandle>,
    #[serde(default)]
    exception: Option<TrackError>,
}

/// Response of `GET /loadtracks`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawLoadResult")]
pub enum LoadResult {
    Track(TrackHandle),
    Playlist { info: PlaylistInfo, tracks: Vec<TrackHandle> },
    Search(Vec<TrackHandle>),
    NoMatches,
    LoadFailed(TrackError),
}

impl TryFrom<RawLoadResult> for LoadResult {
    type Error = String;

    fn try_from(raw: RawLoadResult) -> Result<Self, Self::Error> {
        Ok(match raw.load_type {
            LoadType::Track => match raw.tracks.into_iter().next() {
                Some(track) => LoadResult::Track(track),
                None => return Err("track load result without a track".into()),
            },
            LoadType::Playlist => LoadResult::Playlist {
                info: raw.playlist_info.unwrap_or(PlaylistInfo {
                    name: String::new(),
                    selected_track: -1,
                }),
                tracks: raw.tracks,
            },
            LoadType::Search => LoadResult::Search(raw.tracks),
            LoadType::NoMatches => LoadResult::NoMatches,
            LoadType::LoadFailed => LoadResult::LoadFailed(raw.exception.unwrap_or(TrackError {
                message: None,
                severity: "FAULT".into(),
                cause: None,
            })),
        })
    }
}

impl LoadResult {
    /// Every track in the result, in order.
    pub fn tracks(&self) -> &[TrackHandle] {
        match self {
            LoadResult::Track(track) => std::slice::from_ref(track),
            LoadResult::Playlist { tracks, .. } | LoadResult::Search(tracks) => tracks,
            LoadResult::NoMatches | LoadResult::LoadFailed(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Load report a node pushes about itself roughly once a minute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

impl NodeStats {
    pub fn uptime_ms(&self) -> u64 {
        self.uptime
    }

    pub fn cpu_load(&self) -> f64 {
        self.cpu.lavalink_load
    }

    pub fn memory_used(&self) -> u64 {
        self.memory.used
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStateFrame {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ping: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: Snowflake,
    pub state: PlayerStateFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    #[serde(alias = "finished")]
    Finished,
    #[serde(alias = "loadFailed")]
    LoadFailed,
    #[serde(alias = "stopped")]
    Stopped,
    #[serde(alias = "replaced")]
    Replaced,
    #[serde(alias = "cleanup")]
    Cleanup,
}

impl TrackEndReason {
    /// Whether the queue should move on after a track ended this way.
    pub fn advances_queue(self) -> bool {
        matches!(
            self,
            TrackEndReason::Finished | TrackEndReason::LoadFailed | TrackEndReason::Cleanup
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { guild_id: Snowflake, track: TrackRef },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        guild_id: Snowflake,
        track: TrackRef,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        guild_id: Snowflake,
        track: TrackRef,
        exception: TrackError,
    },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        guild_id: Snowflake,
        track: TrackRef,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        guild_id: Snowflake,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

/// Anything a node can push over its control socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingFrame {
    Stats(NodeStats),
    PlayerUpdate(PlayerUpdate),
    Event(ServerEvent),
}

/// Control frames sent to a node. The guild id is attached by
/// [`Node::submit`](crate::node::Node::submit).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Op {
    VoiceUpdate {
        session_id: String,
        event: VoiceServerUpdate,
    },
    Play {
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
        no_replace: bool,
        pause: bool,
    },
    Stop,
    Pause {
        pause: bool,
    },
    Seek {
        position: u64,
    },
    Volume {
        volume: u16,
    },
    Filters(Filters),
    Destroy,
}

impl Op {
    /// JSON text of this op addressed to `guild_id`.
    pub fn to_frame(&self, guild_id: &str) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("guildId".into(), guild_id.into());
        }
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn track_json(encoded: &str) -> Value {
        json!({
            "encoded": encoded,
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "Rick Astley",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": "Never Gonna Give You Up",
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "sourceName": "youtube"
            }
        })
    }

    #[test]
    fn load_result_accepts_v3_and_short_tags() {
        let v3 = json!({
            "loadType": "TRACK_LOADED",
            "playlistInfo": {},
            "tracks": [track_json("QAAA")]
        });
        let short = json!({ "loadType": "TRACK", "tracks": [track_json("QAAA")] });

        for raw in [v3, short] {
            let result: LoadResult = serde_json::from_value(raw).unwrap();
            match result {
                LoadResult::Track(track) => {
                    assert_eq!(track.encoded, "QAAA");
                    assert_eq!(track.duration_ms, 212_000);
                    assert_eq!(track.source_name, "youtube");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn load_result_playlist_and_failures() {
        let playlist: LoadResult = serde_json::from_value(json!({
            "loadType": "PLAYLIST_LOADED",
            "playlistInfo": { "name": "Mix", "selectedTrack": 1 },
            "tracks": [track_json("A"), track_json("B")]
        }))
        .unwrap();
        assert_eq!(playlist.tracks().len(), 2);
        assert!(matches!(playlist, LoadResult::Playlist { ref info, .. } if info.name == "Mix"));

        let empty: LoadResult =
            serde_json::from_value(json!({ "loadType": "NO_MATCHES", "tracks": [] })).unwrap();
        assert_eq!(empty, LoadResult::NoMatches);

        let failed: LoadResult = serde_json::from_value(json!({
            "loadType": "LOAD_FAILED",
            "tracks": [],
            "exception": { "message": "blocked", "severity": "COMMON" }
        }))
        .unwrap();
        assert!(matches!(failed, LoadResult::LoadFailed(ref e) if e.message.as_deref() == Some("blocked")));

        let broken = serde_json::from_value::<LoadResult>(json!({ "loadType": "TRACK", "tracks": [] }));
        assert!(broken.is_err());
    }

    #[test]
    fn decodes_incoming_frames() {
        let stats: IncomingFrame = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 2,
            "uptime": 1000,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.25 }
        }))
        .unwrap();
        match stats {
            IncomingFrame::Stats(stats) => {
                assert_eq!(stats.playing_players, 2);
                assert_eq!(stats.cpu_load(), 0.25);
                assert_eq!(stats.memory_used(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let update: IncomingFrame = serde_json::from_value(json!({
            "op": "playerUpdate",
            "guildId": "42",
            "state": { "time": 5, "position": 45000, "connected": true, "ping": 12 }
        }))
        .unwrap();
        assert!(matches!(
            update,
            IncomingFrame::PlayerUpdate(PlayerUpdate { ref guild_id, state }) if guild_id == "42" && state.position == 45000
        ));

        let end: IncomingFrame = serde_json::from_value(json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "42",
            "track": "QAAA",
            "reason": "LOAD_FAILED"
        }))
        .unwrap();
        match end {
            IncomingFrame::Event(ServerEvent::TrackEnd { track, reason, .. }) => {
                assert_eq!(track.encoded(), "QAAA");
                assert_eq!(reason, TrackEndReason::LoadFailed);
                assert!(reason.advances_queue());
            }
            other => panic!("unexpected {:?}", other),
        }

        let closed: IncomingFrame = serde_json::from_value(json!({
            "op": "event",
            "type": "WebSocketClosedEvent",
            "guildId": "42",
            "code": 4006,
            "reason": "Session is no longer valid.",
            "byRemote": true
        }))
        .unwrap();
        assert!(matches!(
            closed,
            IncomingFrame::Event(ServerEvent::WebSocketClosed { code: 4006, by_remote: true, .. })
        ));
    }

    #[test]
    fn unknown_ops_fail_to_decode() {
        assert!(serde_json::from_str::<IncomingFrame>(r#"{"op":"ready","resumed":false}"#).is_err());
        assert!(serde_json::from_str::<IncomingFrame>("not json").is_err());
    }

    #[test]
    fn ops_serialize_with_guild_id() {
        let play = Op::Play {
            track: "QAAA".into(),
            start_time: Some(45_000),
            end_time: None,
            volume: Some(80),
            no_replace: false,
            pause: false,
        };
        let frame: Value = serde_json::from_str(&play.to_frame("42").unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({
                "op": "play",
                "guildId": "42",
                "track": "QAAA",
                "startTime": 45000,
                "volume": 80,
                "noReplace": false,
                "pause": false
            })
        );

        let voice = Op::VoiceUpdate {
            session_id: "sess".into(),
            event: VoiceServerUpdate {
                guild_id: "42".into(),
                token: "tok".into(),
                endpoint: "eu.discord.media".into(),
            },
        };
        let frame: Value = serde_json::from_str(&voice.to_frame("42").unwrap()).unwrap();
        assert_eq!(frame["op"], "voiceUpdate");
        assert_eq!(frame["sessionId"], "sess");
        assert_eq!(frame["event"]["guild_id"], "42");

        let destroy: Value = serde_json::from_str(&Op::Destroy.to_frame("7").unwrap()).unwrap();
        assert_eq!(destroy, json!({ "op": "destroy", "guildId": "7" }));
    }

    #[test]
    fn track_handle_round_trips_through_wire_shape() {
        let handle: TrackHandle = serde_json::from_value(track_json("QAAA")).unwrap();
        let back = serde_json::to_value(&handle).unwrap();
        assert_eq!(back["encoded"], "QAAA");
        assert_eq!(back["info"]["length"], 212000);
        assert_eq!(serde_json::from_value::<TrackHandle>(back).unwrap(), handle);
    }
}
