//! Console stand-in for a bot's gateway. Each stdin line is either a raw dispatch
//! (`VOICE_STATE_UPDATE {...}` / `VOICE_SERVER_UPDATE {...}`) or a command
//! (`join <guild> <channel>`, `play <guild> <query>`, `skip <guild>`, `leave <guild>`).

use async_trait::async_trait;
use lavamase::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn on_track_start(&self, _ctx: Context, guild_id: Snowflake, track: TrackHandle) {
        println!("[{}] now playing {} by {}", guild_id, track.title, track.author);
    }

    async fn on_queue_end(&self, _ctx: Context, guild_id: Snowflake) {
        println!("[{}] queue finished", guild_id);
    }

    async fn on_migrated(&self, _ctx: Context, guild_id: Snowflake, from: String, to: String) {
        println!("[{}] moved from node {} to {}", guild_id, from, to);
    }

    async fn on_migration_timeout(&self, ctx: Context, guild_id: Snowflake) {
        println!("[{}] no node took over, dropping the session", guild_id);
        let _ = ctx.client.destroy_player(&guild_id).await;
    }
}

async fn handle_line(client: &Client, line: &str) -> Result<()> {
    let (cmd, args) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "VOICE_STATE_UPDATE" => client.voice_state_update(serde_json::from_str(args)?).await?,
        "VOICE_SERVER_UPDATE" => client.voice_server_update(serde_json::from_str(args)?).await?,

        "join" => {
            let Some((guild_id, channel_id)) = args.split_once(' ') else {
                println!("`join <guild> <channel>`");
                return Ok(());
            };
            let player = client.create_player(guild_id, None).await?;
            player.join(channel_id.trim()).await?;
        }

        "play" => {
            let Some((guild_id, query)) = args.split_once(' ') else {
                println!("`play <guild> <query>`");
                return Ok(());
            };
            let identifier = if query.starts_with("http") {
                query.to_string()
            } else {
                format!("ytsearch:{}", query)
            };

            let Some(track) = client.load_tracks(&identifier).await?.tracks().first().cloned() else {
                println!("nothing found for {}", query);
                return Ok(());
            };
            let player = client.create_player(guild_id, None).await?;
            if player.play(track.clone(), PlayOptions::default().no_replace()).await?.is_none() {
                player.enqueue([track.clone()]).await?;
                println!("[{}] queued {}", guild_id, track.title);
            }
        }

        "skip" => {
            if let Some(player) = client.get_player(args.trim()).await {
                player.skip().await?;
            }
        }

        "leave" => {
            client.destroy_player(args.trim()).await?;
        }

        _ => println!("unknown command {}", cmd),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let user_id = std::env::var("BOT_USER_ID").expect("Set BOT_USER_ID to the bot's user id");
    let host = std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".into());
    let password = std::env::var("LAVALINK_PASSWORD").unwrap_or_else(|_| "youshallnotpass".into());

    // The real bot would write these to its gateway socket.
    let (gateway_tx, mut gateway_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        while let Some(payload) = gateway_rx.recv().await {
            println!("gateway <- {}", payload);
        }
    });

    let client = Client::builder(user_id)
        .node(NodeConfig::new("main", host, 2333, password))
        .gateway(gateway_tx)
        .event_handler(Handler)
        .build()
        .expect("Failed to build the client");

    if let Err(e) = client.connect().await {
        eprintln!("Error: {}", e);
        return;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = handle_line(&client, line).await {
            eprintln!("Error: {}", e);
        }
    }

    client.shutdown().await;
}
