use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mesh_voice::mesh::{
    self,
    audio::{AudioOutput, NullOutput},
    device::{CpalDevices, CpalOutput},
    signal::WsConnector,
    MeshConfig, MeshParts,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mesh_client")]
#[command(about = "Join a mesh voice room from the terminal", long_about = None)]
struct Args {
    /// Relay base URL
    #[arg(long, env = "RELAY_URL", default_value = "http://localhost:5000")]
    url: String,

    /// Room to join
    #[arg(long, env = "ROOM_ID")]
    room: String,

    /// Signed access token
    #[arg(long, env = "ACCESS_TOKEN")]
    token: String,

    /// STUN/TURN server, repeatable
    #[arg(long = "ice", default_value = "stun:stun.l.google.com:19302")]
    ice_servers: Vec<String>,

    /// Join with the microphone open
    #[arg(long)]
    unmuted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = MeshConfig { ice_servers: args.ice_servers, start_muted: !args.unmuted, ..Default::default() };
    // 沒有喇叭也能加入，只是聽不到
    let output: Arc<dyn AudioOutput> = match CpalOutput::open() {
        Ok(out) => Arc::new(out),
        Err(e) => {
            warn!(error = %e, "no output device, remote audio is discarded");
            Arc::new(NullOutput)
        }
    };
    let parts = MeshParts::webrtc(&cfg, Arc::new(CpalDevices), Arc::new(WsConnector::new(args.url)), output)?;
    let handle = mesh::spawn(cfg, args.room, args.token, parts);
    println!("commands: m = mute/unmute, r = refresh roster, q = leave");

    let mut status = handle.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = handle.finished() => break,
            changed = status.changed() => {
                if changed.is_err() { break; }
                let s = status.borrow_and_update().clone();
                println!(
                    "[{}] {} | peers {} | online {}",
                    s.status,
                    if s.muted { "muted" } else { "live" },
                    s.connected_peers,
                    s.participants.iter().map(|p| p.user.name.as_str()).collect::<Vec<_>>().join(", "),
                );
            }
            line = lines.next_line() => match line?.as_deref().map(str::trim) {
                Some("m") => handle.toggle_mute(),
                Some("r") => handle.refresh_participants(),
                Some("q") => handle.leave(),
                None => break,
                Some(_) => {}
            },
        }
    }

    let last = handle.status();
    handle.dispose().await;
    info!(status = %last.status, "left room");
    Ok(())
}
