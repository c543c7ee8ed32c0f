use anyhow::{Context, Result};
use clap::Parser;
use client::{ClientConfig, ClientEvent, EventHandlers, TrackRecorder, WebRtcClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "viewerd")]
#[command(about = "Analyzer stream viewer daemon")]
struct Args {
    /// Signaling server WebSocket URL
    #[arg(long, env = "VIEWERD_SIGNALING_URL", default_value = core_types::DEFAULT_SIGNALING_URL)]
    signaling_url: String,

    /// STUN server URL (repeatable). Without one only host candidates are used
    #[arg(long = "stun")]
    stun_servers: Vec<String>,

    /// Client configuration JSON (overrides --signaling-url and --stun)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source to request from the server
    #[arg(long)]
    source_id: Option<String>,

    /// Directory to write received JPEG frames into
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// File to record the received video track into (.h264 or .ivf)
    #[arg(long)]
    video_out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()));
    }
    let mut config = ClientConfig::new(args.signaling_url.clone());
    config.stun_servers = args.stun_servers.clone();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ログ設定
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;
    info!("Starting viewer daemon");
    info!(
        "Signaling URL: {}, STUN servers: {:?}",
        config.signaling_server_url, config.stun_servers
    );

    if let Some(dir) = &args.frames_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let client = Arc::new(WebRtcClient::new(config));
    let (handlers, mut events) = EventHandlers::channel();
    client.set_event_handlers(handlers);

    if let Some(path) = &args.video_out {
        info!("Recording video track to {}", path.display());
        client.set_sink(Arc::new(TrackRecorder::new(path.clone())));
    }

    client.connect().await.context("Failed to connect")?;

    let mut frame_count: u64 = 0;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Connected => {
                        info!("Connected as {:?}", client.client_id());
                        client.request_video_stream(args.source_id.clone());
                    }
                    ClientEvent::VideoStream(stream) => {
                        info!("Video stream ready: {:?}", stream);
                    }
                    ClientEvent::JpegFrame(frame) => {
                        frame_count += 1;
                        debug!("JPEG frame #{} ({} bytes)", frame_count, frame.len());
                        if let Some(dir) = &args.frames_dir {
                            let path = dir.join(format!("frame_{:06}.jpg", frame_count));
                            if let Err(e) = tokio::fs::write(&path, &frame).await {
                                warn!("Failed to write {}: {}", path.display(), e);
                            }
                        }
                    }
                    ClientEvent::Error(e) => error!("Client error: {}", e),
                    ClientEvent::Disconnected => {
                        info!("Disconnected");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    client.disconnect().await;
    info!("Viewer daemon stopped ({} JPEG frames received)", frame_count);
    Ok(())
}
