// シグナリングサーバーの疎通確認: auth → auth_success → request_offer → offer
use anyhow::{bail, Result};
use clap::Parser;
use core_types::{ClientConfig, SignalingEvent, SignalingResponse};
use signaling::SignalingClient;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "signaling-probe")]
#[command(about = "Checks that the signaling server answers request_offer with an offer")]
struct Args {
    /// Signaling server WebSocket URL
    #[arg(long, env = "VIEWERD_SIGNALING_URL", default_value = core_types::DEFAULT_SIGNALING_URL)]
    signaling_url: String,

    /// Source to request
    #[arg(long, default_value = "test_source")]
    source_id: String,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

async fn probe(args: &Args) -> Result<()> {
    let config = ClientConfig::new(args.signaling_url.clone());
    let client = SignalingClient::new(&config);
    info!("Probing {} as {}", config.signaling_server_url, client.client_id());

    let mut connection = client.connect().await?;
    let result: Result<()> = async {
        while let Some(event) = connection.events.recv().await {
            match event {
                SignalingEvent::Authenticated { client_id } => {
                    info!("auth_success ({:?}), requesting offer", client_id);
                    connection.sender.send(SignalingResponse::RequestOffer {
                        source_id: Some(args.source_id.clone()),
                    });
                }
                SignalingEvent::Offer { sdp } => {
                    if sdp.trim().is_empty() {
                        bail!("offer carried an empty SDP");
                    }
                    info!("offer received ({} bytes of SDP)", sdp.len());
                    return Ok(());
                }
                SignalingEvent::AuthRejected { message } => bail!("auth_error: {}", message),
                SignalingEvent::OfferRejected { message } => bail!("offer_error: {}", message),
                SignalingEvent::RemoteCandidate(_) => {}
            }
        }
        bail!("signaling connection closed before an offer arrived")
    }
    .await;

    connection.tasks.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match tokio::time::timeout(Duration::from_secs(args.timeout_secs), probe(&args)).await {
        Ok(Ok(())) => {
            info!("Signaling probe passed");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Signaling probe failed: {:#}", e);
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("Signaling probe timed out after {}s", args.timeout_secs);
            ExitCode::FAILURE
        }
    }
}
