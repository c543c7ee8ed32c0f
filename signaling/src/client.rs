use anyhow::{anyhow, Context, Result};
use core_types::{ClientConfig, SignalingEvent, SignalingResponse, SignalingSender};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::protocol::{dispatch_text, encode_message, encode_with_timestamp, response_to_value, ClientMessage};

/// 書き込みタスクが close 後に待つ最大時間
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 接続ごとのクライアントIDを生成
pub fn generate_client_id() -> String {
    format!("web_{}", Uuid::new_v4().simple())
}

/// シグナリングクライアント（WebSocketクライアント）
pub struct SignalingClient {
    url: String,
    client_id: String,
    connect_timeout: Duration,
    auth_delay: Duration,
}

/// 確立済みのシグナリング接続
pub struct SignalingConnection {
    pub sender: SignalingSender,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
    pub tasks: SignalingTasks,
}

/// 読み書きタスクのハンドル
pub struct SignalingTasks {
    sender: SignalingSender,
    write_handle: JoinHandle<()>,
    recv_handle: JoinHandle<()>,
}

impl SignalingTasks {
    /// close フレームを送ってタスクを止める（多重呼び出し可）
    pub async fn shutdown(self) {
        self.sender.close();
        let mut write_handle = self.write_handle;
        if timeout(SHUTDOWN_GRACE, &mut write_handle).await.is_err() {
            warn!("Signaling writer did not stop in time, aborting");
            write_handle.abort();
        }
        self.recv_handle.abort();
        debug!("Signaling tasks stopped");
    }
}

impl SignalingClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            url: config.signaling_server_url.clone(),
            client_id: config
                .client_id
                .clone()
                .unwrap_or_else(generate_client_id),
            connect_timeout: config.connect_timeout(),
            auth_delay: config.auth_delay(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// WebSocketに接続し、認証メッセージを予約して読み書きタスクを起動する
    pub async fn connect(self) -> Result<SignalingConnection> {
        let url = Url::parse(&self.url).context("Failed to parse signaling server url")?;
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| anyhow!("Signaling server connection timeout ({:?})", self.connect_timeout))?
            .context("Signaling server connection failed")?;

        info!("WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<SignalingResponse>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        // 読み込み側が終了したら書き込み側も止める
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

        let sender = SignalingSender::new(response_tx);

        let auth_text = encode_message(&ClientMessage::auth(self.client_id.clone()))?;
        let auth_delay = self.auth_delay;
        let write_handle = tokio::spawn(async move {
            // 接続直後はサーバー側の準備を待ってから認証する
            let auth_timer = sleep(auth_delay);
            tokio::pin!(auth_timer);
            let mut pending_auth = Some(auth_text);

            loop {
                tokio::select! {
                    _ = &mut auth_timer, if pending_auth.is_some() => {
                        let Some(text) = pending_auth.take() else { continue };
                        info!("Sending auth message");
                        debug!("auth: {}", text);
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            error!("Failed to send auth message: {}", e);
                            break;
                        }
                    }
                    response = response_rx.recv() => {
                        let Some(response) = response else {
                            break;
                        };
                        let Some(value) = response_to_value(response) else {
                            info!("Closing signaling socket");
                            if let Err(e) = write.send(WsMessage::Close(None)).await {
                                debug!("Close frame not sent: {}", e);
                            }
                            break;
                        };
                        let text = match encode_with_timestamp(value) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Dropping outgoing signaling message: {}", e);
                                continue;
                            }
                        };
                        debug!("Sending signaling message: {}", text);
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            error!("Failed to send message to WebSocket: {}", e);
                            break;
                        }
                    }
                    _ = &mut closed_rx => {
                        debug!("Reader finished, stopping writer");
                        break;
                    }
                }
            }
            // ここで response_rx が破棄され、以後の send は破棄扱いになる
        });

        let recv_handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        debug!("Received message: {}", text.as_str());
                        if let Some(event) = dispatch_text(text.as_str()) {
                            if event_tx.send(event).is_err() {
                                debug!("Signaling event receiver dropped");
                                break;
                            }
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        info!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {
                        debug!("Received non-text message");
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            let _ = closed_tx.send(());
            // event_tx がここで破棄され、セッション側は切断として扱う
        });

        Ok(SignalingConnection {
            sender: sender.clone(),
            events: event_rx,
            tasks: SignalingTasks {
                sender,
                write_handle,
                recv_handle,
            },
        })
    }
}
