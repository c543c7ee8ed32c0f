use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// 既定のシグナリングサーバー
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8083";
/// WebSocket接続のタイムアウト
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// 接続完了から認証メッセージ送信までの待ち時間
pub const DEFAULT_AUTH_DELAY_MS: u64 = 100;

/// ICE candidate（シグナリングの `data` と同じ形）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// 空文字列の candidate は end-of-candidates マーカー
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// TURNサーバー設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// クライアント設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(alias = "signalingServerUrl")]
    pub signaling_server_url: String,
    /// 空の場合はホスト候補のみ（ローカルネットワーク専用）
    #[serde(alias = "stunServers")]
    pub stun_servers: Vec<String>,
    #[serde(alias = "turnServers")]
    pub turn_servers: Vec<TurnServer>,
    /// 未指定なら接続ごとに生成する
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
    pub connect_timeout_ms: u64,
    pub auth_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_server_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            client_id: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auth_delay_ms: DEFAULT_AUTH_DELAY_MS,
        }
    }
}

impl ClientConfig {
    pub fn new(signaling_server_url: impl Into<String>) -> Self {
        Self {
            signaling_server_url: signaling_server_url.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_delay(&self) -> Duration {
        Duration::from_millis(self.auth_delay_ms)
    }
}

/// PeerConnectionの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// disconnected コールバックを発火すべき状態か
    pub fn is_lost(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// シグナリングサービスからセッションへのメッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Authenticated { client_id: Option<String> },
    AuthRejected { message: String },
    Offer { sdp: String },
    OfferRejected { message: String },
    RemoteCandidate(IceCandidate),
}

/// セッションからシグナリングサービスへの送信要求
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingResponse {
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    RequestOffer { source_id: Option<String> },
    /// 任意のJSONオブジェクト（switch_source など）
    Control(serde_json::Value),
    Close,
}

/// シグナリングの書き込みタスクへの送信ハンドル
///
/// ソケットが閉じた後の送信はキューに積まず破棄する。
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingResponse>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<SignalingResponse>) -> Self {
        Self { tx }
    }

    /// 書き込み側が生きていれば送信してtrueを返す
    pub fn send(&self, response: SignalingResponse) -> bool {
        if self.tx.is_closed() {
            warn!("Signaling socket is not open, dropping {:?}", response_kind(&response));
            return false;
        }
        if let Err(e) = self.tx.send(response) {
            warn!("Signaling socket is not open, dropping {:?}", response_kind(&e.0));
            return false;
        }
        true
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// WebSocketを閉じる
    pub fn close(&self) {
        let _ = self.tx.send(SignalingResponse::Close);
    }
}

fn response_kind(response: &SignalingResponse) -> &'static str {
    match response {
        SignalingResponse::Answer { .. } => "answer",
        SignalingResponse::IceCandidate(_) => "ice_candidate",
        SignalingResponse::RequestOffer { .. } => "request_offer",
        SignalingResponse::Control(_) => "control",
        SignalingResponse::Close => "close",
    }
}
